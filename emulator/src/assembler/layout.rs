//! Assembler pass 1
//!
//! Walks the source lines and lays out memory: every instruction word at
//! its final address, address operands left as symbolic slots, labels
//! collected under their `scope:label` key, literals queued and flushed
//! when the section ends. Compound pseudo instructions (IN, OUT, RPUSH,
//! RPOP) expand here into their fixed machine sequences.

use std::collections::BTreeMap;

use tracing::debug;

use super::symbol::{SymbolTable, SymbolValue};
use super::table::{self, Kind};
use super::{parse_number, AssembleError, ErrorKind};
use crate::constants as C;
use crate::parser::lexer::{is_valid_label, register_number};
use crate::parser::line::{parse_line, unquote, SourceLine};

/// A laid-out memory word: resolved, or a symbol key for pass 2
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Slot {
    Value(C::Word),
    Symbolic(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Placement {
    pub slot: Slot,
    pub line: usize,
}

#[derive(Debug)]
pub(crate) struct Layout {
    pub symbols: SymbolTable,
    pub memory: BTreeMap<C::Address, Placement>,
    pub start_key: String,
    pub start_line: usize,
    pub address_max: C::Address,
}

/// An entry label named by a secondary START, waiting for its definition
struct Deferred {
    entry: String,
    alias: String,
}

/// A literal queued for the pool flushed at END
struct PendingLiteral {
    key: String,
    value: String,
}

#[derive(Default)]
struct Pass1 {
    symbols: SymbolTable,
    memory: BTreeMap<C::Address, Placement>,
    cursor: u32,
    scope: String,
    in_block: bool,
    started: bool,
    start_key: Option<(String, usize)>,
    deferred: Option<Deferred>,
    pending: Vec<PendingLiteral>,
    literal_seq: usize,
    line: usize,
}

/// Lay out a whole program
pub(crate) fn layout_program(source: &str) -> Result<Layout, AssembleError> {
    let mut pass = Pass1::default();

    for (index, text) in split_lines(source).into_iter().enumerate() {
        pass.line = index + 1;
        if text.trim().is_empty() {
            continue;
        }
        let parsed = parse_line(text, pass.line).map_err(|e| pass.err(ErrorKind::Syntax(e)))?;
        if parsed.is_empty() {
            continue;
        }
        pass.process(parsed)?;
    }

    if pass.in_block {
        return Err(pass.err(ErrorKind::MissingEnd));
    }
    let (start_key, start_line) = pass
        .start_key
        .take()
        .ok_or_else(|| pass.err(ErrorKind::MissingStart))?;

    debug!(words = pass.cursor, "pass 1 finished");
    Ok(Layout {
        symbols: pass.symbols,
        memory: pass.memory,
        start_key,
        start_line,
        address_max: pass.cursor.min(0xffff) as C::Address,
    })
}

/// Split on `\n`, `\r\n` or `\r`, keeping line numbers stable
fn split_lines(source: &str) -> Vec<&str> {
    let bytes = source.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                lines.push(&source[start..i]);
                i += 1;
                start = i;
            }
            b'\r' => {
                lines.push(&source[start..i]);
                i += 1;
                if bytes.get(i) == Some(&b'\n') {
                    i += 1;
                }
                start = i;
            }
            _ => i += 1,
        }
    }
    if start < bytes.len() {
        lines.push(&source[start..]);
    }
    lines
}

fn word(code: u8, r1: u8, r2: u8) -> C::Word {
    (C::Word::from(code) << 8) | (C::Word::from(r1) << 4) | C::Word::from(r2)
}

fn is_gr0(operand: &str) -> bool {
    operand.eq_ignore_ascii_case("GR0") || operand == "0"
}

impl Pass1 {
    fn err(&self, kind: ErrorKind) -> AssembleError {
        AssembleError {
            line: self.line,
            kind,
        }
    }

    fn process(&mut self, line: SourceLine) -> Result<(), AssembleError> {
        if let Some(label) = &line.label {
            if self.in_block {
                self.add_label(label)?;
                self.backpatch(label)?;
            }
        }

        let Some(mnemonic) = &line.mnemonic else {
            return Ok(());
        };
        let def = table::lookup(mnemonic)
            .ok_or_else(|| self.err(ErrorKind::IllegalMnemonic(mnemonic.clone())))?;

        if !self.in_block && def.kind != Kind::Start {
            return Err(self.err(ErrorKind::MissingStart));
        }

        let operands = &line.operands;
        match def.kind {
            Kind::RegAdr => self.reg_adr(def.code, operands, false),
            Kind::RegAdrOrReg => self.reg_adr(def.code, operands, true),
            Kind::Adr => self.adr(def.code, mnemonic, operands),
            Kind::Reg => self.reg(def.code, operands),
            Kind::NoOperand => {
                if !operands.is_empty() {
                    return Err(self.invalid_operands(operands));
                }
                self.emit_word(word(def.code, 0, 0))
            }
            Kind::Start => self.start(line.label.as_deref(), operands),
            Kind::End => self.end(line.label.as_deref(), operands),
            Kind::Ds => self.ds(operands),
            Kind::Dc => self.dc(operands),
            Kind::In => self.in_out(C::SYS_IN, operands),
            Kind::Out => self.in_out(C::SYS_OUT, operands),
            Kind::Rpush => {
                if !operands.is_empty() {
                    return Err(self.invalid_operands(operands));
                }
                for k in 1..=7 {
                    self.emit_word(word(0x70, 0, k))?;
                    self.emit_word(0)?;
                }
                Ok(())
            }
            Kind::Rpop => {
                if !operands.is_empty() {
                    return Err(self.invalid_operands(operands));
                }
                for k in (1..=7).rev() {
                    self.emit_word(word(0x71, k, 0))?;
                }
                Ok(())
            }
        }
    }

    fn invalid_operands(&self, operands: &[String]) -> AssembleError {
        self.err(ErrorKind::InvalidOperands(operands.join(",")))
    }

    fn register(&self, operand: &str) -> Result<u8, AssembleError> {
        register_number(operand)
            .ok_or_else(|| self.err(ErrorKind::InvalidRegister(operand.to_string())))
    }

    fn add_label(&mut self, label: &str) -> Result<(), AssembleError> {
        if !is_valid_label(label) {
            return Err(self.err(ErrorKind::InvalidLabel(label.to_string())));
        }
        let key = format!("{}:{}", self.scope, label);
        if self.symbols.contains(&key) {
            return Err(self.err(ErrorKind::DuplicateLabel(label.to_string())));
        }
        let address = self.address()?;
        debug!(%key, address, "defining label");
        self.symbols
            .insert(key, SymbolValue::Address(address), self.line);
        Ok(())
    }

    /// If this label is the entry a prior START named, repoint the
    /// section's own label at it
    fn backpatch(&mut self, label: &str) -> Result<(), AssembleError> {
        let Some(deferred) = self.deferred.take() else {
            return Ok(());
        };
        if label != deferred.entry {
            self.deferred = Some(deferred);
            return Ok(());
        }
        let key = format!("{}:{}", self.scope, deferred.alias);
        if !self.symbols.contains(&key) {
            return Err(self.err(ErrorKind::UndefinedLabel(deferred.alias)));
        }
        let address = self.address()?;
        self.symbols
            .insert(key, SymbolValue::Address(address), self.line);
        Ok(())
    }

    fn reg_adr(
        &mut self,
        code: u8,
        operands: &[String],
        has_reg_form: bool,
    ) -> Result<(), AssembleError> {
        if operands.len() < 2 || operands.len() > 3 {
            return Err(self.invalid_operands(operands));
        }
        let r = self.register(&operands[0])?;
        let x = match operands.get(2) {
            Some(index) => {
                if is_gr0(index) {
                    return Err(self.err(ErrorKind::Gr0AsIndex));
                }
                self.register(index)?
            }
            None => 0,
        };

        if has_reg_form {
            if let Some(r2) = register_number(&operands[1]) {
                return self.emit_word(word(code + 4, r, r2));
            }
        }

        let slot = self.address_slot(&operands[1]);
        self.emit_word(word(code, r, x))?;
        self.emit(slot)
    }

    fn adr(&mut self, code: u8, mnemonic: &str, operands: &[String]) -> Result<(), AssembleError> {
        if operands.is_empty() || operands.len() > 2 {
            return Err(self.invalid_operands(operands));
        }
        let x = match operands.get(1) {
            Some(index) => self.register(index)?,
            None => 0,
        };

        let target = &operands[0];
        let slot = if register_number(target).is_none() && is_valid_label(target) {
            if mnemonic == "CALL" {
                // CALL may reach another section's entry; pass 2 applies
                // the cross-scope fallback to this key form
                Slot::Symbolic(format!("CALL_{}:{}", self.scope, target))
            } else {
                Slot::Symbolic(format!("{}:{}", self.scope, target))
            }
        } else {
            self.value_slot(target)
        };
        self.emit_word(word(code, 0, x))?;
        self.emit(slot)
    }

    fn reg(&mut self, code: u8, operands: &[String]) -> Result<(), AssembleError> {
        if operands.len() != 1 {
            return Err(self.invalid_operands(operands));
        }
        let r = self.register(&operands[0])?;
        self.emit_word(word(code, r, 0))
    }

    fn start(&mut self, label: Option<&str>, operands: &[String]) -> Result<(), AssembleError> {
        let Some(label) = label else {
            return Err(self.err(ErrorKind::MissingStartLabel));
        };
        if operands.len() > 1 {
            return Err(self.invalid_operands(operands));
        }

        if self.started {
            // A later section may name an entry defined further down;
            // remember it and back-patch when the definition shows up
            self.deferred = operands.first().map(|entry| Deferred {
                entry: entry.clone(),
                alias: label.to_string(),
            });
        } else {
            self.started = true;
            let entry = operands.first().map_or(label, String::as_str);
            self.start_key = Some((format!("{label}:{entry}"), self.line));
        }

        self.scope = label.to_string();
        self.add_label(label)?;
        self.in_block = true;
        Ok(())
    }

    fn end(&mut self, label: Option<&str>, operands: &[String]) -> Result<(), AssembleError> {
        if let Some(label) = label {
            return Err(self.err(ErrorKind::LabelAtEnd(label.to_string())));
        }
        if !operands.is_empty() {
            return Err(self.invalid_operands(operands));
        }

        for literal in std::mem::take(&mut self.pending) {
            let address = self.address()?;
            debug!(key = %literal.key, address, "binding literal");
            self.symbols
                .insert(literal.key, SymbolValue::Address(address), self.line);
            self.emit_literal_value(&literal.value)?;
        }

        self.scope.clear();
        self.in_block = false;
        self.deferred = None;
        Ok(())
    }

    fn ds(&mut self, operands: &[String]) -> Result<(), AssembleError> {
        if operands.len() != 1 {
            return Err(self.invalid_operands(operands));
        }
        let count: i64 = operands[0]
            .parse()
            .ok()
            .filter(|count| *count >= 0)
            .ok_or_else(|| self.err(ErrorKind::InvalidCount(operands[0].clone())))?;
        for _ in 0..count {
            self.emit_word(0)?;
        }
        Ok(())
    }

    fn dc(&mut self, operands: &[String]) -> Result<(), AssembleError> {
        if operands.is_empty() {
            return Err(self.invalid_operands(operands));
        }
        for operand in operands {
            if let Some(text) = unquote(operand) {
                for c in text.chars() {
                    self.emit_word(c as C::Word)?;
                }
                self.emit_word(0)?;
            } else if let Some(value) = parse_number(operand) {
                self.emit_word(value)?;
            } else if is_valid_label(operand) {
                let key = format!("{}:{}", self.scope, operand);
                self.emit(Slot::Symbolic(key))?;
            } else {
                self.emit(Slot::Symbolic(operand.clone()))?;
            }
        }
        Ok(())
    }

    fn in_out(&mut self, entry: C::Word, operands: &[String]) -> Result<(), AssembleError> {
        if operands.len() != 2 {
            return Err(self.invalid_operands(operands));
        }
        for operand in operands {
            if !is_valid_label(operand) {
                return Err(self.err(ErrorKind::InvalidLabel(operand.clone())));
            }
        }
        let buffer = format!("{}:{}", self.scope, operands[0]);
        let length = format!("{}:{}", self.scope, operands[1]);

        // PUSH 0,GR1 / PUSH 0,GR2 / LAD GR1,buf / LAD GR2,len /
        // SVC entry / POP GR2 / POP GR1
        self.emit_word(word(0x70, 0, 1))?;
        self.emit_word(0)?;
        self.emit_word(word(0x70, 0, 2))?;
        self.emit_word(0)?;
        self.emit_word(word(0x12, 1, 0))?;
        self.emit(Slot::Symbolic(buffer))?;
        self.emit_word(word(0x12, 2, 0))?;
        self.emit(Slot::Symbolic(length))?;
        self.emit_word(word(0xf0, 0, 0))?;
        self.emit_word(entry)?;
        self.emit_word(word(0x71, 2, 0))?;
        self.emit_word(word(0x71, 1, 0))
    }

    /// Slot for an address operand: a literal allocates a pool entry,
    /// a bare label is scoped, numbers are immediate
    fn address_slot(&mut self, operand: &str) -> Slot {
        if let Some(value) = operand.strip_prefix('=') {
            let key = format!("={}_{}", value, self.literal_seq);
            self.literal_seq += 1;
            self.pending.push(PendingLiteral {
                key: key.clone(),
                value: value.to_string(),
            });
            return Slot::Symbolic(key);
        }
        if register_number(operand).is_none() && is_valid_label(operand) {
            return Slot::Symbolic(format!("{}:{}", self.scope, operand));
        }
        self.value_slot(operand)
    }

    fn value_slot(&self, operand: &str) -> Slot {
        match parse_number(operand) {
            Some(value) => Slot::Value(value),
            None => Slot::Symbolic(operand.to_string()),
        }
    }

    fn emit_literal_value(&mut self, value: &str) -> Result<(), AssembleError> {
        if let Some(text) = unquote(value) {
            for c in text.chars() {
                self.emit_word(c as C::Word)?;
            }
            self.emit_word(0)
        } else if let Some(word) = parse_number(value) {
            self.emit_word(word)
        } else {
            Err(self.err(ErrorKind::InvalidLiteral(value.to_string())))
        }
    }

    fn address(&self) -> Result<C::Address, AssembleError> {
        C::Address::try_from(self.cursor).map_err(|_| self.err(ErrorKind::ProgramTooLarge))
    }

    fn emit(&mut self, slot: Slot) -> Result<(), AssembleError> {
        let address = self.address()?;
        self.memory.insert(
            address,
            Placement {
                slot,
                line: self.line,
            },
        );
        self.cursor += 1;
        Ok(())
    }

    fn emit_word(&mut self, value: C::Word) -> Result<(), AssembleError> {
        self.emit(Slot::Value(value))
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::*;

    fn layout(source: &str) -> Layout {
        layout_program(source).unwrap()
    }

    fn kind(source: &str) -> ErrorKind {
        layout_program(source).unwrap_err().kind
    }

    #[test]
    fn addresses_are_contiguous_test() {
        let layout = layout(indoc! {"
            MAIN START
                 LD    GR0,=10
                 ADDA  GR0,GR0
                 RET
            BUF  DS    2
                 END
        "});
        let addresses: Vec<_> = layout.memory.keys().copied().collect();
        let expected: Vec<_> = (0..layout.address_max).collect();
        assert_eq!(addresses, expected);
    }

    #[test]
    fn reg_reg_selects_one_word_form_test() {
        let layout = layout(indoc! {"
            MAIN START
                 ADDA  GR1,GR2
                 SUBA  GR3,X
                 RET
            X    DC    1
                 END
        "});
        assert_eq!(layout.memory[&0].slot, Slot::Value(0x2412));
        assert_eq!(layout.memory[&1].slot, Slot::Value(0x2130));
        assert_eq!(
            layout.memory[&2].slot,
            Slot::Symbolic("MAIN:X".to_string())
        );
    }

    #[test]
    fn index_register_encoding_test() {
        let layout = layout(indoc! {"
            MAIN START
                 LD    GR1,X,GR4
                 RET
            X    DC    1
                 END
        "});
        assert_eq!(layout.memory[&0].slot, Slot::Value(0x1014));
    }

    #[test]
    fn gr0_index_is_rejected_test() {
        let source = indoc! {"
            MAIN START
                 LD    GR1,X,GR0
                 END
        "};
        assert_eq!(kind(source), ErrorKind::Gr0AsIndex);
    }

    #[test]
    fn literal_pool_flushes_at_end_test() {
        let layout = layout(indoc! {"
            MAIN START
                 LD    GR0,=#00FF
                 RET
                 END
        "});
        // RET at 2, so the pool starts at 3
        assert_eq!(layout.memory[&1].slot, Slot::Symbolic("=#00FF_0".to_string()));
        assert_eq!(layout.symbols.resolve("=#00FF_0"), Some(3));
        assert_eq!(layout.memory[&3].slot, Slot::Value(0x00ff));
        assert_eq!(layout.address_max, 4);
    }

    #[test]
    fn string_literal_expands_like_dc_test() {
        let layout = layout(indoc! {"
            MAIN START
                 LAD   GR1,='ab'
                 RET
                 END
        "});
        assert_eq!(layout.symbols.resolve("='ab'_0"), Some(3));
        assert_eq!(layout.memory[&3].slot, Slot::Value(u16::from(b'a')));
        assert_eq!(layout.memory[&4].slot, Slot::Value(u16::from(b'b')));
        assert_eq!(layout.memory[&5].slot, Slot::Value(0));
    }

    #[test]
    fn equal_literals_stay_distinct_test() {
        let layout = layout(indoc! {"
            MAIN START
                 LD    GR0,=5
                 LD    GR1,=5
                 RET
                 END
        "});
        assert_eq!(layout.memory[&1].slot, Slot::Symbolic("=5_0".to_string()));
        assert_eq!(layout.memory[&3].slot, Slot::Symbolic("=5_1".to_string()));
        assert_ne!(
            layout.symbols.resolve("=5_0"),
            layout.symbols.resolve("=5_1")
        );
    }

    #[test]
    fn call_gets_cross_scope_key_test() {
        let layout = layout(indoc! {"
            MAIN START
                 CALL  SUB
                 RET
                 END
            SUB  START
                 RET
                 END
        "});
        assert_eq!(
            layout.memory[&1].slot,
            Slot::Symbolic("CALL_MAIN:SUB".to_string())
        );
    }

    #[test]
    fn macro_expansion_sizes_test() {
        let layout = layout(indoc! {"
            MAIN START
                 IN    BUF,LEN
                 RPUSH
                 RPOP
                 RET
            BUF  DS    256
            LEN  DS    1
                 END
        "});
        // IN = 12 words, RPUSH = 14, RPOP = 7, RET = 1
        assert_eq!(layout.symbols.resolve("MAIN:BUF"), Some(34));
        assert_eq!(layout.memory[&0].slot, Slot::Value(0x7001));
        assert_eq!(layout.memory[&8].slot, Slot::Value(0xf000));
        assert_eq!(layout.memory[&9].slot, Slot::Value(C::SYS_IN));
        assert_eq!(layout.memory[&12].slot, Slot::Value(0x7001)); // RPUSH GR1
        assert_eq!(layout.memory[&26].slot, Slot::Value(0x7170)); // RPOP starts at GR7
        assert_eq!(layout.memory[&32].slot, Slot::Value(0x7110)); // and ends at GR1
    }

    #[test]
    fn duplicate_label_test() {
        let source = indoc! {"
            MAIN START
            X    DC    1
            X    DC    2
                 END
        "};
        assert_eq!(kind(source), ErrorKind::DuplicateLabel("X".to_string()));
    }

    #[test]
    fn same_label_in_two_scopes_test() {
        let layout = layout(indoc! {"
            MAIN START
            X    DC    1
                 END
            SUB  START
            X    DC    2
                 END
        "});
        assert_eq!(layout.symbols.resolve("MAIN:X"), Some(1));
        assert_eq!(layout.symbols.resolve("SUB:X"), Some(3));
    }

    #[test]
    fn missing_start_test() {
        assert_eq!(kind("     RET\n"), ErrorKind::MissingStart);
        assert_eq!(kind("; nothing\n"), ErrorKind::MissingStart);
    }

    #[test]
    fn missing_end_test() {
        let source = indoc! {"
            MAIN START
                 RET
        "};
        assert_eq!(kind(source), ErrorKind::MissingEnd);
    }

    #[test]
    fn label_at_end_test() {
        let source = indoc! {"
            MAIN START
            X    END
        "};
        assert_eq!(kind(source), ErrorKind::LabelAtEnd("X".to_string()));
    }

    #[test]
    fn start_requires_label_test() {
        assert_eq!(kind("     START\n     END\n"), ErrorKind::MissingStartLabel);
    }

    #[test]
    fn ds_count_must_be_decimal_test() {
        let source = indoc! {"
            MAIN START
                 DS    #10
                 END
        "};
        assert_eq!(kind(source), ErrorKind::InvalidCount("#10".to_string()));
        let source = indoc! {"
            MAIN START
                 DS    -1
                 END
        "};
        assert_eq!(kind(source), ErrorKind::InvalidCount("-1".to_string()));
    }

    #[test]
    fn secondary_start_entry_backpatch_test() {
        let layout = layout(indoc! {"
            MAIN START
                 CALL  SUB
                 RET
                 END
            SUB  START DOIT
            TMP  DS    1
            DOIT RET
                 END
        "});
        // SUB:SUB is repointed from the section head to DOIT
        assert_eq!(layout.symbols.resolve("SUB:DOIT"), Some(4));
        assert_eq!(layout.symbols.resolve("SUB:SUB"), Some(4));
    }

    #[test]
    fn crlf_sources_keep_line_numbers_test() {
        let layout = layout("MAIN START\r\n     RET\r\n     END\r\n");
        assert_eq!(layout.memory[&0].line, 2);
    }
}
