//! Two-pass CASL II assembler
//!
//! Pass 1 ([`layout`]) walks the source, grows the scoped symbol table and
//! lays words out in a sparse address map, leaving symbolic references in
//! place. Pass 2 ([`resolve`]) is a pure walk that resolves every slot to
//! a 16-bit word. The assembler is single threaded and stateless: given
//! source text it yields the image, the start address and the debug maps.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::constants as C;
use crate::parser::LineError;

pub(crate) mod layout;
pub(crate) mod resolve;
pub(crate) mod symbol;
pub(crate) mod table;

use self::symbol::SymbolValue;

/// A fatal assembly error, carrying the offending source line
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {kind}")]
pub struct AssembleError {
    pub line: usize,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("syntax error: {0}")]
    Syntax(#[from] LineError),

    #[error("illegal instruction \"{0}\"")]
    IllegalMnemonic(String),

    #[error("no START instruction found")]
    MissingStart,

    #[error("no END instruction found")]
    MissingEnd,

    #[error("no label found at START")]
    MissingStartLabel,

    #[error("can't use label \"{0}\" at END")]
    LabelAtEnd(String),

    #[error("invalid operand \"{0}\"")]
    InvalidOperands(String),

    #[error("can't use GR0 as an index register")]
    Gr0AsIndex,

    #[error("invalid register \"{0}\"")]
    InvalidRegister(String),

    #[error("invalid label \"{0}\"")]
    InvalidLabel(String),

    #[error("label \"{0}\" already defined")]
    DuplicateLabel(String),

    #[error("label \"{0}\" is not defined")]
    UndefinedLabel(String),

    #[error("invalid literal ={0}")]
    InvalidLiteral(String),

    #[error("\"{0}\" must be a non-negative decimal")]
    InvalidCount(String),

    #[error("program does not fit in memory")]
    ProgramTooLarge,
}

/// Side tables retained for the debugger
#[derive(Debug, Clone, Default)]
pub struct DebugInfo {
    /// `scope:label` keys to addresses
    pub labels: BTreeMap<String, C::Address>,
    line_to_address: BTreeMap<usize, C::Address>,
    address_to_line: BTreeMap<C::Address, usize>,
}

impl DebugInfo {
    /// Smallest address assembled from the given source line, so that
    /// breakpoints land on the first word of a multi-word instruction
    #[must_use]
    pub fn address_for_line(&self, line: usize) -> Option<C::Address> {
        self.line_to_address.get(&line).copied()
    }

    #[must_use]
    pub fn line_for_address(&self, address: C::Address) -> Option<usize> {
        self.address_to_line.get(&address).copied()
    }
}

/// The output of a successful assembly
#[derive(Debug, Clone)]
pub struct Assembly {
    /// Dense image, one entry per assembled address starting at 0
    pub image: Vec<C::Word>,
    /// Resolved entry point
    pub start: C::Address,
    pub debug_info: DebugInfo,
}

/// Assemble CASL II source text
pub fn assemble(source: &str) -> Result<Assembly, AssembleError> {
    let layout = layout::layout_program(source)?;
    let image = resolve::resolve_image(&layout);

    let start = layout.symbols.resolve(&layout.start_key).ok_or_else(|| {
        let label = layout.start_key.clone();
        AssembleError {
            line: layout.start_line,
            kind: ErrorKind::UndefinedLabel(label),
        }
    })?;
    debug!(start, words = image.len(), "assembled program");

    let mut debug_info = DebugInfo::default();
    for (key, entry) in layout.symbols.iter() {
        if let SymbolValue::Address(address) = entry.value {
            if !key.starts_with('=') {
                debug_info.labels.insert(key.to_string(), address);
            }
        }
    }
    for (&address, placement) in &layout.memory {
        debug_info.address_to_line.insert(address, placement.line);
        let entry = debug_info
            .line_to_address
            .entry(placement.line)
            .or_insert(address);
        *entry = (*entry).min(address);
    }

    Ok(Assembly {
        image,
        start,
        debug_info,
    })
}

/// Parse a `#hex` or signed decimal lexeme into a 16-bit word
pub(crate) fn parse_number(text: &str) -> Option<C::Word> {
    if let Some(hex) = text.strip_prefix('#') {
        let value = u64::from_str_radix(hex, 16).ok()?;
        return Some((value & 0xffff) as C::Word);
    }
    let value: i64 = text.parse().ok()?;
    Some((value & 0xffff) as C::Word)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_number_test() {
        assert_eq!(parse_number("10"), Some(10));
        assert_eq!(parse_number("-1"), Some(0xffff));
        assert_eq!(parse_number("+32767"), Some(0x7fff));
        assert_eq!(parse_number("#00FF"), Some(0x00ff));
        assert_eq!(parse_number("#ffff"), Some(0xffff));
        assert_eq!(parse_number("FOO"), None);
        assert_eq!(parse_number("='x'"), None);
    }

    #[test]
    fn assemble_simple_add_test() {
        let source = indoc! {"
            MAIN START
                 LD    GR0,=10
                 LD    GR1,=20
                 ADDA  GR0,GR1
                 RET
                 END
        "};
        let assembly = assemble(source).unwrap();

        // Two 2-word loads, one register-register add, RET, then the
        // literal pool bound at END.
        assert_eq!(
            assembly.image,
            vec![0x1000, 6, 0x1010, 7, 0x2401, 0x8100, 10, 20]
        );
        assert_eq!(assembly.start, 0);
    }

    #[test]
    fn image_is_contiguous_test() {
        let source = indoc! {"
            MAIN START
                 LAD   GR1,BUF
                 RET
            BUF  DS    3
            N    DC    4,'ab'
                 END
        "};
        let assembly = assemble(source).unwrap();
        // LAD(2) + RET(1) + DS(3) + DC(1 + 2 chars + NUL) = 10 words
        assert_eq!(assembly.image.len(), 10);
        assert_eq!(assembly.image[1], 3); // BUF
        assert_eq!(assembly.image[6], 4); // N
        assert_eq!(&assembly.image[7..10], &[u16::from(b'a'), u16::from(b'b'), 0]);
    }

    #[test]
    fn start_entry_label_test() {
        let source = indoc! {"
            MAIN START BEGIN
            X    DC    1
            BEGIN LD   GR0,X
                 RET
                 END
        "};
        let assembly = assemble(source).unwrap();
        assert_eq!(assembly.start, 1);
    }

    #[test]
    fn undefined_entry_label_test() {
        let source = indoc! {"
            MAIN START NOWHERE
                 RET
                 END
        "};
        let error = assemble(source).unwrap_err();
        assert_eq!(error.line, 1);
        assert!(matches!(error.kind, ErrorKind::UndefinedLabel(_)));
    }

    #[test]
    fn debug_info_maps_test() {
        let source = indoc! {"
            MAIN START
                 LD    GR0,=10
                 ADDA  GR0,GR0
                 RET
                 END
        "};
        let assembly = assemble(source).unwrap();
        let info = &assembly.debug_info;

        // The LD occupies two words; its line maps to the first one
        assert_eq!(info.address_for_line(2), Some(0));
        assert_eq!(info.line_for_address(0), Some(2));
        assert_eq!(info.line_for_address(1), Some(2));
        assert_eq!(info.address_for_line(3), Some(2));
        assert_eq!(info.labels.get("MAIN:MAIN"), Some(&0));
    }
}
