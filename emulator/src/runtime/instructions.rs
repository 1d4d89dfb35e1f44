//! COMET II instruction decoding and execution
//!
//! An instruction word splits into `opcode = word >> 8`, `r1` and `r2`
//! nibbles; two-word forms take the address from the following word. The
//! operand shape is decided by the opcode alone: the one-word
//! register-register variant of a family lives at opcode + 4, so decoded
//! memory disassembles the same way no matter how it was produced.

use std::fmt;

use crate::constants as C;

use super::memory::Memory;
use super::{Machine, StepOutcome, Termination};

/// Source operand of a two-operand instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operand {
    /// `adr[,x]`: a memory word at the effective address
    Mem(C::Word, u8),
    /// `r2`: the one-word register form
    Reg(u8),
}

impl Operand {
    /// Words occupied by the instruction carrying this operand
    pub(crate) const fn size(self) -> C::Word {
        match self {
            Operand::Mem(..) => 2,
            Operand::Reg(_) => 1,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Operand::Mem(adr, x) => fmt_mem(f, adr, x),
            Operand::Reg(r) => write!(f, "GR{r}"),
        }
    }
}

fn fmt_mem(f: &mut fmt::Formatter<'_>, adr: C::Word, x: u8) -> fmt::Result {
    write!(f, "#{adr:04x}")?;
    if x != 0 {
        write!(f, ", GR{x}")?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Instruction {
    Nop,
    Ld(u8, Operand),
    St(u8, C::Word, u8),
    Lad(u8, C::Word, u8),
    Adda(u8, Operand),
    Suba(u8, Operand),
    Addl(u8, Operand),
    Subl(u8, Operand),
    Mula(u8, Operand),
    Diva(u8, Operand),
    Mull(u8, Operand),
    Divl(u8, Operand),
    And(u8, Operand),
    Or(u8, Operand),
    Xor(u8, Operand),
    Cpa(u8, Operand),
    Cpl(u8, Operand),
    Sla(u8, C::Word, u8),
    Sra(u8, C::Word, u8),
    Sll(u8, C::Word, u8),
    Srl(u8, C::Word, u8),
    Jmi(C::Word, u8),
    Jnz(C::Word, u8),
    Jze(C::Word, u8),
    Jump(C::Word, u8),
    Jpl(C::Word, u8),
    Jov(C::Word, u8),
    Push(C::Word, u8),
    Pop(u8),
    Call(C::Word, u8),
    Ret,
    Svc(C::Word, u8),
}

/// Decode the word at `pc`, fetching the address word for two-word forms
pub(crate) fn decode(memory: &Memory, pc: C::Address) -> Option<Instruction> {
    use Instruction::*;

    let word = memory.get(pc);
    let op = (word >> 8) as u8;
    let r1 = ((word >> 4) & 0xf) as u8;
    let r2 = (word & 0xf) as u8;
    let adr = memory.get(pc.wrapping_add(1));

    Some(match op {
        0x00 => Nop,
        0x10 => Ld(r1, Operand::Mem(adr, r2)),
        0x14 => Ld(r1, Operand::Reg(r2)),
        0x11 => St(r1, adr, r2),
        0x12 => Lad(r1, adr, r2),
        0x20 => Adda(r1, Operand::Mem(adr, r2)),
        0x24 => Adda(r1, Operand::Reg(r2)),
        0x21 => Suba(r1, Operand::Mem(adr, r2)),
        0x25 => Suba(r1, Operand::Reg(r2)),
        0x22 => Addl(r1, Operand::Mem(adr, r2)),
        0x26 => Addl(r1, Operand::Reg(r2)),
        0x23 => Subl(r1, Operand::Mem(adr, r2)),
        0x27 => Subl(r1, Operand::Reg(r2)),
        0x28 => Mula(r1, Operand::Mem(adr, r2)),
        0x2c => Mula(r1, Operand::Reg(r2)),
        0x29 => Diva(r1, Operand::Mem(adr, r2)),
        0x2d => Diva(r1, Operand::Reg(r2)),
        0x2a => Mull(r1, Operand::Mem(adr, r2)),
        0x2e => Mull(r1, Operand::Reg(r2)),
        0x2b => Divl(r1, Operand::Mem(adr, r2)),
        0x2f => Divl(r1, Operand::Reg(r2)),
        0x30 => And(r1, Operand::Mem(adr, r2)),
        0x34 => And(r1, Operand::Reg(r2)),
        0x31 => Or(r1, Operand::Mem(adr, r2)),
        0x35 => Or(r1, Operand::Reg(r2)),
        0x32 => Xor(r1, Operand::Mem(adr, r2)),
        0x36 => Xor(r1, Operand::Reg(r2)),
        0x40 => Cpa(r1, Operand::Mem(adr, r2)),
        0x44 => Cpa(r1, Operand::Reg(r2)),
        0x41 => Cpl(r1, Operand::Mem(adr, r2)),
        0x45 => Cpl(r1, Operand::Reg(r2)),
        0x50 => Sla(r1, adr, r2),
        0x51 => Sra(r1, adr, r2),
        0x52 => Sll(r1, adr, r2),
        0x53 => Srl(r1, adr, r2),
        0x61 => Jmi(adr, r2),
        0x62 => Jnz(adr, r2),
        0x63 => Jze(adr, r2),
        0x64 => Jump(adr, r2),
        0x65 => Jpl(adr, r2),
        0x66 => Jov(adr, r2),
        0x70 => Push(adr, r2),
        0x71 => Pop(r1),
        0x80 => Call(adr, r2),
        0x81 => Ret,
        0xf0 => Svc(adr, r2),
        _ => return None,
    })
}

/// Render the word at `address` as an instruction, or as a `DC` word when
/// it does not decode. Returns the rendition and its size in words.
#[must_use]
pub fn disassemble(memory: &Memory, address: C::Address) -> (String, C::Word) {
    match decode(memory, address) {
        Some(instruction) => (instruction.to_string(), instruction.size()),
        None => (format!("DC    #{:04x}", memory.get(address)), 1),
    }
}

impl Instruction {
    pub(crate) const fn size(self) -> C::Word {
        use Instruction::*;
        match self {
            Nop | Pop(_) | Ret => 1,
            Ld(_, src) | Adda(_, src) | Suba(_, src) | Addl(_, src) | Subl(_, src)
            | Mula(_, src) | Diva(_, src) | Mull(_, src) | Divl(_, src) | And(_, src)
            | Or(_, src) | Xor(_, src) | Cpa(_, src) | Cpl(_, src) => src.size(),
            St(..) | Lad(..) | Sla(..) | Sra(..) | Sll(..) | Srl(..) | Jmi(..) | Jnz(..)
            | Jze(..) | Jump(..) | Jpl(..) | Jov(..) | Push(..) | Call(..) | Svc(..) => 2,
        }
    }

    const fn mnemonic(self) -> &'static str {
        use Instruction::*;
        match self {
            Nop => "NOP",
            Ld(..) => "LD",
            St(..) => "ST",
            Lad(..) => "LAD",
            Adda(..) => "ADDA",
            Suba(..) => "SUBA",
            Addl(..) => "ADDL",
            Subl(..) => "SUBL",
            Mula(..) => "MULA",
            Diva(..) => "DIVA",
            Mull(..) => "MULL",
            Divl(..) => "DIVL",
            And(..) => "AND",
            Or(..) => "OR",
            Xor(..) => "XOR",
            Cpa(..) => "CPA",
            Cpl(..) => "CPL",
            Sla(..) => "SLA",
            Sra(..) => "SRA",
            Sll(..) => "SLL",
            Srl(..) => "SRL",
            Jmi(..) => "JMI",
            Jnz(..) => "JNZ",
            Jze(..) => "JZE",
            Jump(..) => "JUMP",
            Jpl(..) => "JPL",
            Jov(..) => "JOV",
            Push(..) => "PUSH",
            Pop(_) => "POP",
            Call(..) => "CALL",
            Ret => "RET",
            Svc(..) => "SVC",
        }
    }

    /// Execute one instruction against the machine
    pub(crate) fn execute(self, m: &mut Machine) -> StepOutcome {
        use Instruction::*;

        match self {
            Nop => m.advance(1),

            Ld(r, src) => {
                let value = m.operand(src);
                m.set_reg(r, value);
                m.registers.fr = super::Flags::from_result(value);
                m.advance(src.size())
            }

            St(r, adr, x) => {
                let address = m.effective_address(adr, x);
                let value = m.reg(r);
                m.memory.set(address, value);
                m.advance(2)
            }

            Lad(r, adr, x) => {
                let address = m.effective_address(adr, x);
                m.set_reg(r, address);
                m.advance(2)
            }

            Adda(r, src) => m.arith(r, src, true, |a, b| a + b),
            Suba(r, src) => m.arith(r, src, true, |a, b| a - b),
            Addl(r, src) => m.arith(r, src, false, |a, b| a + b),
            Subl(r, src) => m.arith(r, src, false, |a, b| a - b),
            Mula(r, src) => m.arith(r, src, true, |a, b| a * b),
            Mull(r, src) => m.arith(r, src, false, |a, b| a * b),
            Diva(r, src) => m.divide(r, src, true),
            Divl(r, src) => m.divide(r, src, false),

            And(r, src) => m.logic(r, src, |a, b| a & b),
            Or(r, src) => m.logic(r, src, |a, b| a | b),
            Xor(r, src) => m.logic(r, src, |a, b| a ^ b),

            Cpa(r, src) => m.compare(r, src, true),
            Cpl(r, src) => m.compare(r, src, false),

            Sla(r, adr, x) => {
                let count = m.effective_address(adr, x);
                m.shift_left(r, count, true)
            }
            Sll(r, adr, x) => {
                let count = m.effective_address(adr, x);
                m.shift_left(r, count, false)
            }
            Sra(r, adr, x) => {
                let count = m.effective_address(adr, x);
                m.shift_right(r, count, true)
            }
            Srl(r, adr, x) => {
                let count = m.effective_address(adr, x);
                m.shift_right(r, count, false)
            }

            Jmi(adr, x) => m.jump_if(m.registers.fr.contains(super::Flags::SIGN), adr, x),
            Jze(adr, x) => m.jump_if(m.registers.fr.contains(super::Flags::ZERO), adr, x),
            Jnz(adr, x) => m.jump_if(!m.registers.fr.contains(super::Flags::ZERO), adr, x),
            Jpl(adr, x) => {
                let fr = m.registers.fr;
                m.jump_if(
                    !fr.contains(super::Flags::SIGN) && !fr.contains(super::Flags::ZERO),
                    adr,
                    x,
                )
            }
            Jov(adr, x) => m.jump_if(m.registers.fr.contains(super::Flags::OVERFLOW), adr, x),
            Jump(adr, x) => m.jump_if(true, adr, x),

            Push(adr, x) => {
                let value = m.effective_address(adr, x);
                match m.push(value) {
                    Ok(()) => m.advance(2),
                    Err(termination) => StepOutcome::Halt(termination),
                }
            }

            Pop(r) => {
                let pc = m.registers.pc;
                let value = m.memory.get(m.registers.sp);
                m.set_reg(r, value);
                let sp = m.registers.sp.wrapping_add(1);
                if sp > C::STACK_TOP {
                    return StepOutcome::Halt(Termination::StackUnderflow { pc, sp });
                }
                m.registers.sp = sp;
                m.advance(1)
            }

            Call(adr, x) => {
                let target = m.effective_address(adr, x);
                let ret = m.registers.pc.wrapping_add(2);
                match m.push(ret) {
                    Ok(()) => {
                        m.registers.pc = target;
                        StepOutcome::Continue
                    }
                    Err(termination) => StepOutcome::Halt(termination),
                }
            }

            Ret => {
                let target = m.memory.get(m.registers.sp);
                let sp = m.registers.sp.wrapping_add(1);
                if sp > C::STACK_TOP {
                    // The outermost RET unwinding the empty stack is how a
                    // program exits cleanly
                    return StepOutcome::Halt(Termination::Returned);
                }
                m.registers.sp = sp;
                m.registers.pc = target;
                StepOutcome::Continue
            }

            Svc(adr, x) => {
                let entry = m.effective_address(adr, x);
                match entry {
                    C::SYS_IN => StepOutcome::AwaitInput,
                    C::SYS_OUT => {
                        m.system_out();
                        m.advance(2)
                    }
                    C::EXIT_USR | C::EXIT_OVF | C::EXIT_DVZ | C::EXIT_ROV => {
                        StepOutcome::Halt(Termination::Exit(entry))
                    }
                    _ => m.advance(2),
                }
            }
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;

        match *self {
            Nop | Ret => write!(f, "{}", self.mnemonic()),
            Ld(r, src) | Adda(r, src) | Suba(r, src) | Addl(r, src) | Subl(r, src)
            | Mula(r, src) | Diva(r, src) | Mull(r, src) | Divl(r, src) | And(r, src)
            | Or(r, src) | Xor(r, src) | Cpa(r, src) | Cpl(r, src) => {
                write!(f, "{:<6}GR{r}, {src}", self.mnemonic())
            }
            St(r, adr, x) | Lad(r, adr, x) | Sla(r, adr, x) | Sra(r, adr, x) | Sll(r, adr, x)
            | Srl(r, adr, x) => {
                write!(f, "{:<6}GR{r}, ", self.mnemonic())?;
                fmt_mem(f, adr, x)
            }
            Jmi(adr, x) | Jnz(adr, x) | Jze(adr, x) | Jump(adr, x) | Jpl(adr, x) | Jov(adr, x)
            | Push(adr, x) | Call(adr, x) | Svc(adr, x) => {
                write!(f, "{:<6}", self.mnemonic())?;
                fmt_mem(f, adr, x)
            }
            Pop(r) => write!(f, "{:<6}GR{r}", self.mnemonic()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn decode_words(words: &[C::Word]) -> Instruction {
        let mut memory = Memory::default();
        memory.load_image(words);
        decode(&memory, 0).unwrap()
    }

    #[test]
    fn decode_two_word_forms_test() {
        assert_eq!(
            decode_words(&[0x1012, 0x0040]),
            Instruction::Ld(1, Operand::Mem(0x40, 2))
        );
        assert_eq!(
            decode_words(&[0x7001, 0x0000]),
            Instruction::Push(0, 1)
        );
        assert_eq!(decode_words(&[0xf000, 0xfff0]), Instruction::Svc(0xfff0, 0));
    }

    #[test]
    fn decode_register_forms_test() {
        // The register-register variant lives at opcode + 4
        assert_eq!(
            decode_words(&[0x1412]),
            Instruction::Ld(1, Operand::Reg(2))
        );
        assert_eq!(
            decode_words(&[0x2401]),
            Instruction::Adda(0, Operand::Reg(1))
        );
        assert_eq!(decode_words(&[0x8100]), Instruction::Ret);
    }

    #[test]
    fn decode_rejects_unknown_opcodes_test() {
        let mut memory = Memory::default();
        memory.set(0, 0x9900);
        assert_eq!(decode(&memory, 0), None);
    }

    #[test]
    fn sizes_test() {
        assert_eq!(Instruction::Ld(1, Operand::Mem(0, 0)).size(), 2);
        assert_eq!(Instruction::Ld(1, Operand::Reg(2)).size(), 1);
        assert_eq!(Instruction::Ret.size(), 1);
        assert_eq!(Instruction::Jump(0, 0).size(), 2);
    }

    #[test]
    fn display_test() {
        assert_eq!(
            Instruction::Ld(1, Operand::Mem(0x40, 2)).to_string(),
            "LD    GR1, #0040, GR2"
        );
        assert_eq!(
            Instruction::Adda(0, Operand::Reg(1)).to_string(),
            "ADDA  GR0, GR1"
        );
        assert_eq!(Instruction::Pop(3).to_string(), "POP   GR3");
        assert_eq!(Instruction::Ret.to_string(), "RET");
    }

    #[test]
    fn disassemble_falls_back_to_dc_test() {
        let mut memory = Memory::default();
        memory.set(0, 0xabcd);
        let (text, size) = disassemble(&memory, 0);
        assert_eq!(text, "DC    #abcd");
        assert_eq!(size, 1);
    }
}
