//! The COMET II machine
//!
//! [`Machine`] owns the registers and the 64 K word memory and executes
//! exactly one instruction per [`Machine::step`] call. The step function
//! is pure with respect to the outside world: input is handed in through
//! [`Machine::feed_input`] after an [`StepOutcome::AwaitInput`], output
//! accumulates in a buffer the caller drains. This lets the interactive
//! REPL and the DAP run loop share one executor.

use thiserror::Error;
use tracing::{debug, warn};

use crate::assembler::Assembly;
use crate::constants as C;

mod instructions;
mod memory;
mod registers;

pub(crate) use self::instructions::{decode, Instruction};
pub use self::instructions::disassemble;
pub use self::memory::Memory;
pub use self::registers::{Flags, Reg, Registers};

/// Result of executing one instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Keep going
    Continue,
    /// SVC IN was issued; feed a line and resume
    AwaitInput,
    /// The machine stopped
    Halt(Termination),
}

/// Why the machine stopped. `Returned` and `Exit` are clean program
/// endings; the rest are faults. On a fault PC and SP keep the values
/// they had before the instruction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Termination {
    #[error("Program finished (RET)")]
    Returned,

    #[error("Program finished (SVC {0})")]
    Exit(C::Word),

    #[error("Stack overflow at #{pc:04x}: SP = #{sp:04x}")]
    StackOverflow { pc: C::Address, sp: C::Address },

    #[error("Stack underflow at #{pc:04x}: SP = #{sp:04x}")]
    StackUnderflow { pc: C::Address, sp: C::Address },

    #[error("Illegal instruction #{opcode:02x} at #{pc:04x}")]
    IllegalInstruction { pc: C::Address, opcode: u8 },
}

impl Termination {
    /// Clean program ending, as opposed to a fault
    #[must_use]
    pub fn is_clean(&self) -> bool {
        matches!(self, Termination::Returned | Termination::Exit(_))
    }
}

pub struct Machine {
    pub registers: Registers,
    pub memory: Memory,
    address_max: C::Address,
    output: Vec<String>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Machine {{ registers: {:?}, memory: [...] }}", self.registers)
    }
}

impl Machine {
    /// Build a machine from an assembled program: image at the bottom of
    /// memory, PC at the entry point, SP at the stack top, flags at PLUS
    #[must_use]
    pub fn new(assembly: &Assembly) -> Machine {
        let mut memory = Memory::default();
        memory.load_image(&assembly.image);
        Machine {
            registers: Registers {
                pc: assembly.start,
                ..Registers::default()
            },
            memory,
            address_max: assembly.image.len().min(0xffff) as C::Address,
            output: Vec::new(),
        }
    }

    /// Last address written by the assembler; the stack may not grow into
    /// the image
    #[must_use]
    pub fn address_max(&self) -> C::Address {
        self.address_max
    }

    /// Execute one instruction
    pub fn step(&mut self) -> StepOutcome {
        let pc = self.registers.pc;
        let Some(instruction) = decode(&self.memory, pc) else {
            let opcode = (self.memory.get(pc) >> 8) as u8;
            return StepOutcome::Halt(Termination::IllegalInstruction { pc, opcode });
        };
        debug!(pc, %instruction, "executing");
        instruction.execute(self)
    }

    /// Instruction at the current PC, if the word decodes
    pub(crate) fn current_instruction(&self) -> Option<Instruction> {
        decode(&self.memory, self.registers.pc)
    }

    /// Answer a pending SVC IN: store the line length at `*GR2` and its
    /// characters from `*GR1` on, then resume after the SVC
    pub fn feed_input(&mut self, line: &str) {
        let text: String = line.trim().chars().take(C::INPUT_MAX).collect();
        let length_ptr = self.registers.gr[2];
        let buffer = self.registers.gr[1];
        self.memory.set(length_ptr, text.chars().count() as C::Word);
        for (i, c) in text.chars().enumerate() {
            self.memory.set(buffer.wrapping_add(i as C::Word), c as C::Word);
        }
        self.registers.pc = self.registers.pc.wrapping_add(2);
    }

    /// Drain the lines produced by SVC OUT since the last call
    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    fn reg(&self, r: u8) -> C::Word {
        self.registers.gr[usize::from(r & 7)]
    }

    fn set_reg(&mut self, r: u8, value: C::Word) {
        self.registers.gr[usize::from(r & 7)] = value;
    }

    /// `adr` plus the index register, ignoring GR0
    fn effective_address(&self, adr: C::Word, x: u8) -> C::Address {
        if (1..=7).contains(&x) {
            adr.wrapping_add(self.registers.gr[usize::from(x)])
        } else {
            adr
        }
    }

    fn operand(&self, src: instructions::Operand) -> C::Word {
        match src {
            instructions::Operand::Mem(adr, x) => self.memory.get(self.effective_address(adr, x)),
            instructions::Operand::Reg(r) => self.reg(r),
        }
    }

    fn advance(&mut self, words: C::Word) -> StepOutcome {
        self.registers.pc = self.registers.pc.wrapping_add(words);
        StepOutcome::Continue
    }

    fn pair(&self, r: u8, src: instructions::Operand, signed: bool) -> (i64, i64) {
        if signed {
            (
                i64::from(self.reg(r) as i16),
                i64::from(self.operand(src) as i16),
            )
        } else {
            (i64::from(self.reg(r)), i64::from(self.operand(src)))
        }
    }

    fn finish_arith(&mut self, r: u8, wide: i64, signed: bool) {
        let overflow = if signed {
            !(C::MIN_SIGNED..=C::MAX_SIGNED).contains(&wide)
        } else {
            !(0..=0xffff).contains(&wide)
        };
        let result = (wide & 0xffff) as C::Word;
        self.set_reg(r, result);
        self.registers.fr = Flags::from_result(result)
            | if overflow { Flags::OVERFLOW } else { Flags::empty() };
    }

    fn arith(
        &mut self,
        r: u8,
        src: instructions::Operand,
        signed: bool,
        f: impl Fn(i64, i64) -> i64,
    ) -> StepOutcome {
        let (a, b) = self.pair(r, src, signed);
        self.finish_arith(r, f(a, b), signed);
        self.advance(src.size())
    }

    /// Division by zero is not a fault: it sets OVERFLOW|ZERO, leaves the
    /// register alone and execution continues
    fn divide(&mut self, r: u8, src: instructions::Operand, signed: bool) -> StepOutcome {
        let (a, b) = self.pair(r, src, signed);
        if b == 0 {
            warn!(pc = self.registers.pc, "division by zero");
            self.registers.fr = Flags::OVERFLOW | Flags::ZERO;
        } else {
            self.finish_arith(r, a / b, signed);
        }
        self.advance(src.size())
    }

    fn logic(
        &mut self,
        r: u8,
        src: instructions::Operand,
        f: impl Fn(C::Word, C::Word) -> C::Word,
    ) -> StepOutcome {
        let result = f(self.reg(r), self.operand(src));
        self.set_reg(r, result);
        self.registers.fr = Flags::from_result(result);
        self.advance(src.size())
    }

    /// Difference clamped to the signed range, flags from its unsigned
    /// reinterpretation; the register is untouched
    fn compare(&mut self, r: u8, src: instructions::Operand, signed: bool) -> StepOutcome {
        let (a, b) = self.pair(r, src, signed);
        let diff = (a - b).clamp(C::MIN_SIGNED, C::MAX_SIGNED);
        self.registers.fr = Flags::from_result(diff as i16 as C::Word);
        self.advance(src.size())
    }

    fn shift_left(&mut self, r: u8, count: C::Word, arithmetic: bool) -> StepOutcome {
        let value = self.reg(r);
        let shift = u32::from(count).min(63);
        let wide = u64::from(value) << shift;
        let (result, overflow) = if arithmetic {
            // The sign bit stays; OVERFLOW takes what was pushed into it
            let sign = value & 0x8000;
            ((wide as C::Word) | sign, wide & 0x8000 != 0)
        } else {
            (wide as C::Word, wide & 0x1_0000 != 0)
        };
        self.set_reg(r, result);
        self.registers.fr = Flags::from_result(result)
            | if overflow { Flags::OVERFLOW } else { Flags::empty() };
        self.advance(2)
    }

    fn shift_right(&mut self, r: u8, count: C::Word, arithmetic: bool) -> StepOutcome {
        let value = self.reg(r);
        // OVERFLOW takes the last bit shifted out of bit 0
        let overflow = count >= 1 && count <= 16 && (value >> (count - 1)) & 1 == 1;
        let shift = u32::from(count);
        let result = if arithmetic {
            ((value as i16) >> shift.min(15)) as C::Word
        } else if shift >= 16 {
            0
        } else {
            value >> shift
        };
        self.set_reg(r, result);
        self.registers.fr = Flags::from_result(result)
            | if overflow { Flags::OVERFLOW } else { Flags::empty() };
        self.advance(2)
    }

    fn jump_if(&mut self, condition: bool, adr: C::Word, x: u8) -> StepOutcome {
        if condition {
            self.registers.pc = self.effective_address(adr, x);
            StepOutcome::Continue
        } else {
            self.advance(2)
        }
    }

    fn push(&mut self, value: C::Word) -> Result<(), Termination> {
        let pc = self.registers.pc;
        let sp = self.registers.sp.wrapping_sub(1);
        if sp <= self.address_max {
            return Err(Termination::StackOverflow { pc, sp });
        }
        self.registers.sp = sp;
        self.memory.set(sp, value);
        Ok(())
    }

    /// SVC OUT: `*GR2` is the length, the low bytes of `*GR1..` are the
    /// characters
    fn system_out(&mut self) {
        let length = self.memory.get(self.registers.gr[2]);
        let buffer = self.registers.gr[1];
        let mut text = String::with_capacity(usize::from(length));
        for i in 0..length {
            let byte = (self.memory.get(buffer.wrapping_add(i)) & 0xff) as u8;
            text.push(char::from(byte));
        }
        debug!(%text, "program output");
        self.output.push(text);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::assembler::assemble;
    use indoc::indoc;

    fn machine(source: &str) -> Machine {
        Machine::new(&assemble(source).unwrap())
    }

    fn run(machine: &mut Machine) -> Termination {
        loop {
            match machine.step() {
                StepOutcome::Continue => {}
                StepOutcome::AwaitInput => panic!("unexpected input request"),
                StepOutcome::Halt(termination) => return termination,
            }
        }
    }

    #[test]
    fn simple_add_test() {
        let mut m = machine(indoc! {"
            MAIN START
                 LD    GR0,=10
                 LD    GR1,=20
                 ADDA  GR0,GR1
                 RET
                 END
        "});
        let termination = run(&mut m);

        assert_eq!(termination, Termination::Returned);
        assert_eq!(m.registers.gr[0], 30);
        assert_eq!(m.registers.gr[1], 20);
        assert_eq!(m.registers.fr, Flags::empty());
        // On the final RET the PC still points at the RET word
        assert_eq!(m.registers.pc, 5);
    }

    #[test]
    fn signed_overflow_test() {
        let mut m = machine(indoc! {"
            MAIN START
                 LD    GR0,=32767
                 LD    GR1,=1
                 ADDA  GR0,GR1
                 RET
                 END
        "});
        run(&mut m);
        assert_eq!(m.registers.gr[0], 0x8000);
        assert_eq!(m.registers.fr, Flags::SIGN | Flags::OVERFLOW);
    }

    #[test]
    fn division_by_zero_continues_test() {
        let mut m = machine(indoc! {"
            MAIN START
                 LD    GR0,=10
                 LD    GR1,=0
                 DIVA  GR0,GR1
                 NOP
                 RET
                 END
        "});
        // LD, LD, DIVA
        for _ in 0..3 {
            assert_eq!(m.step(), StepOutcome::Continue);
        }
        assert_eq!(m.registers.gr[0], 10);
        assert_eq!(m.registers.fr, Flags::OVERFLOW | Flags::ZERO);
        // Execution proceeds into the NOP
        assert_eq!(m.step(), StepOutcome::Continue);
    }

    #[test]
    fn unsigned_arithmetic_test() {
        let mut m = machine(indoc! {"
            MAIN START
                 LD    GR0,=#FFFF
                 LD    GR1,=1
                 ADDL  GR0,GR1
                 RET
                 END
        "});
        run(&mut m);
        assert_eq!(m.registers.gr[0], 0);
        assert_eq!(m.registers.fr, Flags::ZERO | Flags::OVERFLOW);
    }

    #[test]
    fn signed_memory_operand_test() {
        // The memory operand of a signed op is sign-extended too
        let mut m = machine(indoc! {"
            MAIN START
                 LD    GR0,=5
                 ADDA  GR0,M1
                 RET
            M1   DC    -1
                 END
        "});
        run(&mut m);
        assert_eq!(m.registers.gr[0], 4);
        assert_eq!(m.registers.fr, Flags::empty());
    }

    #[test]
    fn compare_test() {
        let mut m = machine(indoc! {"
            MAIN START
                 LD    GR0,=1
                 CPA   GR0,=2
                 RET
                 END
        "});
        run(&mut m);
        assert_eq!(m.registers.fr, Flags::SIGN);
        assert_eq!(m.registers.gr[0], 1);

        // CPL treats #FFFF as 65535, not -1
        let mut m = machine(indoc! {"
            MAIN START
                 LD    GR0,=#FFFF
                 CPL   GR0,=2
                 RET
                 END
        "});
        run(&mut m);
        assert_eq!(m.registers.fr, Flags::empty());
    }

    #[test]
    fn shifts_test() {
        let mut m = machine(indoc! {"
            MAIN START
                 LD    GR0,=#4000
                 SLA   GR0,1
                 RET
                 END
        "});
        run(&mut m);
        // Bit 14 moved into the (kept) sign position and OVERFLOW
        assert_eq!(m.registers.gr[0], 0x8000);
        assert!(m.registers.fr.contains(Flags::OVERFLOW));

        let mut m = machine(indoc! {"
            MAIN START
                 LD    GR0,=#8001
                 SRA   GR0,1
                 RET
                 END
        "});
        run(&mut m);
        // Sign propagates, the dropped bit lands in OVERFLOW
        assert_eq!(m.registers.gr[0], 0xc000);
        assert!(m.registers.fr.contains(Flags::OVERFLOW));

        let mut m = machine(indoc! {"
            MAIN START
                 LD    GR0,=#8000
                 SRL   GR0,1
                 RET
                 END
        "});
        run(&mut m);
        assert_eq!(m.registers.gr[0], 0x4000);
        assert!(!m.registers.fr.contains(Flags::OVERFLOW));
    }

    #[test]
    fn jumps_test() {
        let mut m = machine(indoc! {"
            MAIN START
                 LD    GR0,=0
                 JZE   SKIP
                 LD    GR1,=1
            SKIP LD    GR2,=2
                 RET
                 END
        "});
        run(&mut m);
        assert_eq!(m.registers.gr[1], 0);
        assert_eq!(m.registers.gr[2], 2);
    }

    #[test]
    fn indexed_addressing_test() {
        let mut m = machine(indoc! {"
            MAIN START
                 LD    GR1,=2
                 LD    GR0,TBL,GR1
                 RET
            TBL  DC    10,20,30
                 END
        "});
        run(&mut m);
        assert_eq!(m.registers.gr[0], 30);
    }

    #[test]
    fn stack_discipline_test() {
        let mut m = machine(indoc! {"
            MAIN START
                 PUSH  #0042
                 POP   GR3
                 RET
                 END
        "});
        let sp0 = m.registers.sp;
        assert_eq!(m.step(), StepOutcome::Continue);
        assert_eq!(m.registers.sp, sp0 - 1);
        assert_eq!(m.step(), StepOutcome::Continue);
        assert_eq!(m.registers.gr[3], 0x42);
        assert_eq!(m.registers.sp, sp0);
    }

    #[test]
    fn call_and_return_test() {
        let mut m = machine(indoc! {"
            MAIN START
                 CALL  SUB
                 LD    GR1,=7
                 RET
                 END
            SUB  START
                 LD    GR0,=9
                 RET
                 END
        "});
        assert_eq!(run(&mut m), Termination::Returned);
        assert_eq!(m.registers.gr[0], 9);
        assert_eq!(m.registers.gr[1], 7);
        assert_eq!(m.registers.sp, C::STACK_TOP);
    }

    #[test]
    fn stack_underflow_test() {
        let mut m = machine(indoc! {"
            MAIN START
                 POP   GR0
                 RET
                 END
        "});
        // A stray POP past the stack top is an underflow, not a clean exit
        assert!(matches!(
            run(&mut m),
            Termination::StackUnderflow { pc: 0, .. }
        ));
    }

    #[test]
    fn stack_overflow_test() {
        let mut m = machine(indoc! {"
            MAIN START
            LOOP PUSH  0
                 JUMP  LOOP
                 END
        "});
        assert!(matches!(run(&mut m), Termination::StackOverflow { .. }));
    }

    #[test]
    fn svc_exit_test() {
        let mut m = machine(indoc! {"
            MAIN START
                 SVC   1
                 END
        "});
        assert_eq!(run(&mut m), Termination::Exit(C::EXIT_OVF));
    }

    #[test]
    fn illegal_instruction_test() {
        let mut m = machine(indoc! {"
            MAIN START
                 DC    #9900
                 END
        "});
        assert_eq!(
            run(&mut m),
            Termination::IllegalInstruction { pc: 0, opcode: 0x99 }
        );
    }

    #[test]
    fn input_output_test() {
        let mut m = machine(indoc! {"
            MAIN START
                 IN    BUF,LEN
                 OUT   BUF,LEN
                 RET
            BUF  DS    256
            LEN  DS    1
                 END
        "});
        let outcome = loop {
            match m.step() {
                StepOutcome::Continue => {}
                other => break other,
            }
        };
        assert_eq!(outcome, StepOutcome::AwaitInput);
        m.feed_input("  hello  ");

        assert_eq!(run(&mut m), Termination::Returned);
        assert_eq!(m.take_output(), vec!["hello".to_string()]);
    }

    #[test]
    fn input_truncation_test() {
        let mut m = machine(indoc! {"
            MAIN START
                 IN    BUF,LEN
                 RET
            BUF  DS    300
            LEN  DS    1
                 END
        "});
        while m.step() == StepOutcome::Continue {}
        let long: String = std::iter::repeat('x').take(400).collect();
        m.feed_input(&long);

        let assembly = assemble(indoc! {"
            MAIN START
                 IN    BUF,LEN
                 RET
            BUF  DS    300
            LEN  DS    1
                 END
        "})
        .unwrap();
        let len_addr = assembly.debug_info.labels["MAIN:LEN"];
        assert_eq!(m.memory.get(len_addr), 256);
    }
}
