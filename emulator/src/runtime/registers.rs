use bitflags::bitflags;
use parse_display::{Display, FromStr};

use crate::constants as C;

bitflags! {
    /// The three-bit flag register; PLUS is the absence of SIGN and ZERO
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Flags: C::Word {
        const ZERO     = 0b001;
        const SIGN     = 0b010;
        const OVERFLOW = 0b100;
    }
}

impl Flags {
    /// Condition bits for a 16-bit result: SIGN if bit 15 is set, ZERO on
    /// zero, otherwise PLUS. OVERFLOW is reported separately.
    #[must_use]
    pub fn from_result(word: C::Word) -> Flags {
        if word & 0x8000 != 0 {
            Flags::SIGN
        } else if word == 0 {
            Flags::ZERO
        } else {
            Flags::empty()
        }
    }
}

impl Default for Flags {
    fn default() -> Self {
        Flags::empty()
    }
}

impl std::fmt::Debug for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#05b}", self.bits())
    }
}

impl std::fmt::Display for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bit = |flag, c| if self.contains(flag) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            bit(Flags::OVERFLOW, 'O'),
            bit(Flags::SIGN, 'S'),
            bit(Flags::ZERO, 'Z')
        )
    }
}

/// Register names, in the order the debugger reports them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromStr)]
#[display(style = "UPPERCASE")]
pub enum Reg {
    Pc,
    Fr,
    Gr0,
    Gr1,
    Gr2,
    Gr3,
    Gr4,
    Gr5,
    Gr6,
    Gr7,
    Sp,
}

impl Reg {
    pub const ALL: [Reg; 11] = [
        Reg::Pc,
        Reg::Fr,
        Reg::Gr0,
        Reg::Gr1,
        Reg::Gr2,
        Reg::Gr3,
        Reg::Gr4,
        Reg::Gr5,
        Reg::Gr6,
        Reg::Gr7,
        Reg::Sp,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registers {
    pub pc: C::Address,
    pub fr: Flags,
    pub gr: [C::Word; 8],
    pub sp: C::Address,
}

impl Default for Registers {
    fn default() -> Self {
        Registers {
            pc: 0,
            fr: Flags::default(),
            gr: [0; 8],
            sp: C::STACK_TOP,
        }
    }
}

impl Registers {
    #[must_use]
    pub fn get(&self, reg: Reg) -> C::Word {
        match reg {
            Reg::Pc => self.pc,
            Reg::Fr => self.fr.bits(),
            Reg::Sp => self.sp,
            Reg::Gr0 => self.gr[0],
            Reg::Gr1 => self.gr[1],
            Reg::Gr2 => self.gr[2],
            Reg::Gr3 => self.gr[3],
            Reg::Gr4 => self.gr[4],
            Reg::Gr5 => self.gr[5],
            Reg::Gr6 => self.gr[6],
            Reg::Gr7 => self.gr[7],
        }
    }
}

impl std::fmt::Display for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PC = #{:04x} | SP = #{:04x} | FR = {}",
            self.pc, self.sp, self.fr
        )?;
        for (i, value) in self.gr.iter().enumerate() {
            write!(f, " | GR{i} = #{value:04x}")?;
        }
        Ok(())
    }
}
