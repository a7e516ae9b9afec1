use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::emulator::{error::EmulationError, memory::GuestMemory};

use super::registers::Register;

/// Number of general-purpose registers held in the register file (r0-r12;
/// sp, lr and pc are kept separately).
pub const NUM_GPRS: usize = 13;

/// Condition flags of the application program status register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Apsr {
    pub n: bool,
    pub z: bool,
    pub c: bool,
    pub v: bool,
    pub q: bool,
}

impl Apsr {
    /// Packs the flags at their architectural bit positions (N=31, Z=30,
    /// C=29, V=28, Q=27).
    pub fn bits(self) -> u32 {
        (u32::from(self.n) << 31)
            | (u32::from(self.z) << 30)
            | (u32::from(self.c) << 29)
            | (u32::from(self.v) << 28)
            | (u32::from(self.q) << 27)
    }

    /// Unpacks the flag bits of `word`; reserved bits are ignored.
    pub fn from_bits(word: u32) -> Self {
        Self {
            n: word & (1 << 31) != 0,
            z: word & (1 << 30) != 0,
            c: word & (1 << 29) != 0,
            v: word & (1 << 28) != 0,
            q: word & (1 << 27) != 0,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Instruction encoding mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstructionSet {
    Arm,
    #[default]
    Thumb,
}

/// Pending conditional group left behind by a Thumb IT instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItState(pub u8);

impl ItState {
    /// The low mask bits are nonzero while instructions of the block remain.
    pub fn is_active(self) -> bool {
        self.0 & 0xf != 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// Per-thread ARMv7 register and status state.
///
/// Exclusively owned by its thread. The committed program counter is only
/// advanced by the execution loop through [`commit_branch`] and [`step_pc`];
/// every other writer goes through the branch request, so the loop always
/// observes a consistent pending-branch signal.
///
/// [`commit_branch`]: Armv7Context::commit_branch
/// [`step_pc`]: Armv7Context::step_pc
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Armv7Context {
    pub gpr: [u32; NUM_GPRS],
    pub sp: u32,
    pub lr: u32,
    pub(crate) pc: u32,
    pub(crate) branch_target: Option<u32>,
    pub apsr: Apsr,
    pub ipsr: u32,
    pub iset: InstructionSet,
    pub itstate: ItState,
    /// Base address of this thread's TLS region, 0 until acquired.
    pub tls: u32,
}

impl Armv7Context {
    /// Requests a branch to `value`; the committed pc is untouched until
    /// the execution loop picks the request up.
    pub fn write_pc(&mut self, value: u32) {
        self.branch_target = Some(value);
    }

    /// The last committed program counter.
    pub fn read_pc(&self) -> u32 {
        self.pc
    }

    /// Branch target requested since the last commit, if any.
    pub fn pending_branch(&self) -> Option<u32> {
        self.branch_target
    }

    /// Execution-loop interface: takes the pending branch, if any, into the
    /// committed pc and returns the address to fetch from.
    pub fn commit_branch(&mut self) -> u32 {
        if let Some(target) = self.branch_target.take() {
            self.pc = target;
        }
        self.pc
    }

    /// Execution-loop interface: advances the committed pc past a decoded
    /// instruction of `len` bytes.
    pub fn step_pc(&mut self, len: u32) {
        self.pc = self.pc.wrapping_add(len);
    }

    pub fn read_reg(&self, reg: Register) -> u32 {
        match reg {
            Register::Sp => self.sp,
            Register::Lr => self.lr,
            Register::Pc => self.pc,
            r => self.gpr[r as usize],
        }
    }

    /// Writes a register; a pc write is routed through the branch request.
    pub fn write_reg(&mut self, reg: Register, value: u32) {
        match reg {
            Register::Sp => self.sp = value,
            Register::Lr => self.lr = value,
            Register::Pc => self.write_pc(value),
            r => self.gpr[r as usize] = value,
        }
    }

    pub fn read_reg_by_name(&self, name: &str) -> Result<u32, EmulationError> {
        let reg = name
            .parse::<Register>()
            .map_err(|_| EmulationError::UnknownRegister(name.to_owned()))?;
        Ok(self.read_reg(reg))
    }

    pub fn write_reg_by_name(&mut self, name: &str, value: u32) -> Result<(), EmulationError> {
        let reg = name
            .parse::<Register>()
            .map_err(|_| EmulationError::UnknownRegister(name.to_owned()))?;
        self.write_reg(reg, value);
        Ok(())
    }

    /// Reads stack-spilled call argument `pos` (1-based). Arguments 1-4
    /// travel in r0-r3; argument 5 sits at the stack pointer and each later
    /// one a word above it. The call-site layout is not validated, so a
    /// position beyond the real spill area yields whatever the stack holds.
    pub fn read_stack_arg(&self, pos: u32, mem: &dyn GuestMemory) -> Result<u32, EmulationError> {
        let offset = pos.wrapping_sub(5).wrapping_mul(4);
        mem.read_u32(self.sp.wrapping_add(offset))
    }

    /// Diagnostic register dump: one `name = 0x%08x` line per register and
    /// one line listing the condition flags as 0/1 values.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for reg in Register::iter() {
            let _ = writeln!(out, "{} = {:#010x}", reg, self.read_reg(reg));
        }
        let _ = writeln!(
            out,
            "APSR = {:#010x} [N: {}, Z: {}, C: {}, V: {}, Q: {}]",
            self.apsr.bits(),
            u8::from(self.apsr.n),
            u8::from(self.apsr.z),
            u8::from(self.apsr.c),
            u8::from(self.apsr.v),
            u8::from(self.apsr.q),
        );
        out
    }
}
