//! Target architecture and calling-convention descriptions.
//!
//! Everything the backend needs to know about a target is fixed at generator
//! creation time by a `(TargetArchitecture, CallingConvention)` pair: the
//! caller-saved/callee-saved register partition, the argument and return
//! registers, the frame/stack registers, and the register-name tables the
//! assembly emitter consults. Pointer width is 64-bit throughout.

use crate::core::error::{CodegenError, CodegenResult};

/// Architectures the backend can emit for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetArchitecture {
    X86_64,
    Aarch64,
    Wasm32,
}

/// Calling conventions, paired with a compatible architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    /// System V AMD64 ABI (x86-64 Linux/Unix).
    SystemV,
    /// AAPCS64 (AArch64 procedure call standard).
    Aapcs64,
    /// Flat locals model for WebAssembly text output.
    WasmBasic,
}

/// A physical register identifier, flat per architecture.
///
/// x86-64: 0-15 are RAX..R15 in encoding order, 16-31 are XMM0-XMM15.
/// AArch64: 0-30 are X0..X30, 31 is SP, 32-63 are V0-V31.
/// Wasm32: 0-15 are pseudo-register locals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysReg(pub u8);

impl PhysReg {
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    pub const fn id(self) -> u8 {
        self.0
    }
}

/// Register bank: general-purpose integer or floating-point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegBank {
    GeneralPurpose,
    Float,
}

/// Bit set over physical register ids.
///
/// Capacity is fixed at 64 registers, enough for every supported
/// architecture's flat numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterSet(pub u64);

impl RegisterSet {
    pub const EMPTY: RegisterSet = RegisterSet(0);

    pub const fn from_ids(ids: &[u8]) -> Self {
        let mut bits = 0u64;
        let mut i = 0;
        while i < ids.len() {
            bits |= 1u64 << ids[i];
            i += 1;
        }
        Self(bits)
    }

    pub fn contains(&self, reg: PhysReg) -> bool {
        reg.0 < 64 && (self.0 & (1u64 << reg.0)) != 0
    }

    pub fn insert(&mut self, reg: PhysReg) {
        if reg.0 < 64 {
            self.0 |= 1u64 << reg.0;
        }
    }

    pub fn remove(&mut self, reg: PhysReg) {
        if reg.0 < 64 {
            self.0 &= !(1u64 << reg.0);
        }
    }

    pub fn union(self, other: RegisterSet) -> RegisterSet {
        RegisterSet(self.0 | other.0)
    }

    pub fn intersect(self, other: RegisterSet) -> RegisterSet {
        RegisterSet(self.0 & other.0)
    }

    pub fn difference(self, other: RegisterSet) -> RegisterSet {
        RegisterSet(self.0 & !other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest-numbered register in the set, if any. Allocation policy relies
    /// on this being deterministic.
    pub fn lowest(&self) -> Option<PhysReg> {
        if self.0 == 0 {
            None
        } else {
            Some(PhysReg(self.0.trailing_zeros() as u8))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = PhysReg> + '_ {
        (0u8..64).filter(|&i| self.0 & (1u64 << i) != 0).map(PhysReg)
    }
}

// x86-64 encoding-order ids.
pub mod x86 {
    use super::PhysReg;

    pub const RAX: PhysReg = PhysReg(0);
    pub const RCX: PhysReg = PhysReg(1);
    pub const RDX: PhysReg = PhysReg(2);
    pub const RBX: PhysReg = PhysReg(3);
    pub const RSP: PhysReg = PhysReg(4);
    pub const RBP: PhysReg = PhysReg(5);
    pub const RSI: PhysReg = PhysReg(6);
    pub const RDI: PhysReg = PhysReg(7);
    pub const R8: PhysReg = PhysReg(8);
    pub const R9: PhysReg = PhysReg(9);
    pub const R10: PhysReg = PhysReg(10);
    pub const R11: PhysReg = PhysReg(11);
    pub const R12: PhysReg = PhysReg(12);
    pub const R13: PhysReg = PhysReg(13);
    pub const R14: PhysReg = PhysReg(14);
    pub const R15: PhysReg = PhysReg(15);
    pub const XMM0: PhysReg = PhysReg(16);
    pub const XMM1: PhysReg = PhysReg(17);

    pub const fn xmm(n: u8) -> PhysReg {
        PhysReg(16 + n)
    }
}

pub mod aarch64 {
    use super::PhysReg;

    pub const fn x(n: u8) -> PhysReg {
        PhysReg(n)
    }

    pub const SP: PhysReg = PhysReg(31);
    pub const FP: PhysReg = PhysReg(29); // x29
    pub const LR: PhysReg = PhysReg(30); // x30

    pub const fn v(n: u8) -> PhysReg {
        PhysReg(32 + n)
    }
}

/// Everything ABI-dependent, resolved once from the `(arch, convention)`
/// pair supplied at generator creation.
#[derive(Debug, Clone)]
pub struct TargetAbi {
    pub arch: TargetArchitecture,
    pub convention: CallingConvention,
    /// General-purpose registers the allocator may hand out.
    pub allocatable_gp: RegisterSet,
    /// Caller-saved subset of `allocatable_gp`.
    pub caller_saved_gp: RegisterSet,
    /// Callee-saved subset of `allocatable_gp`.
    pub callee_saved_gp: RegisterSet,
    /// Floating-point registers the allocator may hand out.
    pub allocatable_fp: RegisterSet,
    /// Integer argument registers, in assignment order.
    pub int_arg_regs: &'static [PhysReg],
    /// Floating-point argument registers, in assignment order.
    pub float_arg_regs: &'static [PhysReg],
    pub int_return_reg: PhysReg,
    pub float_return_reg: PhysReg,
    pub stack_pointer: PhysReg,
    pub frame_pointer: PhysReg,
}

/// System V x86-64 GP argument registers: RDI, RSI, RDX, RCX, R8, R9.
const SYSV_INT_ARGS: [PhysReg; 6] =
    [x86::RDI, x86::RSI, x86::RDX, x86::RCX, x86::R8, x86::R9];

/// System V x86-64 FP argument registers: XMM0-XMM7.
const SYSV_FLOAT_ARGS: [PhysReg; 8] = [
    PhysReg(16),
    PhysReg(17),
    PhysReg(18),
    PhysReg(19),
    PhysReg(20),
    PhysReg(21),
    PhysReg(22),
    PhysReg(23),
];

/// AAPCS64 integer argument registers: x0-x7.
const AAPCS_INT_ARGS: [PhysReg; 8] = [
    PhysReg(0),
    PhysReg(1),
    PhysReg(2),
    PhysReg(3),
    PhysReg(4),
    PhysReg(5),
    PhysReg(6),
    PhysReg(7),
];

/// AAPCS64 FP argument registers: v0-v7.
const AAPCS_FLOAT_ARGS: [PhysReg; 8] = [
    PhysReg(32),
    PhysReg(33),
    PhysReg(34),
    PhysReg(35),
    PhysReg(36),
    PhysReg(37),
    PhysReg(38),
    PhysReg(39),
];

/// Wasm pseudo-register "argument" locals.
const WASM_INT_ARGS: [PhysReg; 4] = [PhysReg(0), PhysReg(1), PhysReg(2), PhysReg(3)];
const WASM_FLOAT_ARGS: [PhysReg; 0] = [];

impl TargetAbi {
    /// Resolve an `(architecture, convention)` pair.
    ///
    /// An incompatible pair is an `AbiViolation`: conventions are not
    /// portable across architectures.
    pub fn new(
        arch: TargetArchitecture,
        convention: CallingConvention,
    ) -> CodegenResult<Self> {
        match (arch, convention) {
            (TargetArchitecture::X86_64, CallingConvention::SystemV) => Ok(Self {
                arch,
                convention,
                // All 16 GP registers except RSP(4)/RBP(5), which anchor the frame.
                caller_saved_gp: RegisterSet::from_ids(&[0, 1, 2, 6, 7, 8, 9, 10, 11]),
                callee_saved_gp: RegisterSet::from_ids(&[3, 12, 13, 14, 15]),
                allocatable_gp: RegisterSet::from_ids(&[
                    0, 1, 2, 3, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
                ]),
                // XMM8-XMM15 are scratch; XMM0-7 carry arguments.
                allocatable_fp: RegisterSet::from_ids(&[24, 25, 26, 27, 28, 29, 30, 31]),
                int_arg_regs: &SYSV_INT_ARGS,
                float_arg_regs: &SYSV_FLOAT_ARGS,
                int_return_reg: x86::RAX,
                float_return_reg: x86::XMM0,
                stack_pointer: x86::RSP,
                frame_pointer: x86::RBP,
            }),
            (TargetArchitecture::Aarch64, CallingConvention::Aapcs64) => Ok(Self {
                arch,
                convention,
                // x0-x15 caller-saved; x16/x17 (IP), x18 (platform) reserved.
                caller_saved_gp: RegisterSet::from_ids(&[
                    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
                ]),
                callee_saved_gp: RegisterSet::from_ids(&[
                    19, 20, 21, 22, 23, 24, 25, 26, 27, 28,
                ]),
                allocatable_gp: RegisterSet::from_ids(&[
                    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 19, 20, 21,
                    22, 23, 24, 25, 26, 27, 28,
                ]),
                allocatable_fp: RegisterSet::from_ids(&[48, 49, 50, 51, 52, 53, 54, 55]),
                int_arg_regs: &AAPCS_INT_ARGS,
                float_arg_regs: &AAPCS_FLOAT_ARGS,
                int_return_reg: PhysReg(0),
                float_return_reg: PhysReg(32),
                stack_pointer: aarch64::SP,
                frame_pointer: aarch64::FP,
            }),
            (TargetArchitecture::Wasm32, CallingConvention::WasmBasic) => Ok(Self {
                arch,
                convention,
                caller_saved_gp: RegisterSet::from_ids(&[
                    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
                ]),
                callee_saved_gp: RegisterSet::EMPTY,
                allocatable_gp: RegisterSet::from_ids(&[
                    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
                ]),
                allocatable_fp: RegisterSet::EMPTY,
                int_arg_regs: &WASM_INT_ARGS,
                float_arg_regs: &WASM_FLOAT_ARGS,
                int_return_reg: PhysReg(0),
                float_return_reg: PhysReg(0),
                stack_pointer: PhysReg(15),
                frame_pointer: PhysReg(14),
            }),
            _ => Err(CodegenError::AbiViolation {
                reason: format!(
                    "calling convention {convention:?} is not valid for {arch:?}"
                ),
            }),
        }
    }

    /// Caller-saved and callee-saved partition combined.
    pub fn allocatable(&self, bank: RegBank) -> RegisterSet {
        match bank {
            RegBank::GeneralPurpose => self.allocatable_gp,
            RegBank::Float => self.allocatable_fp,
        }
    }

    pub fn is_callee_saved(&self, reg: PhysReg) -> bool {
        self.callee_saved_gp.contains(reg)
    }
}

/// x86-64 64-bit register names, indexed by id.
const X86_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10",
    "r11", "r12", "r13", "r14", "r15",
];

/// x86-64 8-bit register names (for SETcc destinations).
const X86_BYTE_NAMES: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b",
    "r11b", "r12b", "r13b", "r14b", "r15b",
];

/// Register name for display in the given architecture's syntax, without any
/// dialect prefix (`%`, `$`).
pub fn register_name(arch: TargetArchitecture, reg: PhysReg) -> String {
    match arch {
        TargetArchitecture::X86_64 => {
            if (reg.0 as usize) < 16 {
                X86_NAMES[reg.0 as usize].to_string()
            } else {
                format!("xmm{}", reg.0 - 16)
            }
        }
        TargetArchitecture::Aarch64 => {
            if reg.0 == 31 {
                "sp".to_string()
            } else if reg.0 < 31 {
                format!("x{}", reg.0)
            } else {
                format!("v{}", reg.0 - 32)
            }
        }
        TargetArchitecture::Wasm32 => format!("$r{}", reg.0),
    }
}

/// 8-bit register name, used for condition-code materialization on x86-64.
/// Other architectures have no sub-register naming and return the full name.
pub fn byte_register_name(arch: TargetArchitecture, reg: PhysReg) -> String {
    match arch {
        TargetArchitecture::X86_64 if (reg.0 as usize) < 16 => {
            X86_BYTE_NAMES[reg.0 as usize].to_string()
        }
        _ => register_name(arch, reg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_pair_validation() {
        assert!(TargetAbi::new(TargetArchitecture::X86_64, CallingConvention::SystemV).is_ok());
        assert!(TargetAbi::new(TargetArchitecture::Aarch64, CallingConvention::Aapcs64).is_ok());
        assert!(
            TargetAbi::new(TargetArchitecture::X86_64, CallingConvention::Aapcs64).is_err()
        );
    }

    #[test]
    fn test_sysv_partition_is_disjoint() {
        let abi =
            TargetAbi::new(TargetArchitecture::X86_64, CallingConvention::SystemV).unwrap();
        assert!(abi
            .caller_saved_gp
            .intersect(abi.callee_saved_gp)
            .is_empty());
        assert_eq!(
            abi.caller_saved_gp.union(abi.callee_saved_gp),
            abi.allocatable_gp
        );
        // RSP and RBP are never allocatable.
        assert!(!abi.allocatable_gp.contains(x86::RSP));
        assert!(!abi.allocatable_gp.contains(x86::RBP));
    }

    #[test]
    fn test_register_set_lowest_is_deterministic() {
        let set = RegisterSet::from_ids(&[9, 3, 12]);
        assert_eq!(set.lowest(), Some(PhysReg(3)));
        let mut set = set;
        set.remove(PhysReg(3));
        assert_eq!(set.lowest(), Some(PhysReg(9)));
    }

    #[test]
    fn test_register_names() {
        assert_eq!(register_name(TargetArchitecture::X86_64, x86::RAX), "rax");
        assert_eq!(register_name(TargetArchitecture::X86_64, x86::xmm(0)), "xmm0");
        assert_eq!(byte_register_name(TargetArchitecture::X86_64, x86::RAX), "al");
        assert_eq!(register_name(TargetArchitecture::Aarch64, PhysReg(5)), "x5");
        assert_eq!(register_name(TargetArchitecture::Aarch64, aarch64::SP), "sp");
    }
}
