//! Optimization pass management.
//!
//! The optimizer owns a pipeline of passes gated by an optimization level.
//! Each level is a fixed bitmask of enabled passes; individual passes can be
//! toggled at runtime on top of the level default. Passes operate on one
//! function's instruction sequence at a time under the buffer's lock and
//! report whether they changed anything; the driver re-runs the enabled
//! passes until a full round reports no change or the iteration cap is hit.
//! The cap guarantees termination even if two passes could oscillate.
//!
//! Statistics counters use relaxed ordering: they are diagnostics, not
//! synchronization points.

pub mod match_opt;
pub mod passes;

pub use match_opt::MatchStrategy;

use crate::core::error::CodegenResult;
use crate::inst::{InstructionBuffer, Opcode};
use crate::labels::LabelManager;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Pass bits.
pub const PASS_PEEPHOLE: u32 = 1 << 0;
pub const PASS_CONST_FOLD: u32 = 1 << 1;
pub const PASS_CONST_PROP: u32 = 1 << 2;
pub const PASS_COPY_PROP: u32 = 1 << 3;
pub const PASS_DCE: u32 = 1 << 4;
pub const PASS_CSE: u32 = 1 << 5;
pub const PASS_LICM: u32 = 1 << 6;
/// Match dispatch strategy selection (consulted at generation time).
pub const PASS_MATCH_DISPATCH: u32 = 1 << 7;

/// Upper bound on driver rounds, so mutually-undoing passes cannot loop.
pub const MAX_PASS_ITERATIONS: usize = 10;

/// Optimization level state machine: each level enables everything the
/// previous one did plus its own passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptLevel {
    None,
    Basic,
    Standard,
    Aggressive,
}

impl OptLevel {
    /// Fixed pass bitmask for the level.
    pub fn pass_mask(self) -> u32 {
        match self {
            OptLevel::None => 0,
            OptLevel::Basic => PASS_PEEPHOLE | PASS_CONST_FOLD,
            OptLevel::Standard => {
                OptLevel::Basic.pass_mask()
                    | PASS_CONST_PROP
                    | PASS_COPY_PROP
                    | PASS_DCE
                    | PASS_CSE
            }
            OptLevel::Aggressive => {
                OptLevel::Standard.pass_mask() | PASS_LICM | PASS_MATCH_DISPATCH
            }
        }
    }
}

/// Shared, lock-free optimizer statistics.
#[derive(Debug, Default)]
pub struct OptStats {
    pub passes_executed: AtomicUsize,
    pub instructions_eliminated: AtomicUsize,
    pub constants_folded: AtomicUsize,
    pub optimizations_applied: AtomicUsize,
    pub jump_tables_created: AtomicUsize,
    pub binary_searches_created: AtomicUsize,
}

impl OptStats {
    pub fn record_pass(&self) {
        self.passes_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eliminated(&self, count: usize) {
        self.instructions_eliminated.fetch_add(count, Ordering::Relaxed);
        if count > 0 {
            self.optimizations_applied.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_folded(&self, count: usize) {
        self.constants_folded.fetch_add(count, Ordering::Relaxed);
        if count > 0 {
            self.optimizations_applied.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_applied(&self) {
        self.optimizations_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_jump_table(&self) {
        self.jump_tables_created.fetch_add(1, Ordering::Relaxed);
        self.optimizations_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_binary_search(&self) {
        self.binary_searches_created.fetch_add(1, Ordering::Relaxed);
        self.optimizations_applied.fetch_add(1, Ordering::Relaxed);
    }
}

/// Registers the optimizer must assume live beyond what liveness analysis
/// sees: ABI return registers at function exits, and the stack/frame
/// anchors everywhere (implicit in every push, pop, and spill access).
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveRoots<'a> {
    /// Live at every exit block (the ABI return registers).
    pub at_exits: &'a [crate::target::PhysReg],
    /// Live at every point (stack pointer, frame pointer).
    pub pinned: &'a [crate::target::PhysReg],
}

/// Per-optimizer configuration and counters.
#[derive(Debug)]
pub struct Optimizer {
    level: OptLevel,
    /// Passes forced on regardless of level.
    forced_on: AtomicU32,
    /// Passes forced off regardless of level.
    forced_off: AtomicU32,
    pub stats: OptStats,
}

impl Optimizer {
    pub fn new(level: OptLevel) -> Self {
        Self {
            level,
            forced_on: AtomicU32::new(0),
            forced_off: AtomicU32::new(0),
            stats: OptStats::default(),
        }
    }

    pub fn level(&self) -> OptLevel {
        self.level
    }

    /// Enable a pass regardless of the level default.
    pub fn enable_pass(&self, pass: u32) {
        self.forced_on.fetch_or(pass, Ordering::Relaxed);
        self.forced_off.fetch_and(!pass, Ordering::Relaxed);
    }

    /// Disable a pass regardless of the level default.
    pub fn disable_pass(&self, pass: u32) {
        self.forced_off.fetch_or(pass, Ordering::Relaxed);
        self.forced_on.fetch_and(!pass, Ordering::Relaxed);
    }

    /// Effective pass mask: level default, plus forced-on, minus forced-off.
    pub fn enabled_passes(&self) -> u32 {
        (self.level.pass_mask() | self.forced_on.load(Ordering::Relaxed))
            & !self.forced_off.load(Ordering::Relaxed)
    }

    pub fn is_pass_enabled(&self, pass: u32) -> bool {
        self.enabled_passes() & pass != 0
    }

    /// Run the enabled pipeline over a function's buffer to a fixed point.
    ///
    /// `roots` names the registers liveness cannot see on its own (ABI
    /// return registers at exits, stack/frame anchors everywhere), so
    /// dead-code elimination keeps a final `mov rax, …` before `ret` and
    /// never deletes frame teardown. Returns whether anything changed.
    pub fn run(
        &self,
        buffer: &InstructionBuffer,
        labels: &LabelManager,
        roots: LiveRoots<'_>,
    ) -> CodegenResult<bool> {
        let enabled = self.enabled_passes();
        if enabled == 0 {
            return Ok(false);
        }
        let mut any_change = false;
        for round in 0..MAX_PASS_ITERATIONS {
            let changed = buffer.with_instructions_mut(|insts| {
                passes::run_round(self, enabled, insts, labels, roots)
            })?;
            if !changed {
                break;
            }
            log::debug!("optimizer round {round} changed the sequence");
            any_change = true;
        }
        Ok(any_change)
    }
}

/// Fold an integer ALU operation with the target's machine arithmetic:
/// wrapping two's-complement, shifts masked to the 64-bit width.
///
/// Correctness-critical: folding at compile time must produce exactly the
/// value machine execution of the unfolded sequence would.
pub fn fold_binary(opcode: Opcode, lhs: i64, rhs: i64) -> Option<i64> {
    let v = match opcode {
        Opcode::Add => lhs.wrapping_add(rhs),
        Opcode::Sub => lhs.wrapping_sub(rhs),
        Opcode::Imul => lhs.wrapping_mul(rhs),
        Opcode::And => lhs & rhs,
        Opcode::Or => lhs | rhs,
        Opcode::Xor => lhs ^ rhs,
        Opcode::Shl => lhs.wrapping_shl((rhs & 63) as u32),
        Opcode::Shr => ((lhs as u64).wrapping_shr((rhs & 63) as u32)) as i64,
        _ => return None,
    };
    Some(v)
}

/// Fold a floating-point ALU operation under IEEE-754 double semantics.
/// Immediates carry `f64` bit patterns.
pub fn fold_float_binary(opcode: Opcode, lhs_bits: i64, rhs_bits: i64) -> Option<i64> {
    let lhs = f64::from_bits(lhs_bits as u64);
    let rhs = f64::from_bits(rhs_bits as u64);
    let v = match opcode {
        Opcode::Fadd => lhs + rhs,
        Opcode::Fsub => lhs - rhs,
        Opcode::Fmul => lhs * rhs,
        Opcode::Fdiv => lhs / rhs,
        _ => return None,
    };
    Some(v.to_bits() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_masks_are_cumulative() {
        assert_eq!(OptLevel::None.pass_mask(), 0);
        let basic = OptLevel::Basic.pass_mask();
        let standard = OptLevel::Standard.pass_mask();
        let aggressive = OptLevel::Aggressive.pass_mask();
        assert_eq!(basic & standard, basic);
        assert_eq!(standard & aggressive, standard);
        assert!(aggressive & PASS_LICM != 0);
        assert!(basic & PASS_DCE == 0);
    }

    #[test]
    fn test_runtime_pass_overrides() {
        let opt = Optimizer::new(OptLevel::Basic);
        assert!(opt.is_pass_enabled(PASS_PEEPHOLE));
        assert!(!opt.is_pass_enabled(PASS_DCE));

        // Disable constant folding while keeping peephole.
        opt.disable_pass(PASS_CONST_FOLD);
        assert!(opt.is_pass_enabled(PASS_PEEPHOLE));
        assert!(!opt.is_pass_enabled(PASS_CONST_FOLD));

        opt.enable_pass(PASS_DCE);
        assert!(opt.is_pass_enabled(PASS_DCE));

        opt.enable_pass(PASS_CONST_FOLD);
        assert!(opt.is_pass_enabled(PASS_CONST_FOLD));
    }

    #[test]
    fn test_fold_binary_basic() {
        assert_eq!(fold_binary(Opcode::Add, 6, 7), Some(13));
        assert_eq!(fold_binary(Opcode::Sub, 6, 7), Some(-1));
        assert_eq!(fold_binary(Opcode::Imul, 6, 7), Some(42));
        assert_eq!(fold_binary(Opcode::Mov, 6, 7), None);
    }

    #[test]
    fn test_fold_binary_wraps_like_machine_arithmetic() {
        // Signed 64-bit wraparound must match what the hardware would do.
        assert_eq!(fold_binary(Opcode::Add, i64::MAX, 1), Some(i64::MIN));
        assert_eq!(
            fold_binary(Opcode::Imul, i64::MAX, 2),
            Some(i64::MAX.wrapping_mul(2))
        );
        // Signed 32-bit boundary expressed in 64-bit arithmetic.
        let a = i32::MAX as i64;
        assert_eq!(fold_binary(Opcode::Add, a, 1), Some(a + 1));
    }

    #[test]
    fn test_fold_float_is_ieee() {
        let bits = |v: f64| v.to_bits() as i64;
        let folded = fold_float_binary(Opcode::Fadd, bits(0.1), bits(0.2)).unwrap();
        assert_eq!(f64::from_bits(folded as u64), 0.1 + 0.2);
        // Division by zero follows IEEE, not a compile-time error.
        let inf = fold_float_binary(Opcode::Fdiv, bits(1.0), bits(0.0)).unwrap();
        assert!(f64::from_bits(inf as u64).is_infinite());
    }
}
