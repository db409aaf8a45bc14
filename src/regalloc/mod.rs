//! Register allocation and management.
//!
//! The [`RegisterAllocator`] handles the fast path used during direct
//! AST-driven generation: scan the ABI partition for the lowest-numbered
//! free register, preferring the caller-saved set around straight-line code
//! (cheaper to preserve across calls). Exhaustion returns `None`; callers
//! either spill through the function frame or propagate
//! `RegisterAllocationFailed`. Pressure and spill counters are atomics so
//! diagnostics can sample them from other threads without locking.
//!
//! A separate whole-function graph-coloring pass lives in [`coloring`] and
//! runs off liveness results when register pressure must be minimized.

pub mod coloring;

use crate::target::{PhysReg, RegBank, RegisterSet, TargetAbi};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Physical-register bookkeeping for one generation unit.
#[derive(Debug)]
pub struct RegisterAllocator {
    /// Allocatable caller-saved GP registers for this ABI.
    caller_saved: RegisterSet,
    /// Allocatable callee-saved GP registers for this ABI.
    callee_saved: RegisterSet,
    /// Allocatable floating-point registers for this ABI.
    float_regs: RegisterSet,
    /// Currently-allocated registers (both banks share the flat id space).
    allocated: RegisterSet,
    /// Callee-saved registers handed out at least once; the epilogue must
    /// restore exactly this set.
    clobbered_callee_saved: RegisterSet,
    /// Live allocation count.
    pressure: AtomicUsize,
    /// High-water mark of `pressure`. Monotonic.
    max_pressure: AtomicUsize,
    /// Values spilled to stack slots. Monotonic.
    spills: AtomicUsize,
}

impl RegisterAllocator {
    pub fn new(abi: &TargetAbi) -> Self {
        Self {
            caller_saved: abi.caller_saved_gp,
            callee_saved: abi.callee_saved_gp,
            float_regs: abi.allocatable_fp,
            allocated: RegisterSet::EMPTY,
            clobbered_callee_saved: RegisterSet::EMPTY,
            pressure: AtomicUsize::new(0),
            max_pressure: AtomicUsize::new(0),
            spills: AtomicUsize::new(0),
        }
    }

    /// Allocate a general-purpose register.
    ///
    /// Scans the caller-saved set first when `prefer_caller_saved`, else the
    /// callee-saved set; within a set, the lowest-numbered free register
    /// wins. Returns `None` when every allocatable register is taken.
    pub fn allocate(&mut self, prefer_caller_saved: bool) -> Option<PhysReg> {
        let (first, second) = if prefer_caller_saved {
            (self.caller_saved, self.callee_saved)
        } else {
            (self.callee_saved, self.caller_saved)
        };
        let reg = first
            .difference(self.allocated)
            .lowest()
            .or_else(|| second.difference(self.allocated).lowest())?;
        self.mark_allocated(reg);
        Some(reg)
    }

    /// Allocate a floating-point register (lowest-numbered free).
    pub fn allocate_float(&mut self) -> Option<PhysReg> {
        let reg = self.float_regs.difference(self.allocated).lowest()?;
        self.mark_allocated(reg);
        Some(reg)
    }

    fn mark_allocated(&mut self, reg: PhysReg) {
        self.allocated.insert(reg);
        if self.callee_saved.contains(reg) {
            self.clobbered_callee_saved.insert(reg);
        }
        let now = self.pressure.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_pressure.fetch_max(now, Ordering::Relaxed);
    }

    /// Release a register. Freeing an unallocated register is a no-op so
    /// cleanup-on-error paths can free unconditionally.
    pub fn free(&mut self, reg: PhysReg) {
        if !self.allocated.contains(reg) {
            return;
        }
        self.allocated.remove(reg);
        self.pressure.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn is_allocated(&self, reg: PhysReg) -> bool {
        self.allocated.contains(reg)
    }

    /// Registers currently allocated, for debugging and tests.
    pub fn allocated_set(&self) -> RegisterSet {
        self.allocated
    }

    /// Callee-saved registers touched since the last reset; drives epilogue
    /// save/restore emission.
    pub fn clobbered_callee_saved(&self) -> RegisterSet {
        self.clobbered_callee_saved
    }

    /// Record that a live value was pushed to a stack slot.
    pub fn record_spill(&self) {
        self.spills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn current_pressure(&self) -> usize {
        self.pressure.load(Ordering::Relaxed)
    }

    pub fn max_pressure(&self) -> usize {
        self.max_pressure.load(Ordering::Relaxed)
    }

    pub fn spill_count(&self) -> usize {
        self.spills.load(Ordering::Relaxed)
    }

    /// Reset for a new function. Counters for max pressure and spills are
    /// intentionally preserved: they aggregate across the generation unit's
    /// lifetime and only ever grow.
    pub fn reset(&mut self) {
        self.allocated = RegisterSet::EMPTY;
        self.clobbered_callee_saved = RegisterSet::EMPTY;
        self.pressure.store(0, Ordering::Relaxed);
    }

    /// Total number of allocatable registers in a bank.
    pub fn capacity(&self, bank: RegBank) -> u32 {
        match bank {
            RegBank::GeneralPurpose => self.caller_saved.union(self.callee_saved).count(),
            RegBank::Float => self.float_regs.count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{CallingConvention, TargetArchitecture};

    fn sysv_allocator() -> RegisterAllocator {
        let abi =
            TargetAbi::new(TargetArchitecture::X86_64, CallingConvention::SystemV).unwrap();
        RegisterAllocator::new(&abi)
    }

    #[test]
    fn test_no_double_allocation() {
        let mut alloc = sysv_allocator();
        let a = alloc.allocate(true).unwrap();
        let b = alloc.allocate(true).unwrap();
        assert_ne!(a, b);
        assert!(alloc.is_allocated(a));
        assert!(alloc.is_allocated(b));
    }

    #[test]
    fn test_deterministic_lowest_free_policy() {
        let mut alloc = sysv_allocator();
        // Caller-saved x86-64 set starts at RAX(0), then RCX(1).
        assert_eq!(alloc.allocate(true).unwrap().id(), 0);
        assert_eq!(alloc.allocate(true).unwrap().id(), 1);
        // Callee-saved set starts at RBX(3).
        assert_eq!(alloc.allocate(false).unwrap().id(), 3);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut alloc = sysv_allocator();
        let capacity = alloc.capacity(RegBank::GeneralPurpose) as usize;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..capacity {
            let reg = alloc.allocate(true).expect("within capacity");
            assert!(seen.insert(reg), "duplicate register handed out");
        }
        // One more than the architecture provides must fail, not wrap.
        assert_eq!(alloc.allocate(true), None);
        assert_eq!(alloc.allocate(false), None);
    }

    #[test]
    fn test_free_is_idempotent_and_reusable() {
        let mut alloc = sysv_allocator();
        let a = alloc.allocate(true).unwrap();
        alloc.free(a);
        alloc.free(a); // no-op
        assert_eq!(alloc.current_pressure(), 0);
        // A freed register may be immediately reused.
        assert_eq!(alloc.allocate(true), Some(a));
    }

    #[test]
    fn test_pressure_tracking() {
        let mut alloc = sysv_allocator();
        let a = alloc.allocate(true).unwrap();
        let b = alloc.allocate(true).unwrap();
        assert_eq!(alloc.current_pressure(), 2);
        assert_eq!(alloc.max_pressure(), 2);
        alloc.free(a);
        alloc.free(b);
        assert_eq!(alloc.current_pressure(), 0);
        // Max is monotonic.
        assert_eq!(alloc.max_pressure(), 2);
    }

    #[test]
    fn test_callee_saved_clobber_tracking() {
        let mut alloc = sysv_allocator();
        let r = alloc.allocate(false).unwrap(); // callee-saved RBX
        assert!(alloc.clobbered_callee_saved().contains(r));
        alloc.free(r);
        // Once clobbered, stays recorded for the epilogue.
        assert!(alloc.clobbered_callee_saved().contains(r));
    }
}
