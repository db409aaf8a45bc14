//! Append-only instruction buffer.
//!
//! The buffer exclusively owns its instructions; emission order is
//! fall-through order and is semantically significant. Appends go through a
//! mutex, while the running totals (instructions generated, estimated bytes)
//! are additionally kept in atomics so statistics can be sampled from other
//! threads without taking the lock. Optimization passes mutate the sequence
//! in place under the same lock via [`InstructionBuffer::with_instructions_mut`].

use super::instruction::Instruction;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct InstructionBuffer {
    instructions: Mutex<Vec<Instruction>>,
    /// Current sequence length, mirrored for lock-free reads.
    len: AtomicUsize,
    /// Monotonic count of instructions ever appended.
    total_generated: AtomicUsize,
    /// Monotonic estimated byte total of instructions ever appended.
    bytes_estimated: AtomicU64,
}

impl InstructionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an instruction, returning its index in the sequence.
    pub fn append(&self, inst: Instruction) -> usize {
        let size = inst.estimated_size() as u64;
        let mut insts = self.instructions.lock().unwrap();
        insts.push(inst);
        let index = insts.len() - 1;
        self.len.store(insts.len(), Ordering::Relaxed);
        self.total_generated.fetch_add(1, Ordering::Relaxed);
        self.bytes_estimated.fetch_add(size, Ordering::Relaxed);
        index
    }

    /// Current number of instructions, sampled without the lock.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monotonic total of instructions ever appended (does not decrease when
    /// the optimizer removes entries).
    pub fn total_generated(&self) -> usize {
        self.total_generated.load(Ordering::Relaxed)
    }

    /// Monotonic estimated byte total.
    pub fn estimated_bytes(&self) -> u64 {
        self.bytes_estimated.load(Ordering::Relaxed)
    }

    /// Run `f` over the instruction sequence under the buffer's lock.
    /// This is the only way to iterate consistently while other threads may
    /// be appending.
    pub fn with_instructions<R>(&self, f: impl FnOnce(&[Instruction]) -> R) -> R {
        let insts = self.instructions.lock().unwrap();
        f(&insts)
    }

    /// Run `f` with mutable access under the lock. Used by optimization
    /// passes and backpatching; the mirrored length is refreshed afterwards.
    pub fn with_instructions_mut<R>(&self, f: impl FnOnce(&mut Vec<Instruction>) -> R) -> R {
        let mut insts = self.instructions.lock().unwrap();
        let result = f(&mut insts);
        self.len.store(insts.len(), Ordering::Relaxed);
        result
    }

    /// Replace the instruction at `index` (prologue backpatching).
    pub fn replace(&self, index: usize, inst: Instruction) {
        let mut insts = self.instructions.lock().unwrap();
        insts[index] = inst;
    }

    /// Clone the sequence for lock-free downstream consumption (CFG build,
    /// emission). The snapshot is decoupled from later appends.
    pub fn snapshot(&self) -> Vec<Instruction> {
        self.instructions.lock().unwrap().clone()
    }
}
