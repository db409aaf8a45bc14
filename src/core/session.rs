//! Arena-based compilation session management.
//!
//! A [`CompilationSession`] is shared by every per-function generator of a
//! compilation: it owns the arena that per-function scratch (frames, spill
//! slot lists) is allocated from, and the statistics that worker threads
//! update concurrently. All statistics counters are plain atomics sampled
//! with relaxed ordering; they are diagnostics, not synchronization points.

use bumpalo::Bump;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Aggregated code-generation statistics.
///
/// Updated concurrently by generator and optimizer threads, sampled without
/// locking by the reporting layer.
#[derive(Debug, Default)]
pub struct CodeGenStatistics {
    /// Functions fully generated.
    pub functions_generated: AtomicUsize,
    /// Instructions appended across all buffers.
    pub instructions_generated: AtomicUsize,
    /// Estimated machine-code bytes across all buffers.
    pub bytes_estimated: AtomicU64,
    /// Values spilled to stack slots.
    pub spills: AtomicUsize,
    /// Highest simultaneous register pressure observed.
    pub max_register_pressure: AtomicUsize,
    /// Instructions removed by optimization passes.
    pub instructions_eliminated: AtomicUsize,
    /// Constant expressions folded.
    pub constants_folded: AtomicUsize,
    /// Total optimizations applied (any pass, any kind).
    pub optimizations_applied: AtomicUsize,
}

/// Point-in-time copy of [`CodeGenStatistics`] for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatisticsSnapshot {
    pub functions_generated: usize,
    pub instructions_generated: usize,
    pub bytes_estimated: u64,
    pub spills: usize,
    pub max_register_pressure: usize,
    pub instructions_eliminated: usize,
    pub constants_folded: usize,
    pub optimizations_applied: usize,
}

impl CodeGenStatistics {
    pub fn record_function(&self) {
        self.functions_generated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_instructions(&self, count: usize, bytes: u64) {
        self.instructions_generated.fetch_add(count, Ordering::Relaxed);
        self.bytes_estimated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_spill(&self) {
        self.spills.fetch_add(1, Ordering::Relaxed);
    }

    /// Raise the recorded maximum pressure if `pressure` exceeds it.
    pub fn observe_pressure(&self, pressure: usize) {
        self.max_register_pressure
            .fetch_max(pressure, Ordering::Relaxed);
    }

    pub fn record_eliminated(&self, count: usize) {
        self.instructions_eliminated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_folded(&self, count: usize) {
        self.constants_folded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_optimization(&self) {
        self.optimizations_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            functions_generated: self.functions_generated.load(Ordering::Relaxed),
            instructions_generated: self.instructions_generated.load(Ordering::Relaxed),
            bytes_estimated: self.bytes_estimated.load(Ordering::Relaxed),
            spills: self.spills.load(Ordering::Relaxed),
            max_register_pressure: self.max_register_pressure.load(Ordering::Relaxed),
            instructions_eliminated: self.instructions_eliminated.load(Ordering::Relaxed),
            constants_folded: self.constants_folded.load(Ordering::Relaxed),
            optimizations_applied: self.optimizations_applied.load(Ordering::Relaxed),
        }
    }
}

/// Session shared by the generators of one compilation.
///
/// Owns nothing but a reference to the arena and the shared statistics;
/// per-function state (buffers, allocators, frames) lives in each generator
/// and borrows the arena through the session.
pub struct CompilationSession<'arena> {
    arena: &'arena Bump,
    stats: CodeGenStatistics,
}

impl<'arena> CompilationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: CodeGenStatistics::default(),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    pub fn stats(&self) -> &CodeGenStatistics {
        &self.stats
    }
}
