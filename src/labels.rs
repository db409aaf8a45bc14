//! Label management.
//!
//! Labels are named program points: function entries, branch targets, loop
//! boundaries. Names are unique within a manager (`hint` plus an atomically
//! incremented id), may be referenced by jumps before they are defined, and
//! must be defined exactly once before assembly emission. Id generation is
//! atomic so concurrent per-function generators can share one manager,
//! though the common case scopes one manager per function.

use crate::core::error::{CodegenError, CodegenResult};
use hashbrown::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// What a label marks, for diagnostics and CFG construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    FunctionEntry,
    BranchTarget,
    LoopStart,
    LoopEnd,
}

/// Opaque handle to a label within its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(usize);

#[derive(Debug, Clone)]
pub struct Label {
    pub kind: LabelKind,
    pub name: String,
    /// Instruction index the label is defined at; `None` until defined.
    pub defined_at: Option<usize>,
}

#[derive(Debug, Default)]
struct LabelTable {
    labels: Vec<Label>,
    by_name: HashMap<String, LabelId>,
}

#[derive(Debug, Default)]
pub struct LabelManager {
    table: Mutex<LabelTable>,
    next_id: AtomicUsize,
}

impl LabelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh label. The returned name is `hint` plus a unique id.
    pub fn create_label(&self, kind: LabelKind, hint: &str) -> LabelId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{hint}_{id}");
        let mut table = self.table.lock().unwrap();
        let label_id = LabelId(table.labels.len());
        table.by_name.insert(name.clone(), label_id);
        table.labels.push(Label { kind, name, defined_at: None });
        label_id
    }

    /// Reserve a label with an exact name (function entry symbols, which
    /// must match the linkage name). Fails if the name is taken.
    pub fn create_named(&self, kind: LabelKind, name: &str) -> CodegenResult<LabelId> {
        let mut table = self.table.lock().unwrap();
        if table.by_name.contains_key(name) {
            return Err(CodegenError::LabelRedefined { name: name.to_string() });
        }
        let label_id = LabelId(table.labels.len());
        table.by_name.insert(name.to_string(), label_id);
        table.labels.push(Label {
            kind,
            name: name.to_string(),
            defined_at: None,
        });
        Ok(label_id)
    }

    /// Bind a label to an instruction index. A label is defined exactly once.
    pub fn define_label(&self, id: LabelId, index: usize) -> CodegenResult<()> {
        let mut table = self.table.lock().unwrap();
        let label = table
            .labels
            .get_mut(id.0)
            .ok_or_else(|| CodegenError::LabelNotFound { name: format!("#{}", id.0) })?;
        if label.defined_at.is_some() {
            return Err(CodegenError::LabelRedefined { name: label.name.clone() });
        }
        label.defined_at = Some(index);
        Ok(())
    }

    pub fn is_defined(&self, id: LabelId) -> bool {
        let table = self.table.lock().unwrap();
        table.labels.get(id.0).is_some_and(|l| l.defined_at.is_some())
    }

    pub fn name(&self, id: LabelId) -> String {
        let table = self.table.lock().unwrap();
        table.labels[id.0].name.clone()
    }

    /// Instruction index a label name is defined at, if defined.
    pub fn definition_of(&self, name: &str) -> Option<usize> {
        let table = self.table.lock().unwrap();
        let id = *table.by_name.get(name)?;
        table.labels[id.0].defined_at
    }

    pub fn lookup(&self, name: &str) -> Option<LabelId> {
        let table = self.table.lock().unwrap();
        table.by_name.get(name).copied()
    }

    /// All defined labels as `(name, index)` pairs, ordered by definition
    /// index then creation order. Deterministic for the emitter.
    pub fn definitions(&self) -> Vec<(String, usize)> {
        let table = self.table.lock().unwrap();
        let mut defs: Vec<(String, usize, usize)> = table
            .labels
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.defined_at.map(|at| (l.name.clone(), at, i)))
            .collect();
        defs.sort_by_key(|&(_, at, created)| (at, created));
        defs.into_iter().map(|(name, at, _)| (name, at)).collect()
    }

    /// Names referenced anywhere but never defined. Non-empty means the
    /// buffer is not ready for emission.
    pub fn undefined_names(&self) -> Vec<String> {
        let table = self.table.lock().unwrap();
        table
            .labels
            .iter()
            .filter(|l| l.defined_at.is_none())
            .map(|l| l.name.clone())
            .collect()
    }

    /// Rewrite every definition index through `f`. Optimization passes that
    /// remove instructions call this with the old-index → new-index map so
    /// definitions track the compacted sequence.
    pub fn remap_definitions(&self, f: impl Fn(usize) -> usize) {
        let mut table = self.table.lock().unwrap();
        for label in &mut table.labels {
            if let Some(at) = label.defined_at {
                label.defined_at = Some(f(at));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_names_are_unique_for_same_hint() {
        let mgr = LabelManager::new();
        let mut names = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = mgr.create_label(LabelKind::BranchTarget, ".L_else");
            assert!(names.insert(mgr.name(id)));
        }
    }

    #[test]
    fn test_define_exactly_once() {
        let mgr = LabelManager::new();
        let id = mgr.create_label(LabelKind::LoopStart, ".L_for_start");
        assert!(!mgr.is_defined(id));
        mgr.define_label(id, 7).unwrap();
        assert!(mgr.is_defined(id));
        assert!(matches!(
            mgr.define_label(id, 9),
            Err(CodegenError::LabelRedefined { .. })
        ));
        assert_eq!(mgr.definition_of(&mgr.name(id)), Some(7));
    }

    #[test]
    fn test_named_labels_reject_duplicates() {
        let mgr = LabelManager::new();
        mgr.create_named(LabelKind::FunctionEntry, "add").unwrap();
        assert!(mgr.create_named(LabelKind::FunctionEntry, "add").is_err());
    }

    #[test]
    fn test_concurrent_creation_stays_unique() {
        let mgr = Arc::new(LabelManager::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let mgr = Arc::clone(&mgr);
            handles.push(std::thread::spawn(move || {
                (0..200)
                    .map(|_| {
                        let id = mgr.create_label(LabelKind::BranchTarget, ".L_x");
                        mgr.name(id)
                    })
                    .collect::<Vec<_>>()
            }));
        }
        let mut all = std::collections::HashSet::new();
        for h in handles {
            for name in h.join().unwrap() {
                assert!(all.insert(name));
            }
        }
        assert_eq!(all.len(), 800);
    }

    #[test]
    fn test_remap_definitions() {
        let mgr = LabelManager::new();
        let id = mgr.create_label(LabelKind::BranchTarget, ".L_end");
        mgr.define_label(id, 10).unwrap();
        mgr.remap_definitions(|at| at - 3);
        assert_eq!(mgr.definition_of(&mgr.name(id)), Some(7));
    }
}
