//! Iterative data-flow analysis.
//!
//! One generic fixpoint engine, instantiated for live variables (backward,
//! union), reaching definitions (forward, union), and available expressions
//! (forward, intersection). Fact sets are fixed-capacity [`BitVec`]s; the
//! engine iterates blocks in post-order for backward analyses and reverse
//! post-order for forward ones, re-running passes until no block's set
//! changes. Termination is guaranteed: the transfer functions are monotone
//! and the lattices are finite.
//!
//! Results are shared between consumers (optimizer passes, the global
//! register allocator) behind `Arc`, which realizes the retain/release
//! contract: the sets are freed when the last holder drops.

pub mod bitvec;

pub use bitvec::BitVec;

use crate::cfg::ControlFlowGraph;
use crate::inst::{Instruction, Operand};
use hashbrown::HashMap;
use std::sync::Arc;

/// Which analysis to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisKind {
    /// Backward: which registers are live into/out of each block.
    /// Bits are register ids.
    Liveness,
    /// Forward: which definition sites reach each block boundary.
    /// Bits index [`AnalysisResult::def_sites`].
    ReachingDefinitions,
    /// Forward (intersection): which pure computations are available at
    /// each block boundary. Bits index [`AnalysisResult::expressions`].
    AvailableExpressions,
}

/// Hashable identity of a pure computation, for CSE and availability.
/// Keyed on the opcode and the source operands; the destination register is
/// deliberately excluded so the same computation into different registers
/// compares equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExprKey {
    pub opcode: crate::inst::Opcode,
    pub sources: Vec<Operand>,
}

impl ExprKey {
    pub(crate) fn of(inst: &Instruction) -> Self {
        Self {
            opcode: inst.opcode,
            sources: inst.operands[1..].to_vec(),
        }
    }

    pub(crate) fn reads_register(&self, reg: crate::target::PhysReg) -> bool {
        self.sources.iter().any(|op| match op {
            Operand::Register(r) => *r == reg,
            Operand::Memory(m) => m.base == reg || m.index == Some(reg),
            _ => false,
        })
    }

    pub(crate) fn reads_memory(&self) -> bool {
        self.sources.iter().any(|op| matches!(op, Operand::Memory(_)))
    }
}

/// Per-block fact sets produced by one analysis run.
#[derive(Debug)]
pub struct AnalysisResult {
    pub kind: AnalysisKind,
    in_sets: Vec<BitVec>,
    out_sets: Vec<BitVec>,
    /// Bit domain size.
    pub capacity: usize,
    /// For reaching definitions: `(instruction index, register id)` per bit.
    pub def_sites: Vec<(usize, u8)>,
    /// For available expressions: the expression per bit.
    pub expressions: Vec<ExprKey>,
}

impl AnalysisResult {
    pub fn in_set(&self, block: usize) -> &BitVec {
        &self.in_sets[block]
    }

    pub fn out_set(&self, block: usize) -> &BitVec {
        &self.out_sets[block]
    }
}

/// Register-id capacity for liveness sets: every architecture's flat
/// numbering fits in 64.
const REG_CAPACITY: usize = 64;

/// Run `kind` over the function and share the result.
pub fn analyze(
    kind: AnalysisKind,
    instructions: &[Instruction],
    cfg: &ControlFlowGraph,
) -> Arc<AnalysisResult> {
    let result = match kind {
        AnalysisKind::Liveness => liveness(instructions, cfg, &[]),
        AnalysisKind::ReachingDefinitions => reaching_definitions(instructions, cfg),
        AnalysisKind::AvailableExpressions => available_expressions(instructions, cfg),
    };
    log::trace!("{kind:?} analysis complete over {} blocks", cfg.block_count());
    Arc::new(result)
}

/// Liveness with ABI exit uses: `exit_uses` registers are treated as read
/// by every exit block's terminator, so a return-value load several blocks
/// ahead of the shared epilogue stays live along the whole path. This is
/// the variant dead-code elimination consumes.
pub fn analyze_liveness(
    instructions: &[Instruction],
    cfg: &ControlFlowGraph,
    exit_uses: &[crate::target::PhysReg],
) -> Arc<AnalysisResult> {
    Arc::new(liveness(instructions, cfg, exit_uses))
}

fn liveness(
    instructions: &[Instruction],
    cfg: &ControlFlowGraph,
    exit_uses: &[crate::target::PhysReg],
) -> AnalysisResult {
    let n = cfg.block_count();
    let mut use_sets = vec![BitVec::new(REG_CAPACITY); n];
    let mut def_sets = vec![BitVec::new(REG_CAPACITY); n];

    // use[B]: upward-exposed reads; def[B]: registers written in B.
    for block in cfg.blocks() {
        let (use_b, def_b) = (&mut use_sets[block.id], &mut def_sets[block.id]);
        for idx in block.range.clone() {
            let inst = &instructions[idx];
            for reg in inst.use_registers() {
                if !def_b.test(reg.id() as usize) {
                    use_b.set(reg.id() as usize);
                }
            }
            if let Some(def) = inst.def_register() {
                def_b.set(def.id() as usize);
            }
        }
    }

    let mut exit_set = BitVec::new(REG_CAPACITY);
    for reg in exit_uses {
        exit_set.set(reg.id() as usize);
    }

    let mut in_sets = vec![BitVec::new(REG_CAPACITY); n];
    let mut out_sets = vec![BitVec::new(REG_CAPACITY); n];
    let order = cfg.postorder();

    let mut changed = true;
    while changed {
        changed = false;
        for &b in &order {
            // out[B] = ⋃ in[S], plus the ABI exit uses at exit blocks.
            let mut out = BitVec::new(REG_CAPACITY);
            if cfg.blocks()[b].is_exit {
                out.union_with(&exit_set);
            }
            for &succ in cfg.successors(b) {
                out.union_with(&in_sets[succ]);
            }
            // in[B] = use[B] ∪ (out[B] − def[B])
            let mut inn = out.clone();
            inn.difference_with(&def_sets[b]);
            inn.union_with(&use_sets[b]);
            if out != out_sets[b] || inn != in_sets[b] {
                out_sets[b] = out;
                in_sets[b] = inn;
                changed = true;
            }
        }
    }

    AnalysisResult {
        kind: AnalysisKind::Liveness,
        in_sets,
        out_sets,
        capacity: REG_CAPACITY,
        def_sites: Vec::new(),
        expressions: Vec::new(),
    }
}

fn reaching_definitions(
    instructions: &[Instruction],
    cfg: &ControlFlowGraph,
) -> AnalysisResult {
    // Enumerate definition sites.
    let mut def_sites: Vec<(usize, u8)> = Vec::new();
    let mut sites_of_reg: HashMap<u8, Vec<usize>> = HashMap::new();
    for (idx, inst) in instructions.iter().enumerate() {
        if let Some(def) = inst.def_register() {
            sites_of_reg.entry(def.id()).or_default().push(def_sites.len());
            def_sites.push((idx, def.id()));
        }
    }
    let capacity = def_sites.len().max(1);
    let n = cfg.block_count();

    let mut gen_sets = vec![BitVec::new(capacity); n];
    let mut kill_sets = vec![BitVec::new(capacity); n];
    for block in cfg.blocks() {
        // Later defs in the block shadow earlier ones.
        let mut last_def: HashMap<u8, usize> = HashMap::new();
        for (bit, &(idx, reg)) in def_sites.iter().enumerate() {
            if block.range.contains(&idx) {
                last_def.insert(reg, bit);
            }
        }
        for (&reg, &bit) in &last_def {
            gen_sets[block.id].set(bit);
            for &other in &sites_of_reg[&reg] {
                if other != bit {
                    kill_sets[block.id].set(other);
                }
            }
        }
    }

    let mut in_sets = vec![BitVec::new(capacity); n];
    let mut out_sets = vec![BitVec::new(capacity); n];
    let order = cfg.reverse_postorder();

    let mut changed = true;
    while changed {
        changed = false;
        for &b in &order {
            let mut inn = BitVec::new(capacity);
            for &pred in cfg.predecessors(b) {
                inn.union_with(&out_sets[pred]);
            }
            let mut out = inn.clone();
            out.difference_with(&kill_sets[b]);
            out.union_with(&gen_sets[b]);
            if inn != in_sets[b] || out != out_sets[b] {
                in_sets[b] = inn;
                out_sets[b] = out;
                changed = true;
            }
        }
    }

    AnalysisResult {
        kind: AnalysisKind::ReachingDefinitions,
        in_sets,
        out_sets,
        capacity,
        def_sites,
        expressions: Vec::new(),
    }
}

/// True for instructions whose result is a pure function of their source
/// operands: register-writing, side-effect free, and not reading their own
/// destination (two-operand ALU ops self-invalidate and never stay
/// available). Condition materializations are excluded because the flags
/// they read are not modeled as a data-flow fact.
pub(crate) fn is_pure_computation(inst: &Instruction) -> bool {
    use crate::inst::Opcode::*;
    !inst.is_directive
        && inst.def_register().is_some()
        && !inst.has_side_effects()
        && !inst.opcode.reads_destination()
        && !matches!(inst.opcode, Sete | Setne | Setl | Setle | Setg | Setge)
        && inst.operands.len() == 2
}

fn available_expressions(
    instructions: &[Instruction],
    cfg: &ControlFlowGraph,
) -> AnalysisResult {
    // Enumerate distinct expressions.
    let mut expressions: Vec<ExprKey> = Vec::new();
    let mut expr_ids: HashMap<ExprKey, usize> = HashMap::new();
    for inst in instructions {
        if is_pure_computation(inst) {
            let key = ExprKey::of(inst);
            if !expr_ids.contains_key(&key) {
                expr_ids.insert(key.clone(), expressions.len());
                expressions.push(key);
            }
        }
    }
    let capacity = expressions.len().max(1);
    let n = cfg.block_count();

    let mut gen_sets = vec![BitVec::new(capacity); n];
    let mut kill_sets = vec![BitVec::new(capacity); n];
    for block in cfg.blocks() {
        for idx in block.range.clone() {
            let inst = &instructions[idx];
            if is_pure_computation(inst) {
                let bit = expr_ids[&ExprKey::of(inst)];
                gen_sets[block.id].set(bit);
                kill_sets[block.id].clear(bit);
            }
            // A register write kills every expression reading that register;
            // a memory write (or call) kills every memory-reading expression.
            let def = inst.def_register();
            let writes_memory = inst.has_side_effects();
            for (bit, expr) in expressions.iter().enumerate() {
                let killed = def.is_some_and(|d| expr.reads_register(d))
                    || (writes_memory && expr.reads_memory());
                if killed {
                    kill_sets[block.id].set(bit);
                    gen_sets[block.id].clear(bit);
                }
            }
        }
    }

    // Intersection analysis: initialize non-entry outs to "all".
    let mut in_sets = vec![BitVec::new(capacity); n];
    let mut out_sets: Vec<BitVec> = (0..n)
        .map(|id| {
            let mut v = BitVec::new(capacity);
            if id != 0 {
                v.set_all();
            } else {
                v.union_with(&gen_sets[0]);
            }
            v
        })
        .collect();
    let order = cfg.reverse_postorder();

    let mut changed = true;
    while changed {
        changed = false;
        for &b in &order {
            let mut inn = BitVec::new(capacity);
            let mut first = true;
            for &pred in cfg.predecessors(b) {
                if first {
                    inn = out_sets[pred].clone();
                    first = false;
                } else {
                    inn.intersect_with(&out_sets[pred]);
                }
            }
            let mut out = inn.clone();
            out.difference_with(&kill_sets[b]);
            out.union_with(&gen_sets[b]);
            if inn != in_sets[b] || out != out_sets[b] {
                in_sets[b] = inn;
                out_sets[b] = out;
                changed = true;
            }
        }
    }

    AnalysisResult {
        kind: AnalysisKind::AvailableExpressions,
        in_sets,
        out_sets,
        capacity,
        def_sites: Vec::new(),
        expressions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::ControlFlowGraph;
    use crate::inst::{Instruction, Opcode, Operand};
    use crate::labels::{LabelKind, LabelManager};
    use crate::target::PhysReg;

    #[test]
    fn test_single_block_liveness_is_empty_at_boundaries() {
        // r0 = 5; r1 = r0; return r1  — nothing lives across the block edge.
        let labels = LabelManager::new();
        let insts = vec![
            Instruction::mov_imm(PhysReg(0), 5).unwrap(),
            Instruction::mov_reg(PhysReg(1), PhysReg(0)).unwrap(),
            Instruction::ret().unwrap(),
        ];
        let cfg = ControlFlowGraph::build(&insts, &labels).unwrap();
        assert_eq!(cfg.block_count(), 1);
        let live = analyze(AnalysisKind::Liveness, &insts, &cfg);
        assert!(live.in_set(0).is_empty());
        assert!(live.out_set(0).is_empty());
    }

    #[test]
    fn test_branch_liveness_crosses_edges() {
        // Block 0 defines r0 and branches; both successors use r0.
        let labels = LabelManager::new();
        let else_l = labels.create_label(LabelKind::BranchTarget, ".L_else");
        let else_name = labels.name(else_l);
        let insts = vec![
            Instruction::mov_imm(PhysReg(0), 7).unwrap(),
            Instruction::cmp(Operand::Register(PhysReg(0)), Operand::Immediate(0)).unwrap(),
            Instruction::jump_cc(Opcode::Je, else_name).unwrap(),
            // block 1: uses r0
            Instruction::mov_reg(PhysReg(1), PhysReg(0)).unwrap(),
            Instruction::ret().unwrap(),
            // block 2 (.L_else): uses r0
            Instruction::mov_reg(PhysReg(2), PhysReg(0)).unwrap(),
            Instruction::ret().unwrap(),
        ];
        labels.define_label(else_l, 5).unwrap();
        let cfg = ControlFlowGraph::build(&insts, &labels).unwrap();
        assert_eq!(cfg.block_count(), 3);

        let live = analyze(AnalysisKind::Liveness, &insts, &cfg);
        let b0 = cfg.block_of(0).unwrap();
        let b1 = cfg.block_of(3).unwrap();
        let b2 = cfg.block_of(5).unwrap();
        assert!(live.out_set(b0).test(0), "r0 must be live-out of block 0");
        assert!(live.in_set(b1).test(0), "r0 must be live-in to the then block");
        assert!(live.in_set(b2).test(0), "r0 must be live-in to the else block");
        assert!(live.in_set(b0).is_empty());
    }

    #[test]
    fn test_reaching_definitions_shadowing() {
        // Two defs of r0 in one block: only the later one reaches the exit.
        let labels = LabelManager::new();
        let insts = vec![
            Instruction::mov_imm(PhysReg(0), 1).unwrap(),
            Instruction::mov_imm(PhysReg(0), 2).unwrap(),
            Instruction::ret().unwrap(),
        ];
        let cfg = ControlFlowGraph::build(&insts, &labels).unwrap();
        let rd = analyze(AnalysisKind::ReachingDefinitions, &insts, &cfg);
        assert_eq!(rd.def_sites.len(), 2);
        assert!(!rd.out_set(0).test(0));
        assert!(rd.out_set(0).test(1));
    }

    #[test]
    fn test_available_expressions_join_is_intersection() {
        // Both branch arms compute r1 + r2 into r0; the join block sees it
        // available. (Arm bodies are identical on purpose.)
        let labels = LabelManager::new();
        let else_l = labels.create_label(LabelKind::BranchTarget, ".L_else");
        let join_l = labels.create_label(LabelKind::BranchTarget, ".L_join");
        let else_name = labels.name(else_l);
        let join_name = labels.name(join_l);
        let lea = || {
            Instruction::lea(PhysReg(0), Operand::mem(PhysReg(2), 8)).unwrap()
        };
        let insts = vec![
            Instruction::jump_cc(Opcode::Je, else_name).unwrap(), // block 0
            lea(),                                                // block 1
            Instruction::jump(join_name).unwrap(),
            lea(),                                                // block 2
            Instruction::ret().unwrap(),                          // block 3
        ];
        labels.define_label(else_l, 3).unwrap();
        labels.define_label(join_l, 4).unwrap();
        let cfg = ControlFlowGraph::build(&insts, &labels).unwrap();
        let ae = analyze(AnalysisKind::AvailableExpressions, &insts, &cfg);
        assert_eq!(ae.expressions.len(), 1);
        let join = cfg.block_of(4).unwrap();
        assert!(ae.in_set(join).test(0));
    }

    #[test]
    fn test_results_are_shareable() {
        let labels = LabelManager::new();
        let insts = vec![Instruction::ret().unwrap()];
        let cfg = ControlFlowGraph::build(&insts, &labels).unwrap();
        let result = analyze(AnalysisKind::Liveness, &insts, &cfg);
        let second = Arc::clone(&result);
        assert_eq!(Arc::strong_count(&result), 2);
        drop(second);
        assert_eq!(Arc::strong_count(&result), 1);
    }
}
