//! Optimization pass implementations.
//!
//! Every pass takes the locked instruction sequence, mutates it in place,
//! and reports whether it changed anything. Passes that delete instructions
//! compact the sequence and remap label definitions through the old-index →
//! new-index map so the labels keep tracking their program points.

use super::{
    fold_binary, fold_float_binary, LiveRoots, Optimizer, PASS_CONST_FOLD,
    PASS_CONST_PROP, PASS_COPY_PROP, PASS_CSE, PASS_DCE, PASS_LICM, PASS_PEEPHOLE,
};
use crate::cfg::ControlFlowGraph;
use crate::core::error::CodegenResult;
use crate::dataflow::{self, AnalysisKind, ExprKey};
use crate::inst::{Instruction, Opcode, Operand};
use crate::labels::LabelManager;
use crate::target::PhysReg;
use hashbrown::{HashMap, HashSet};

/// One driver round: run each enabled pass once, in a fixed order.
pub(crate) fn run_round(
    opt: &Optimizer,
    enabled: u32,
    insts: &mut Vec<Instruction>,
    labels: &LabelManager,
    roots: LiveRoots<'_>,
) -> CodegenResult<bool> {
    let mut changed = false;
    if enabled & PASS_PEEPHOLE != 0 {
        changed |= peephole(opt, insts, labels);
    }
    if enabled & PASS_CONST_FOLD != 0 {
        changed |= constant_folding(opt, insts, labels);
    }
    if enabled & PASS_CONST_PROP != 0 {
        changed |= constant_propagation(opt, insts, labels)?;
    }
    if enabled & PASS_COPY_PROP != 0 {
        changed |= copy_propagation(opt, insts, labels)?;
    }
    if enabled & PASS_CSE != 0 {
        changed |= local_cse(opt, insts, labels)?;
    }
    if enabled & PASS_DCE != 0 {
        changed |= dead_code_elimination(opt, insts, labels, roots)?;
    }
    if enabled & PASS_LICM != 0 {
        changed |= loop_invariant_motion(opt, insts, labels)?;
    }
    Ok(changed)
}

/// Instruction indices that are defined label targets. Window rewrites must
/// not merge across one: a jump may land between the fused instructions.
fn label_target_indices(labels: &LabelManager) -> HashSet<usize> {
    labels.definitions().into_iter().map(|(_, at)| at).collect()
}

/// Remove `remove` (sorted, unique) from the sequence, remapping label
/// definitions onto the surviving indices.
fn remove_indices(insts: &mut Vec<Instruction>, labels: &LabelManager, remove: &[usize]) {
    if remove.is_empty() {
        return;
    }
    let removed_before = |index: usize| remove.partition_point(|&r| r < index);
    labels.remap_definitions(|at| at - removed_before(at));
    let removed: HashSet<usize> = remove.iter().copied().collect();
    let mut kept = Vec::with_capacity(insts.len() - removed.len());
    for (i, inst) in insts.drain(..).enumerate() {
        if !removed.contains(&i) {
            kept.push(inst);
        }
    }
    *insts = kept;
}

/// Local pattern rewriting over a window of adjacent instructions:
/// move-to-self and add/sub-zero elimination.
fn peephole(opt: &Optimizer, insts: &mut Vec<Instruction>, labels: &LabelManager) -> bool {
    opt.stats.record_pass();
    let mut remove = Vec::new();
    for (i, inst) in insts.iter().enumerate() {
        if inst.is_directive {
            continue;
        }
        let redundant = match inst.opcode {
            // mov r, r
            Opcode::Mov | Opcode::Movsd => {
                matches!(
                    (&inst.operands[0], &inst.operands[1]),
                    (Operand::Register(a), Operand::Register(b)) if a == b
                )
            }
            // add/sub r, 0 and shifts by zero
            Opcode::Add | Opcode::Sub | Opcode::Shl | Opcode::Shr => {
                matches!(inst.operands[1], Operand::Immediate(0))
                    && matches!(inst.operands[0], Operand::Register(_))
            }
            _ => false,
        };
        if redundant {
            remove.push(i);
        }
    }
    let changed = !remove.is_empty();
    opt.stats.record_eliminated(remove.len());
    remove_indices(insts, labels, &remove);
    changed
}

/// Fold `MOV r, #a; OP r, #b` into `MOV r, #fold(a, b)`.
///
/// The operand-kind contract makes a literal two-immediate ALU instruction
/// unconstructible, so after constant propagation the foldable shape is
/// always this adjacent pair. Folding is skipped when a label lands on the
/// second instruction: the pair is not guaranteed on that path.
fn constant_folding(opt: &Optimizer, insts: &mut Vec<Instruction>, labels: &LabelManager) -> bool {
    opt.stats.record_pass();
    let targets = label_target_indices(labels);
    let mut remove = Vec::new();
    let mut folded = 0usize;
    let mut i = 0;
    while i + 1 < insts.len() {
        let j = i + 1;
        if targets.contains(&j) {
            i += 1;
            continue;
        }
        let pair = fold_pair(&insts[i], &insts[j]);
        if let Some(replacement) = pair {
            insts[j] = replacement;
            remove.push(i);
            folded += 1;
            i += 2;
        } else {
            i += 1;
        }
    }
    opt.stats.record_folded(folded);
    let changed = !remove.is_empty();
    remove_indices(insts, labels, &remove);
    changed
}

fn fold_pair(first: &Instruction, second: &Instruction) -> Option<Instruction> {
    if first.is_directive || second.is_directive {
        return None;
    }
    let (mov_op, dest, a) = match (&first.opcode, first.operands.as_slice()) {
        (Opcode::Mov, [Operand::Register(r), Operand::Immediate(a)]) => (Opcode::Mov, *r, *a),
        (Opcode::Movsd, [Operand::Register(r), Operand::Immediate(a)]) => {
            (Opcode::Movsd, *r, *a)
        }
        _ => return None,
    };
    match (second.opcode, second.operands.as_slice()) {
        (op, [Operand::Register(r2), Operand::Immediate(b)])
            if *r2 == dest && mov_op == Opcode::Mov && op.is_foldable_int_alu() =>
        {
            let value = fold_binary(op, a, *b)?;
            Instruction::mov_imm(dest, value).ok()
        }
        (op, [Operand::Register(r2), Operand::Immediate(b)])
            if *r2 == dest && mov_op == Opcode::Movsd && op.is_foldable_float_alu() =>
        {
            let value = fold_float_binary(op, a, *b)?;
            Instruction::with_operands(
                Opcode::Movsd,
                vec![Operand::Register(dest), Operand::Immediate(value)],
            )
            .ok()
        }
        _ => None,
    }
}

/// Block-local constant propagation: after `MOV r, #imm`, source uses of
/// `r` within the block become the immediate, until `r` is redefined.
fn constant_propagation(
    opt: &Optimizer,
    insts: &mut Vec<Instruction>,
    labels: &LabelManager,
) -> CodegenResult<bool> {
    opt.stats.record_pass();
    let cfg = ControlFlowGraph::build(insts, labels)?;
    let mut changed = false;

    for block in cfg.blocks() {
        // reg -> (immediate, carried by float mov?)
        let mut constants: HashMap<PhysReg, (i64, bool)> = HashMap::new();
        for idx in block.range.clone() {
            let inst = &insts[idx];
            // Substitute into source slots first.
            let mut candidate = inst.clone();
            let mut substituted = false;
            for op_idx in 1..candidate.operands.len() {
                let reg = match &candidate.operands[op_idx] {
                    Operand::Register(r) => *r,
                    _ => continue,
                };
                if let Some(&(value, is_float)) = constants.get(&reg) {
                    let float_ctx = candidate.opcode.is_foldable_float_alu()
                        || candidate.opcode == Opcode::Movsd;
                    if is_float == float_ctx {
                        candidate.operands[op_idx] = Operand::Immediate(value);
                        substituted = true;
                    }
                }
            }
            if substituted {
                // Commit only if the substituted form still satisfies the
                // opcode's operand contract.
                if candidate.validate().is_ok() {
                    insts[idx] = candidate;
                    changed = true;
                    opt.stats.record_applied();
                }
            }

            let inst = &insts[idx];
            if inst.opcode == Opcode::Call {
                // Calls clobber caller-saved registers; drop everything.
                constants.clear();
                continue;
            }
            match (inst.opcode, inst.operands.as_slice()) {
                (Opcode::Mov, [Operand::Register(r), Operand::Immediate(v)]) => {
                    constants.insert(*r, (*v, false));
                }
                (Opcode::Movsd, [Operand::Register(r), Operand::Immediate(v)]) => {
                    constants.insert(*r, (*v, true));
                }
                _ => {
                    if let Some(def) = inst.def_register() {
                        constants.remove(&def);
                    }
                }
            }
        }
    }
    Ok(changed)
}

/// Block-local copy propagation: after `MOV a, b`, source uses of `a`
/// become `b` until either register is redefined.
fn copy_propagation(
    opt: &Optimizer,
    insts: &mut Vec<Instruction>,
    labels: &LabelManager,
) -> CodegenResult<bool> {
    opt.stats.record_pass();
    let cfg = ControlFlowGraph::build(insts, labels)?;
    let mut changed = false;

    for block in cfg.blocks() {
        let mut copies: HashMap<PhysReg, PhysReg> = HashMap::new();
        for idx in block.range.clone() {
            let inst = &mut insts[idx];
            if inst.opcode == Opcode::Call {
                copies.clear();
                continue;
            }
            // Rewrite source registers through the copy map.
            for op_idx in 1..inst.operands.len() {
                match &mut inst.operands[op_idx] {
                    Operand::Register(r) => {
                        if let Some(&src) = copies.get(r) {
                            *r = src;
                            changed = true;
                            opt.stats.record_applied();
                        }
                    }
                    Operand::Memory(mem) => {
                        if let Some(&src) = copies.get(&mem.base) {
                            mem.base = src;
                            changed = true;
                        }
                    }
                    _ => {}
                }
            }

            match (inst.opcode, inst.operands.as_slice()) {
                (Opcode::Mov, [Operand::Register(dst), Operand::Register(src)]) => {
                    let (dst, src) = (*dst, *src);
                    copies.retain(|&d, &mut s| d != dst && s != dst);
                    if dst != src {
                        copies.insert(dst, src);
                    }
                }
                _ => {
                    if let Some(def) = inst.def_register() {
                        copies.retain(|&d, &mut s| d != def && s != def);
                    }
                }
            }
        }
    }
    Ok(changed)
}

/// Block-local common-subexpression elimination: a pure computation already
/// held in another register becomes a register-to-register move.
fn local_cse(
    opt: &Optimizer,
    insts: &mut Vec<Instruction>,
    labels: &LabelManager,
) -> CodegenResult<bool> {
    opt.stats.record_pass();
    let cfg = ControlFlowGraph::build(insts, labels)?;
    let mut changed = false;

    for block in cfg.blocks() {
        // expression -> register currently holding its value
        let mut available: HashMap<ExprKey, PhysReg> = HashMap::new();
        for idx in block.range.clone() {
            let inst = &insts[idx];
            if inst.opcode == Opcode::Call {
                available.clear();
                continue;
            }

            // A bare constant load is as cheap as the move CSE would
            // replace it with; rewriting it only fights constant
            // propagation.
            let trivial_constant = matches!(
                (inst.opcode, inst.operands.get(1)),
                (Opcode::Mov | Opcode::Movsd, Some(Operand::Immediate(_)))
            );

            let mut rewrite: Option<Instruction> = None;
            if dataflow::is_pure_computation(inst) && !trivial_constant {
                let key = ExprKey::of(inst);
                let dest = inst.def_register().expect("pure computations define");
                if let Some(&holder) = available.get(&key) {
                    if holder != dest {
                        rewrite = Instruction::mov_reg(dest, holder).ok();
                    }
                } else {
                    available.insert(key, dest);
                }
            }

            let kills_memory = insts[idx].has_side_effects();
            if let Some(def) = insts[idx].def_register() {
                available.retain(|key, &mut holder| {
                    holder != def && !key.reads_register(def)
                });
            }
            if kills_memory {
                available.retain(|key, _| !key.reads_memory());
            }

            if let Some(replacement) = rewrite {
                insts[idx] = replacement;
                changed = true;
                opt.stats.record_applied();
            }
        }
    }
    Ok(changed)
}

/// Liveness-driven dead-code elimination: remove definitions whose
/// destination is not live immediately after them and which have no other
/// observable effect.
fn dead_code_elimination(
    opt: &Optimizer,
    insts: &mut Vec<Instruction>,
    labels: &LabelManager,
    roots: LiveRoots<'_>,
) -> CodegenResult<bool> {
    opt.stats.record_pass();
    let cfg = ControlFlowGraph::build(insts, labels)?;
    let liveness = dataflow::analyze_liveness(insts, &cfg, roots.at_exits);
    let mut remove = Vec::new();

    for block in cfg.blocks() {
        let mut live = liveness.out_set(block.id).clone();
        for reg in roots.pinned {
            live.set(reg.id() as usize);
        }
        for idx in block.range.clone().rev() {
            let inst = &insts[idx];
            if inst.opcode == Opcode::Call {
                // A call may read anything the ABI lets it.
                live.set_all();
                continue;
            }
            if let Some(def) = inst.def_register() {
                if !live.test(def.id() as usize) && !inst.has_side_effects() {
                    remove.push(idx);
                    continue;
                }
                live.clear(def.id() as usize);
            }
            for used in inst.use_registers() {
                live.set(used.id() as usize);
            }
        }
    }

    remove.sort_unstable();
    let changed = !remove.is_empty();
    opt.stats.record_eliminated(remove.len());
    remove_indices(insts, labels, &remove);
    Ok(changed)
}

/// Loop-invariant code motion: hoist a constant load out of a natural loop
/// into the instruction slot just ahead of the loop header.
///
/// A candidate `MOV r, #imm` is hoistable when it is the only definition of
/// `r` inside the loop and `r` is not live into the header (no iteration
/// path reads `r` before writing it). One hoist per round; the driver's
/// fixpoint loop picks up the rest.
fn loop_invariant_motion(
    opt: &Optimizer,
    insts: &mut Vec<Instruction>,
    labels: &LabelManager,
) -> CodegenResult<bool> {
    opt.stats.record_pass();
    let cfg = ControlFlowGraph::build(insts, labels)?;
    if cfg.back_edges().is_empty() {
        return Ok(false);
    }
    let liveness = dataflow::analyze(AnalysisKind::Liveness, insts, &cfg);

    for &(tail, header) in cfg.back_edges() {
        let loop_blocks = cfg.natural_loop((tail, header));
        let header_start = cfg.blocks()[header].range.start;

        // The header must be entered from outside only through the block
        // that precedes it in program order; a labelled side entry would
        // skip the hoisted instruction.
        let outside_preds: Vec<usize> = cfg
            .predecessors(header)
            .iter()
            .copied()
            .filter(|p| !loop_blocks.contains(p))
            .collect();
        if outside_preds.len() != 1 || outside_preds[0] + 1 != header {
            continue;
        }

        let in_loop = |idx: usize| {
            loop_blocks
                .iter()
                .any(|&b| cfg.blocks()[b].range.contains(&idx))
        };

        for &block_id in &loop_blocks {
            for idx in cfg.blocks()[block_id].range.clone() {
                let inst = &insts[idx];
                let (dest, invariant) = match (inst.opcode, inst.operands.as_slice()) {
                    (Opcode::Mov, [Operand::Register(r), Operand::Immediate(_)]) => {
                        (*r, true)
                    }
                    _ => continue,
                };
                if !invariant || idx < header_start {
                    continue;
                }
                let defs_in_loop = loop_blocks
                    .iter()
                    .flat_map(|&b| cfg.blocks()[b].range.clone())
                    .filter(|&i| {
                        in_loop(i) && insts[i].def_register() == Some(dest)
                    })
                    .count();
                if defs_in_loop != 1 {
                    continue;
                }
                if liveness.in_set(header).test(dest.id() as usize) {
                    continue;
                }

                // Hoist: remove from the body, reinsert ahead of the header.
                let hoisted = insts.remove(idx);
                labels.remap_definitions(|at| if at > idx { at - 1 } else { at });
                insts.insert(header_start, hoisted);
                labels.remap_definitions(|at| {
                    if at >= header_start {
                        at + 1
                    } else {
                        at
                    }
                });
                log::debug!("hoisted loop-invariant constant out of block {block_id}");
                opt.stats.record_applied();
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::InstructionBuffer;
    use crate::labels::LabelKind;
    use crate::opt::{OptLevel, PASS_LICM};
    use crate::target::x86;

    fn optimizer(level: OptLevel) -> Optimizer {
        Optimizer::new(level)
    }

    fn rax_roots() -> LiveRoots<'static> {
        LiveRoots { at_exits: &[x86::RAX], pinned: &[] }
    }

    #[test]
    fn test_peephole_removes_mov_to_self() {
        let opt = optimizer(OptLevel::Basic);
        let labels = LabelManager::new();
        let buffer = InstructionBuffer::new();
        buffer.append(Instruction::mov_reg(x86::RAX, x86::RAX).unwrap());
        buffer.append(Instruction::add(
            Operand::Register(x86::RAX),
            Operand::Immediate(0),
        )
        .unwrap());
        buffer.append(Instruction::ret().unwrap());

        let changed = opt.run(&buffer, &labels, LiveRoots::default()).unwrap();
        assert!(changed);
        assert_eq!(buffer.len(), 1);
        buffer.with_instructions(|insts| assert_eq!(insts[0].opcode, Opcode::Ret));
    }

    #[test]
    fn test_constant_folding_add() {
        let opt = optimizer(OptLevel::Basic);
        let labels = LabelManager::new();
        let buffer = InstructionBuffer::new();
        buffer.append(Instruction::mov_imm(x86::RAX, 6).unwrap());
        buffer.append(Instruction::add(
            Operand::Register(x86::RAX),
            Operand::Immediate(7),
        )
        .unwrap());
        buffer.append(Instruction::ret().unwrap());

        opt.run(&buffer, &labels, rax_roots()).unwrap();
        buffer.with_instructions(|insts| {
            assert_eq!(insts.len(), 2);
            assert_eq!(insts[0].opcode, Opcode::Mov);
            assert_eq!(insts[0].operands[1].as_immediate(), Some(13));
        });
        assert_eq!(
            opt.stats.constants_folded.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_constant_folding_wraps_at_boundary() {
        let opt = optimizer(OptLevel::Basic);
        let labels = LabelManager::new();
        let buffer = InstructionBuffer::new();
        buffer.append(Instruction::mov_imm(x86::RAX, i64::MAX).unwrap());
        buffer.append(Instruction::add(
            Operand::Register(x86::RAX),
            Operand::Immediate(1),
        )
        .unwrap());
        buffer.append(Instruction::ret().unwrap());

        opt.run(&buffer, &labels, rax_roots()).unwrap();
        buffer.with_instructions(|insts| {
            assert_eq!(insts[0].operands[1].as_immediate(), Some(i64::MIN));
        });
    }

    #[test]
    fn test_folding_stops_at_label_boundary() {
        let opt = optimizer(OptLevel::Basic);
        let labels = LabelManager::new();
        let target = labels.create_label(LabelKind::BranchTarget, ".L_in");
        let buffer = InstructionBuffer::new();
        buffer.append(Instruction::mov_imm(x86::RAX, 6).unwrap());
        // A label lands on the ADD; some path reaches it without the MOV.
        labels.define_label(target, 1).unwrap();
        buffer.append(Instruction::add(
            Operand::Register(x86::RAX),
            Operand::Immediate(7),
        )
        .unwrap());
        buffer.append(Instruction::ret().unwrap());

        opt.run(&buffer, &labels, rax_roots()).unwrap();
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_dce_removes_dead_def_keeps_return_value() {
        let opt = optimizer(OptLevel::Standard);
        let labels = LabelManager::new();
        let buffer = InstructionBuffer::new();
        buffer.append(Instruction::mov_imm(x86::RCX, 99).unwrap()); // dead
        buffer.append(Instruction::mov_imm(x86::RAX, 1).unwrap()); // return value
        buffer.append(Instruction::ret().unwrap());

        opt.run(&buffer, &labels, rax_roots()).unwrap();
        buffer.with_instructions(|insts| {
            assert_eq!(insts.len(), 2);
            assert_eq!(insts[0].operands[0].as_register(), Some(x86::RAX));
        });
    }

    #[test]
    fn test_dce_keeps_stores_and_call_arguments() {
        let opt = optimizer(OptLevel::Standard);
        let labels = LabelManager::new();
        let buffer = InstructionBuffer::new();
        // Store has a side effect; the RDI load feeds the call.
        buffer.append(Instruction::store(x86::RBP, -8, x86::RAX).unwrap());
        buffer.append(Instruction::mov_imm(x86::RDI, 5).unwrap());
        buffer.append(Instruction::call("callee").unwrap());
        buffer.append(Instruction::ret().unwrap());
        labels.create_named(LabelKind::FunctionEntry, "callee").unwrap();
        // The call target must be defined somewhere for CFG construction.
        labels
            .define_label(labels.lookup("callee").unwrap(), 0)
            .unwrap();

        opt.run(&buffer, &labels, rax_roots()).unwrap();
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn test_copy_propagation_rewrites_uses() {
        let opt = optimizer(OptLevel::Standard);
        let labels = LabelManager::new();
        let buffer = InstructionBuffer::new();
        buffer.append(Instruction::mov_imm(x86::RCX, 3).unwrap());
        buffer.append(Instruction::mov_reg(x86::RAX, x86::RCX).unwrap());
        buffer.append(Instruction::add(
            Operand::Register(x86::RDX),
            Operand::Register(x86::RAX),
        )
        .unwrap());
        buffer.append(Instruction::ret().unwrap());

        opt.run(&buffer, &labels, LiveRoots { at_exits: &[x86::RDX], pinned: &[] }).unwrap();
        // After copy + constant propagation the ADD reads the constant or
        // RCX; either way it no longer reads RAX.
        buffer.with_instructions(|insts| {
            let add = insts.iter().find(|i| i.opcode == Opcode::Add).unwrap();
            assert_ne!(add.operands[1], Operand::Register(x86::RAX));
        });
    }

    #[test]
    fn test_licm_hoists_constant_out_of_loop() {
        let opt = optimizer(OptLevel::None);
        opt.enable_pass(PASS_LICM);
        let labels = LabelManager::new();
        let head = labels.create_label(LabelKind::LoopStart, ".L_head");
        let exit = labels.create_label(LabelKind::LoopEnd, ".L_exit");
        let head_name = labels.name(head);
        let exit_name = labels.name(exit);

        let buffer = InstructionBuffer::new();
        buffer.append(Instruction::mov_imm(x86::RAX, 0).unwrap()); // 0: i = 0
        buffer.append(Instruction::cmp(
            Operand::Register(x86::RAX),
            Operand::Immediate(10),
        )
        .unwrap()); // 1: header
        buffer.append(Instruction::jump_cc(Opcode::Jge, exit_name).unwrap()); // 2
        buffer.append(Instruction::mov_imm(x86::RDX, 42).unwrap()); // 3: invariant
        buffer.append(Instruction::inc(x86::RAX).unwrap()); // 4
        buffer.append(Instruction::jump(head_name).unwrap()); // 5
        buffer.append(Instruction::ret().unwrap()); // 6
        labels.define_label(head, 1).unwrap();
        labels.define_label(exit, 6).unwrap();

        let changed = opt.run(&buffer, &labels, LiveRoots { at_exits: &[x86::RAX, x86::RDX], pinned: &[] }).unwrap();
        assert!(changed);
        buffer.with_instructions(|insts| {
            // The constant load now sits before the loop header.
            assert_eq!(insts[1].opcode, Opcode::Mov);
            assert_eq!(insts[1].operands[0].as_register(), Some(x86::RDX));
            assert_eq!(insts[2].opcode, Opcode::Cmp);
        });
        // Header label tracks the compare.
        assert_eq!(labels.definition_of(&labels.name(head)), Some(2));
    }
}
