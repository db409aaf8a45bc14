//! Control-flow graph construction.
//!
//! Blocks are index ranges into an instruction snapshot, never copies: the
//! buffer is the arena, the CFG holds positions into it, and the snapshot
//! must outlive the graph. Construction scans the sequence once to mark
//! leaders (instruction 0, the instruction after any control transfer, any
//! defined label target), then materializes blocks and successor edges. A
//! jump to an undefined label is a construction failure: it indicates an
//! upstream code-generation bug, never something to ignore.

use crate::core::error::{CodegenError, CodegenResult};
use crate::dataflow::bitvec::BitVec;
use crate::inst::{Instruction, Opcode};
use crate::labels::LabelManager;
use std::collections::BTreeSet;
use std::ops::Range;

/// A maximal straight-line instruction range.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: usize,
    /// Half-open instruction index range into the snapshot.
    pub range: Range<usize>,
    /// Successor block ids in edge order (taken target first, then
    /// fall-through for conditional branches).
    pub successors: Vec<usize>,
    pub is_entry: bool,
    pub is_exit: bool,
}

impl BasicBlock {
    /// Index of the block's last instruction, if non-empty.
    pub fn terminator_index(&self) -> Option<usize> {
        if self.range.is_empty() {
            None
        } else {
            Some(self.range.end - 1)
        }
    }
}

#[derive(Debug)]
pub struct ControlFlowGraph {
    blocks: Vec<BasicBlock>,
    predecessors: Vec<Vec<usize>>,
    /// Dominator sets, one `BitVec` over block ids per block.
    dominators: Vec<BitVec>,
    /// Edges `(source, target)` whose target dominates their source.
    back_edges: Vec<(usize, usize)>,
}

impl ControlFlowGraph {
    /// Partition `instructions` into basic blocks and link them.
    pub fn build(
        instructions: &[Instruction],
        labels: &LabelManager,
    ) -> CodegenResult<Self> {
        if instructions.is_empty() {
            return Ok(Self {
                blocks: Vec::new(),
                predecessors: Vec::new(),
                dominators: Vec::new(),
                back_edges: Vec::new(),
            });
        }

        // -------- pass 1: mark leaders --------
        let mut leaders: BTreeSet<usize> = BTreeSet::new();
        leaders.insert(0);
        for (idx, inst) in instructions.iter().enumerate() {
            if inst.is_control_transfer() && idx + 1 < instructions.len() {
                leaders.insert(idx + 1);
            }
            if let Some(target) = inst.branch_target() {
                let def = labels.definition_of(target).ok_or_else(|| {
                    CodegenError::LabelNotFound { name: target.to_string() }
                })?;
                if def < instructions.len() {
                    leaders.insert(def);
                }
            }
        }
        for (_, index) in labels.definitions() {
            if index < instructions.len() {
                leaders.insert(index);
            }
        }

        // -------- pass 2: materialize blocks --------
        let starts: Vec<usize> = leaders.into_iter().collect();
        let mut blocks: Vec<BasicBlock> = Vec::with_capacity(starts.len());
        for (id, &start) in starts.iter().enumerate() {
            let end = starts.get(id + 1).copied().unwrap_or(instructions.len());
            blocks.push(BasicBlock {
                id,
                range: start..end,
                successors: Vec::new(),
                is_entry: id == 0,
                is_exit: false,
            });
        }

        let block_at = |index: usize| -> usize {
            match starts.binary_search(&index) {
                Ok(i) => i,
                Err(i) => i - 1,
            }
        };

        // -------- pass 3: successor edges --------
        for id in 0..blocks.len() {
            let term = blocks[id]
                .terminator_index()
                .map(|i| &instructions[i]);
            let mut succs = Vec::new();
            match term {
                Some(inst) if inst.opcode == Opcode::Ret && !inst.is_directive => {}
                Some(inst) if inst.is_directive || !inst.is_control_transfer() => {
                    // Fall through (including calls handled below).
                    if id + 1 < blocks.len() {
                        succs.push(id + 1);
                    }
                }
                Some(inst) => match inst.opcode {
                    Opcode::Jmp => {
                        if let Some(target) = inst.branch_target() {
                            let def = labels.definition_of(target).ok_or_else(|| {
                                CodegenError::LabelNotFound { name: target.to_string() }
                            })?;
                            if def < instructions.len() {
                                succs.push(block_at(def));
                            }
                        }
                        // Indirect jumps (jump tables) have statically
                        // unknown targets and no recorded successors.
                    }
                    op if op.is_conditional_jump() => {
                        let target = inst
                            .branch_target()
                            .expect("conditional jump carries a label");
                        let def = labels.definition_of(target).ok_or_else(|| {
                            CodegenError::LabelNotFound { name: target.to_string() }
                        })?;
                        if def < instructions.len() {
                            succs.push(block_at(def));
                        }
                        if id + 1 < blocks.len() {
                            succs.push(id + 1);
                        }
                    }
                    // A call transfers control but returns to the next
                    // instruction: plain fall-through edge.
                    Opcode::Call => {
                        if id + 1 < blocks.len() {
                            succs.push(id + 1);
                        }
                    }
                    _ => {
                        if id + 1 < blocks.len() {
                            succs.push(id + 1);
                        }
                    }
                },
                None => {
                    if id + 1 < blocks.len() {
                        succs.push(id + 1);
                    }
                }
            }
            succs.dedup();
            blocks[id].is_exit = succs.is_empty();
            blocks[id].successors = succs;
        }

        let mut predecessors = vec![Vec::new(); blocks.len()];
        for block in &blocks {
            for &succ in &block.successors {
                predecessors[succ].push(block.id);
            }
        }

        let dominators = compute_dominators(&blocks, &predecessors);

        let mut back_edges = Vec::new();
        for block in &blocks {
            for &succ in &block.successors {
                if dominators[block.id].test(succ) {
                    back_edges.push((block.id, succ));
                }
            }
        }

        Ok(Self { blocks, predecessors, dominators, back_edges })
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn successors(&self, id: usize) -> &[usize] {
        &self.blocks[id].successors
    }

    pub fn predecessors(&self, id: usize) -> &[usize] {
        &self.predecessors[id]
    }

    /// Edges whose target dominates their source: the loops of the function.
    pub fn back_edges(&self) -> &[(usize, usize)] {
        &self.back_edges
    }

    pub fn dominates(&self, dominator: usize, node: usize) -> bool {
        self.dominators[node].test(dominator)
    }

    /// Block containing instruction `index`, if any.
    pub fn block_of(&self, index: usize) -> Option<usize> {
        self.blocks
            .iter()
            .find(|b| b.range.contains(&index))
            .map(|b| b.id)
    }

    /// Reverse post-order over forward edges, for forward data-flow
    /// analyses and dominator iteration.
    pub fn reverse_postorder(&self) -> Vec<usize> {
        let mut order = self.postorder();
        order.reverse();
        order
    }

    /// Post-order over forward edges, the profitable iteration order for
    /// backward analyses.
    pub fn postorder(&self) -> Vec<usize> {
        let mut post = Vec::with_capacity(self.blocks.len());
        let mut visited = vec![false; self.blocks.len()];
        if self.blocks.is_empty() {
            return post;
        }
        let mut stack = vec![(0usize, false)];
        while let Some((block, processed)) = stack.pop() {
            if processed {
                post.push(block);
                continue;
            }
            if visited[block] {
                continue;
            }
            visited[block] = true;
            stack.push((block, true));
            for &succ in self.blocks[block].successors.iter().rev() {
                if !visited[succ] {
                    stack.push((succ, false));
                }
            }
        }
        // Unreachable blocks still need positions for the fixpoint engine;
        // front of post-order keeps them at the tail of reverse post-order.
        let unreachable: Vec<usize> = (0..self.blocks.len()).filter(|&id| !visited[id]).collect();
        let mut full = unreachable;
        full.extend(post);
        full
    }

    /// Body of the natural loop induced by `back_edge`: the target (header)
    /// plus every block that reaches the source without passing through the
    /// header.
    pub fn natural_loop(&self, back_edge: (usize, usize)) -> Vec<usize> {
        let (tail, header) = back_edge;
        let mut in_loop = vec![false; self.blocks.len()];
        in_loop[header] = true;
        let mut work = vec![tail];
        while let Some(block) = work.pop() {
            if in_loop[block] {
                continue;
            }
            in_loop[block] = true;
            for &pred in self.predecessors(block) {
                work.push(pred);
            }
        }
        (0..self.blocks.len()).filter(|&b| in_loop[b]).collect()
    }
}

/// Classic iterative dominator computation over reverse post-order:
/// `dom(entry) = {entry}`, `dom(b) = {b} ∪ ⋂ dom(preds)`, to fixpoint.
fn compute_dominators(blocks: &[BasicBlock], predecessors: &[Vec<usize>]) -> Vec<BitVec> {
    let n = blocks.len();
    let mut dominators: Vec<BitVec> = (0..n)
        .map(|id| {
            let mut v = BitVec::new(n);
            if id == 0 {
                v.set(0);
            } else {
                v.set_all();
            }
            v
        })
        .collect();

    let mut changed = true;
    while changed {
        changed = false;
        for id in 1..n {
            let mut next = BitVec::new(n);
            let mut first = true;
            for &pred in &predecessors[id] {
                if first {
                    next = dominators[pred].clone();
                    first = false;
                } else {
                    next.intersect_with(&dominators[pred]);
                }
            }
            next.set(id);
            if next != dominators[id] {
                dominators[id] = next;
                changed = true;
            }
        }
    }
    dominators
}
