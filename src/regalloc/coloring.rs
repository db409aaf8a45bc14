//! Whole-function register allocation by graph coloring.
//!
//! The fast per-expression allocator in the parent module is fine for
//! straight-line code; when whole-function pressure must be minimized, this
//! pass builds an interference graph from liveness results, greedily colors
//! nodes in decreasing degree order, and spills the cheapest node whenever
//! coloring gets stuck, re-attempting until every remaining node is colored.
//!
//! Spill cost is a weighted function of occurrence counts
//! (`2 * defs + uses`); cheaper candidates are spilled first.

use crate::cfg::ControlFlowGraph;
use crate::dataflow::AnalysisResult;
use crate::inst::{Instruction, MemOperand, Operand};
use crate::target::PhysReg;
use hashbrown::{HashMap, HashSet};

/// Interference graph over register ids appearing in a function.
#[derive(Debug, Default)]
pub struct InterferenceGraph {
    adjacency: HashMap<u8, HashSet<u8>>,
    uses: HashMap<u8, u32>,
    defs: HashMap<u8, u32>,
}

impl InterferenceGraph {
    /// Build from per-block liveness: walk each block backwards from its
    /// live-out set; every definition interferes with everything live across
    /// it.
    pub fn build(
        instructions: &[Instruction],
        cfg: &ControlFlowGraph,
        liveness: &AnalysisResult,
    ) -> Self {
        let mut graph = Self::default();
        for block in cfg.blocks() {
            let mut live: HashSet<u8> = liveness
                .out_set(block.id)
                .iter()
                .map(|bit| bit as u8)
                .collect();
            for idx in block.range.clone().rev() {
                let inst = &instructions[idx];
                if let Some(def) = inst.def_register() {
                    graph.note_def(def.id());
                    for &other in &live {
                        if other != def.id() {
                            graph.add_edge(def.id(), other);
                        }
                    }
                    live.remove(&def.id());
                }
                for used in inst.use_registers() {
                    graph.note_use(used.id());
                    live.insert(used.id());
                }
            }
        }
        graph
    }

    fn add_edge(&mut self, a: u8, b: u8) {
        self.adjacency.entry(a).or_default().insert(b);
        self.adjacency.entry(b).or_default().insert(a);
    }

    fn note_use(&mut self, reg: u8) {
        *self.uses.entry(reg).or_insert(0) += 1;
        self.adjacency.entry(reg).or_default();
    }

    fn note_def(&mut self, reg: u8) {
        *self.defs.entry(reg).or_insert(0) += 1;
        self.adjacency.entry(reg).or_default();
    }

    pub fn degree(&self, reg: u8) -> usize {
        self.adjacency.get(&reg).map_or(0, HashSet::len)
    }

    pub fn interferes(&self, a: u8, b: u8) -> bool {
        self.adjacency.get(&a).is_some_and(|n| n.contains(&b))
    }

    pub fn nodes(&self) -> impl Iterator<Item = u8> + '_ {
        self.adjacency.keys().copied()
    }

    /// Weighted spill cost; cheaper nodes are preferred spill victims.
    pub fn spill_cost(&self, reg: u8) -> u32 {
        2 * self.defs.get(&reg).copied().unwrap_or(0)
            + self.uses.get(&reg).copied().unwrap_or(0)
    }
}

/// Outcome of coloring: a register remapping plus the spill victims.
#[derive(Debug, Default)]
pub struct ColoringResult {
    /// Original register id → assigned palette register.
    pub assignments: HashMap<u8, PhysReg>,
    /// Registers that could not be colored, cheapest-cost first.
    pub spilled: Vec<u8>,
}

impl ColoringResult {
    /// Number of distinct palette colors in use.
    pub fn colors_used(&self) -> usize {
        let distinct: HashSet<PhysReg> = self.assignments.values().copied().collect();
        distinct.len()
    }
}

/// Greedy coloring in decreasing-degree order over `palette`.
///
/// When a node cannot be colored, the cheapest uncolorable node (by
/// [`InterferenceGraph::spill_cost`]) is removed to the spill list and the
/// whole coloring re-runs without it, so nodes that only conflicted through
/// the victim get another chance at a color.
pub fn color(graph: &InterferenceGraph, palette: &[PhysReg]) -> ColoringResult {
    let mut spilled: Vec<u8> = Vec::new();

    loop {
        let mut order: Vec<u8> = graph
            .nodes()
            .filter(|n| !spilled.contains(n))
            .collect();
        // Decreasing degree; ties broken by id for determinism.
        order.sort_by_key(|&n| (std::cmp::Reverse(graph.degree(n)), n));

        let mut assignments: HashMap<u8, PhysReg> = HashMap::new();
        let mut stuck: Vec<u8> = Vec::new();

        for &node in &order {
            let taken: HashSet<PhysReg> = assignments
                .iter()
                .filter(|(&other, _)| graph.interferes(node, other))
                .map(|(_, &color)| color)
                .collect();
            match palette.iter().find(|c| !taken.contains(*c)) {
                Some(&color) => {
                    assignments.insert(node, color);
                }
                None => stuck.push(node),
            }
        }

        if stuck.is_empty() {
            return ColoringResult { assignments, spilled };
        }

        let victim = stuck
            .into_iter()
            .min_by_key(|&n| (graph.spill_cost(n), n))
            .expect("stuck list is non-empty");
        log::debug!(
            "coloring spills r{} (cost {})",
            victim,
            graph.spill_cost(victim)
        );
        spilled.push(victim);
    }
}

/// Rewrite a sequence through a coloring result.
///
/// Colored registers are renamed in place. Spilled registers take the stack
/// slots produced by `slot_for` and are rewritten to loads/stores through
/// `scratch`, which must be reserved out of the palette by the caller.
/// Returns the old-index → new-index map so label definitions can be
/// remapped.
pub fn apply(
    instructions: &mut Vec<Instruction>,
    result: &ColoringResult,
    frame_pointer: PhysReg,
    scratch: PhysReg,
    mut slot_for: impl FnMut(u8) -> i32,
) -> Vec<usize> {
    let slots: HashMap<u8, i32> = result
        .spilled
        .iter()
        .map(|&reg| (reg, slot_for(reg)))
        .collect();

    let rename = |reg: PhysReg| -> PhysReg {
        if slots.contains_key(&reg.id()) {
            scratch
        } else {
            result.assignments.get(&reg.id()).copied().unwrap_or(reg)
        }
    };

    let mut rewritten: Vec<Instruction> = Vec::with_capacity(instructions.len());
    let mut index_map: Vec<usize> = Vec::with_capacity(instructions.len());

    for inst in instructions.drain(..) {
        index_map.push(rewritten.len());

        let spilled_uses: Vec<u8> = inst
            .use_registers()
            .iter()
            .map(|r| r.id())
            .filter(|id| slots.contains_key(id))
            .collect();
        let spilled_def = inst
            .def_register()
            .map(|r| r.id())
            .filter(|id| slots.contains_key(id));

        // Reload the spilled value before any use.
        if let Some(&id) = spilled_uses.first() {
            let load = Instruction::load(scratch, frame_pointer, slots[&id])
                .expect("load is always well-formed");
            rewritten.push(load);
        }

        let mut renamed = inst;
        for op in &mut renamed.operands {
            match op {
                Operand::Register(r) => *r = rename(*r),
                Operand::Memory(MemOperand { base, index, .. }) => {
                    *base = rename(*base);
                    if let Some(idx) = index {
                        *idx = rename(*idx);
                    }
                }
                _ => {}
            }
        }
        rewritten.push(renamed);

        // Write the spilled value back after a def.
        if let Some(id) = spilled_def {
            let store = Instruction::store(frame_pointer, slots[&id], scratch)
                .expect("store is always well-formed");
            rewritten.push(store);
        }
    }

    *instructions = rewritten;
    index_map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond_graph() -> InterferenceGraph {
        // r0 -- r1, r0 -- r2, r1 -- r2: needs 3 colors.
        let mut g = InterferenceGraph::default();
        g.add_edge(0, 1);
        g.add_edge(0, 2);
        g.add_edge(1, 2);
        g.note_def(0);
        g.note_def(1);
        g.note_def(2);
        g.note_use(0);
        g.note_use(0);
        g.note_use(1);
        g.note_use(2);
        g
    }

    #[test]
    fn test_coloring_assigns_distinct_colors_to_neighbors() {
        let g = diamond_graph();
        let palette = [PhysReg(0), PhysReg(1), PhysReg(2)];
        let result = color(&g, &palette);
        assert!(result.spilled.is_empty());
        assert_ne!(result.assignments[&0], result.assignments[&1]);
        assert_ne!(result.assignments[&0], result.assignments[&2]);
        assert_ne!(result.assignments[&1], result.assignments[&2]);
    }

    #[test]
    fn test_coloring_spills_cheapest_when_palette_too_small() {
        let g = diamond_graph();
        // Two colors for a triangle: the last node in degree order cannot
        // be colored and becomes the spill victim; the remaining two then
        // color cleanly.
        let palette = [PhysReg(0), PhysReg(1)];
        let result = color(&g, &palette);
        assert_eq!(result.spilled, vec![2]);
        assert_eq!(result.assignments.len(), 2);
        assert_ne!(result.assignments[&0], result.assignments[&1]);
    }

    #[test]
    fn test_apply_rewrites_spilled_access() {
        use crate::target::x86;
        let mut insts = vec![
            Instruction::mov_imm(PhysReg(0), 5).unwrap(),
            Instruction::mov_reg(PhysReg(1), PhysReg(0)).unwrap(),
        ];
        let result = ColoringResult {
            assignments: HashMap::new(),
            spilled: vec![0],
        };
        let map = apply(&mut insts, &result, x86::RBP, x86::R11, |_| -8);
        // mov r0, 5 gains a store after it; mov r1, r0 gains a load before.
        assert_eq!(map, vec![0, 2]);
        assert_eq!(insts.len(), 4);
        assert_eq!(insts[1].def_register(), None); // store
        assert_eq!(insts[2].def_register(), Some(x86::R11)); // reload
    }
}
