//! Match-dispatch strategy selection and lowering.
//!
//! A match over integer (or enum-tag) arms can dispatch three ways: a jump
//! table when the tag range is dense, a binary search when the arm set is
//! large but sparse, or the linear comparison chain the generator emits by
//! default. The selector is a pure function of the arm tags so the choice
//! is directly testable; the emission helpers append the dispatch sequence
//! through the normal buffer/label/allocator plumbing.

use super::OptStats;
use crate::core::error::{CodegenError, CodegenResult};
use crate::inst::{Instruction, InstructionBuffer, MemOperand, Opcode, Operand};
use crate::labels::{LabelKind, LabelManager};
use crate::regalloc::RegisterAllocator;
use crate::target::PhysReg;

/// Largest tag range a jump table may span.
const JUMP_TABLE_MAX_RANGE: i64 = 256;

/// Minimum arm count for binary-search dispatch.
const BINARY_SEARCH_MIN_ARMS: usize = 8;

/// How a match over integer tags should dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    /// O(1) indirect jump through a table of `table_len` entries starting
    /// at tag `min`.
    JumpTable { min: i64, table_len: usize },
    /// O(log n) comparison tree over sorted tags.
    BinarySearch,
    /// In-order comparison chain; always correct, used as the fallback.
    LinearChain,
}

impl MatchStrategy {
    /// Choose a dispatch strategy for the given arm tags.
    ///
    /// A table is viable when the tag range is at most
    /// [`JUMP_TABLE_MAX_RANGE`] and at least three quarters filled, so a
    /// sparse set like `{0, 1000, 1000000}` can never produce a
    /// million-entry table. Large sparse sets fall back to binary search,
    /// everything else to the linear chain.
    pub fn select(tags: &[i64]) -> MatchStrategy {
        if tags.is_empty() {
            return MatchStrategy::LinearChain;
        }
        let min = *tags.iter().min().expect("non-empty");
        let max = *tags.iter().max().expect("non-empty");
        let range = (max as i128) - (min as i128) + 1;

        if range <= JUMP_TABLE_MAX_RANGE as i128
            && tags.len() as i128 * 4 >= range * 3
        {
            MatchStrategy::JumpTable { min, table_len: range as usize }
        } else if tags.len() >= BINARY_SEARCH_MIN_ARMS {
            MatchStrategy::BinarySearch
        } else {
            MatchStrategy::LinearChain
        }
    }
}

/// Emit jump-table dispatch for a dense integer match.
///
/// Sequence: normalize the tag to `[0, table_len)`, bounds-check against the
/// table size (out-of-range goes to `default_label`), then jump indirect
/// through the table. Table entries are emitted as `.quad` directives, one
/// per tag value, pointing at the matching arm's body label or the default.
pub fn generate_jump_table(
    buffer: &InstructionBuffer,
    labels: &LabelManager,
    regs: &mut RegisterAllocator,
    stats: &OptStats,
    value_reg: PhysReg,
    arms: &[(i64, String)],
    default_label: &str,
    min: i64,
    table_len: usize,
) -> CodegenResult<()> {
    let temp = regs.allocate(true).ok_or_else(|| {
        CodegenError::RegisterAllocationFailed {
            reason: "jump table index register".into(),
        }
    })?;
    let base = regs.allocate(false).ok_or_else(|| {
        regs.free(temp);
        CodegenError::RegisterAllocationFailed {
            reason: "jump table base register".into(),
        }
    })?;

    let table_label = labels.create_label(LabelKind::BranchTarget, ".L_jump_table");
    let table_name = labels.name(table_label);

    buffer.append(Instruction::mov_reg(temp, value_reg)?);
    if min != 0 {
        buffer.append(Instruction::sub(
            Operand::Register(temp),
            Operand::Immediate(min),
        )?);
    }
    buffer.append(Instruction::cmp(
        Operand::Register(temp),
        Operand::Immediate(table_len as i64),
    )?);
    buffer.append(Instruction::jump_cc(Opcode::Jae, default_label)?);

    buffer.append(Instruction::lea(base, Operand::label(&table_name))?);
    buffer.append(Instruction::with_operands(
        Opcode::Shl,
        vec![Operand::Register(temp), Operand::Immediate(3)],
    )?);
    buffer.append(Instruction::add(
        Operand::Register(temp),
        Operand::Register(base),
    )?);
    buffer.append(Instruction::jump_indirect(Operand::Memory(MemOperand::base_disp(
        temp, 0,
    )))?);

    labels.define_label(table_label, buffer.len())?;
    for slot in 0..table_len {
        let value = min + slot as i64;
        let target = arms
            .iter()
            .find(|(tag, _)| *tag == value)
            .map(|(_, label)| label.as_str())
            .unwrap_or(default_label);
        buffer.append(Instruction::directive(format!(".quad {target}"))?);
    }

    regs.free(temp);
    regs.free(base);
    stats.record_jump_table();
    Ok(())
}

/// Emit binary-search dispatch for a sparse ordered integer match.
///
/// Arms are sorted by tag and compiled into a comparison tree; control falls
/// through to whatever follows (the caller emits the default path there).
pub fn generate_binary_search(
    buffer: &InstructionBuffer,
    labels: &LabelManager,
    stats: &OptStats,
    value_reg: PhysReg,
    arms: &[(i64, String)],
) -> CodegenResult<()> {
    let mut sorted: Vec<(i64, &str)> =
        arms.iter().map(|(tag, label)| (*tag, label.as_str())).collect();
    sorted.sort_by_key(|&(tag, _)| tag);
    emit_search_node(buffer, labels, value_reg, &sorted)?;
    stats.record_binary_search();
    Ok(())
}

fn emit_search_node(
    buffer: &InstructionBuffer,
    labels: &LabelManager,
    value_reg: PhysReg,
    nodes: &[(i64, &str)],
) -> CodegenResult<()> {
    match nodes {
        [] => Ok(()),
        [(tag, target)] => {
            buffer.append(Instruction::cmp(
                Operand::Register(value_reg),
                Operand::Immediate(*tag),
            )?);
            buffer.append(Instruction::jump_cc(Opcode::Je, *target)?);
            Ok(())
        }
        _ => {
            let mid = nodes.len() / 2;
            let (tag, target) = nodes[mid];
            buffer.append(Instruction::cmp(
                Operand::Register(value_reg),
                Operand::Immediate(tag),
            )?);
            buffer.append(Instruction::jump_cc(Opcode::Je, target)?);

            let left = labels.create_label(LabelKind::BranchTarget, ".L_bsearch_left");
            let left_name = labels.name(left);
            buffer.append(Instruction::jump_cc(Opcode::Jl, &left_name)?);

            // Greater: search the right half, then the left half under its
            // own label.
            emit_search_node(buffer, labels, value_reg, &nodes[mid + 1..])?;
            let after = labels.create_label(LabelKind::BranchTarget, ".L_bsearch_done");
            let after_name = labels.name(after);
            buffer.append(Instruction::jump(&after_name)?);

            labels.define_label(left, buffer.len())?;
            emit_search_node(buffer, labels, value_reg, &nodes[..mid])?;
            labels.define_label(after, buffer.len())?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_contiguous_tags_pick_jump_table() {
        let strategy = MatchStrategy::select(&[0, 1, 2, 3, 4]);
        assert_eq!(strategy, MatchStrategy::JumpTable { min: 0, table_len: 5 });
    }

    #[test]
    fn test_sparse_tags_never_build_huge_table() {
        let strategy = MatchStrategy::select(&[0, 1000, 1_000_000]);
        assert_eq!(strategy, MatchStrategy::LinearChain);
    }

    #[test]
    fn test_sparse_many_tags_pick_binary_search() {
        let tags: Vec<i64> = (0..10).map(|i| i * 1000).collect();
        assert_eq!(MatchStrategy::select(&tags), MatchStrategy::BinarySearch);
    }

    #[test]
    fn test_density_threshold_is_three_quarters() {
        // Range 8, 6 arms: 6*4 = 24 >= 8*3 = 24 — dense enough.
        assert!(matches!(
            MatchStrategy::select(&[0, 1, 2, 3, 4, 7]),
            MatchStrategy::JumpTable { min: 0, table_len: 8 }
        ));
        // Range 9, 6 arms: 24 < 27 — too sparse for a table.
        assert_eq!(
            MatchStrategy::select(&[0, 1, 2, 3, 4, 8]),
            MatchStrategy::LinearChain
        );
    }

    #[test]
    fn test_offset_dense_range() {
        let strategy = MatchStrategy::select(&[100, 101, 102, 103]);
        assert_eq!(strategy, MatchStrategy::JumpTable { min: 100, table_len: 4 });
    }

    #[test]
    fn test_jump_table_emission_shape() {
        use crate::target::{CallingConvention, TargetAbi, TargetArchitecture};
        let abi =
            TargetAbi::new(TargetArchitecture::X86_64, CallingConvention::SystemV).unwrap();
        let mut regs = RegisterAllocator::new(&abi);
        let buffer = InstructionBuffer::new();
        let labels = LabelManager::new();
        let stats = OptStats::default();

        let value = regs.allocate(true).unwrap();
        let arms = vec![
            (0i64, ".L_arm0".to_string()),
            (1, ".L_arm1".to_string()),
            (2, ".L_arm2".to_string()),
        ];
        generate_jump_table(
            &buffer, &labels, &mut regs, &stats, value, &arms, ".L_default", 0, 3,
        )
        .unwrap();

        buffer.with_instructions(|insts| {
            // Bounds check precedes the indirect jump.
            assert!(insts.iter().any(|i| i.opcode == Opcode::Jae));
            let quads: Vec<_> = insts
                .iter()
                .filter(|i| i.is_directive)
                .filter_map(|i| i.comment.clone())
                .collect();
            assert_eq!(
                quads,
                vec![".quad .L_arm0", ".quad .L_arm1", ".quad .L_arm2"]
            );
        });
        assert_eq!(
            stats.jump_tables_created.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_binary_search_emission_covers_all_arms() {
        let buffer = InstructionBuffer::new();
        let labels = LabelManager::new();
        let stats = OptStats::default();
        let arms: Vec<(i64, String)> = (0..8)
            .map(|i| (i * 100, format!(".L_arm{i}")))
            .collect();
        generate_binary_search(&buffer, &labels, &stats, PhysReg(0), &arms).unwrap();

        buffer.with_instructions(|insts| {
            for (_, label) in &arms {
                assert!(
                    insts
                        .iter()
                        .any(|i| i.branch_target() == Some(label.as_str())),
                    "no branch to {label}"
                );
            }
        });
        assert!(labels.undefined_names().is_empty());
    }
}
