//! Statement lowering.
//!
//! One arm per statement kind, dispatched exhaustively. Control-flow
//! statements build their label skeletons through the label manager;
//! `break`/`continue` resolve through the loop-context stack and report
//! "outside of loop" as a diagnostic rather than generating a wild jump.

use super::ast::{Expr, MatchArm, Pattern, Stmt};
use super::{CodeGenerator, LoopContext};
use crate::core::error::{CodegenError, CodegenResult};
use crate::inst::{Instruction, Opcode, Operand};
use crate::labels::LabelKind;
use crate::opt::{match_opt, MatchStrategy, PASS_MATCH_DISPATCH};

impl<'s, 'arena> CodeGenerator<'s, 'arena> {
    pub(crate) fn generate_statement(&mut self, stmt: &Stmt) -> CodegenResult<()> {
        match stmt {
            Stmt::Let { name, ty, init } => {
                let value = self.generate_expression(init)?;
                let offset = self.create_local(name, ty.clone());
                let fp = self.abi.frame_pointer;
                if ty.is_float() {
                    self.emit(Instruction::with_operands(
                        Opcode::Movsd,
                        vec![Operand::mem(fp, offset), Operand::Register(value)],
                    )?);
                } else {
                    self.emit(Instruction::store(fp, offset, value)?);
                }
                self.free_reg(value);
                Ok(())
            }

            Stmt::Assign { name, value } => {
                let local = self.lookup_local(name)?;
                let reg = self.generate_expression(value)?;
                let fp = self.abi.frame_pointer;
                if local.ty.is_float() {
                    self.emit(Instruction::with_operands(
                        Opcode::Movsd,
                        vec![Operand::mem(fp, local.offset), Operand::Register(reg)],
                    )?);
                } else {
                    self.emit(Instruction::store(fp, local.offset, reg)?);
                }
                self.free_reg(reg);
                Ok(())
            }

            Stmt::If { cond, then_body, else_body } => {
                let else_label = self.labels.create_label(LabelKind::BranchTarget, ".L_else");
                let end_label = self.labels.create_label(LabelKind::BranchTarget, ".L_end");
                let else_name = self.labels.name(else_label);
                let end_name = self.labels.name(end_label);

                let cond_reg = self.generate_expression(cond)?;
                self.emit_jump_if_false(cond_reg, &else_name)?;
                self.free_reg(cond_reg);

                for s in then_body {
                    self.generate_statement(s)?;
                }
                self.emit_jump(&end_name)?;

                self.place_label(else_label)?;
                if let Some(else_body) = else_body {
                    for s in else_body {
                        self.generate_statement(s)?;
                    }
                }
                self.place_label(end_label)
            }

            Stmt::IfLet { pattern, value, then_body, else_body } => {
                let else_label =
                    self.labels.create_label(LabelKind::BranchTarget, ".L_if_let_else");
                let end_label =
                    self.labels.create_label(LabelKind::BranchTarget, ".L_if_let_end");
                let else_name = self.labels.name(else_label);
                let end_name = self.labels.name(end_label);

                let value_reg = self.generate_expression(value)?;
                let test = self.generate_pattern_test(pattern, value_reg, &else_name);
                let bind = test.and_then(|_| self.generate_pattern_bindings(pattern, value_reg));
                self.free_reg(value_reg);
                bind?;

                for s in then_body {
                    self.generate_statement(s)?;
                }
                self.emit_jump(&end_name)?;

                self.place_label(else_label)?;
                if let Some(else_body) = else_body {
                    for s in else_body {
                        self.generate_statement(s)?;
                    }
                }
                self.place_label(end_label)
            }

            Stmt::For { var, iterable, body } => {
                self.generate_for_range(var, iterable, body)
            }

            Stmt::Match { scrutinee, arms } => self.generate_match(scrutinee, arms),

            Stmt::Return(value) => {
                if let Some(expr) = value {
                    let dest = if self.current_return_type.is_float() {
                        self.abi.float_return_reg
                    } else {
                        self.abi.int_return_reg
                    };
                    self.generate_expression_into(expr, dest)?;
                }
                let exit = self.current_exit_label.clone().ok_or_else(|| {
                    CodegenError::unsupported("return statement outside of a function")
                })?;
                self.emit_jump(&exit)
            }

            Stmt::Break => match self.loop_stack.last() {
                Some(ctx) => {
                    let target = ctx.exit_label.clone();
                    self.emit_jump(&target)
                }
                None => Err(CodegenError::unsupported("break statement outside of loop")),
            },

            Stmt::Continue => match self.loop_stack.last() {
                Some(ctx) => {
                    let target = ctx.continue_label.clone();
                    self.emit_jump(&target)
                }
                None => {
                    Err(CodegenError::unsupported("continue statement outside of loop"))
                }
            },

            Stmt::Expr(expr) => {
                let reg = self.generate_expression(expr)?;
                self.free_reg(reg);
                Ok(())
            }

            Stmt::Block(body) => {
                for s in body {
                    self.generate_statement(s)?;
                }
                Ok(())
            }
        }
    }

    /// Counting loop over `range(n)`: counter from 0, exit when counter
    /// reaches the bound, `continue` lands on the increment.
    fn generate_for_range(
        &mut self,
        var: &str,
        iterable: &Expr,
        body: &[Stmt],
    ) -> CodegenResult<()> {
        // Only range(n) is lowered; general iterables are a documented
        // limitation of this backend.
        let bound = match iterable {
            Expr::Call { callee, args, .. } if callee == "range" && args.len() == 1 => {
                &args[0]
            }
            _ => {
                return Err(CodegenError::unsupported(
                    "for-loop iterables other than range(n)",
                ))
            }
        };

        let start = self.labels.create_label(LabelKind::LoopStart, ".L_for_start");
        let cont = self.labels.create_label(LabelKind::LoopStart, ".L_for_continue");
        let exit = self.labels.create_label(LabelKind::LoopEnd, ".L_for_exit");
        let start_name = self.labels.name(start);
        let cont_name = self.labels.name(cont);
        let exit_name = self.labels.name(exit);

        let counter = self.allocate_reg()?;
        let limit = match self.allocate_reg() {
            Ok(reg) => reg,
            Err(e) => {
                self.free_reg(counter);
                return Err(e);
            }
        };

        let ctx = LoopContext {
            exit_label: exit_name.clone(),
            continue_label: cont_name.clone(),
        };
        let result = self.with_loop_context(ctx, |gen| {
            gen.emit(Instruction::mov_imm(counter, 0)?);
            gen.generate_expression_into(bound, limit)?;

            gen.place_label(start)?;
            gen.emit(Instruction::cmp(
                Operand::Register(counter),
                Operand::Register(limit),
            )?);
            gen.emit(Instruction::jump_cc(Opcode::Jge, &exit_name)?);

            // The induction variable is observable in the body.
            let var_ty = bound.ty();
            let offset = gen.create_local(var, var_ty);
            let fp = gen.abi.frame_pointer;
            gen.emit(Instruction::store(fp, offset, counter)?);

            for s in body {
                gen.generate_statement(s)?;
            }

            gen.place_label(cont)?;
            gen.emit(Instruction::inc(counter)?);
            gen.emit_jump(&start_name)?;
            gen.place_label(exit)
        });

        self.free_reg(counter);
        self.free_reg(limit);
        result
    }

    /// Match lowering. The scrutinee evaluates once; arms are tried in
    /// source order and the first structural match wins. When the dispatch
    /// pass is enabled and every arm is an integer tag, the strategy
    /// selector may replace the linear chain with a jump table or binary
    /// search over per-arm body labels.
    fn generate_match(&mut self, scrutinee: &Expr, arms: &[MatchArm]) -> CodegenResult<()> {
        let end_label = self.labels.create_label(LabelKind::BranchTarget, ".L_match_end");
        let end_name = self.labels.name(end_label);

        let value_reg = self.generate_expression(scrutinee)?;
        let result = self.generate_match_arms(arms, value_reg, &end_name);
        self.free_reg(value_reg);
        result?;
        self.place_label(end_label)
    }

    fn generate_match_arms(
        &mut self,
        arms: &[MatchArm],
        value_reg: crate::target::PhysReg,
        end_name: &str,
    ) -> CodegenResult<()> {
        // Integer-tag arms with at most a trailing default are eligible for
        // table/search dispatch.
        if self.optimizer.is_pass_enabled(PASS_MATCH_DISPATCH) {
            if let Some(plan) = integer_match_plan(arms) {
                let strategy = MatchStrategy::select(&plan.tags);
                if strategy != MatchStrategy::LinearChain {
                    return self.generate_integer_dispatch(arms, &plan, strategy, value_reg, end_name);
                }
            }
        }

        // Linear chain: test, bind, body, jump to end; fall to next arm on
        // test failure.
        let arm_count = arms.len();
        for (i, arm) in arms.iter().enumerate() {
            let next_name = if i + 1 < arm_count {
                let next =
                    self.labels.create_label(LabelKind::BranchTarget, ".L_match_next");
                Some((next, self.labels.name(next)))
            } else {
                None
            };
            let fail_name = next_name
                .as_ref()
                .map(|(_, name)| name.as_str())
                .unwrap_or(end_name);

            self.generate_pattern_test(&arm.pattern, value_reg, fail_name)?;
            self.generate_pattern_bindings(&arm.pattern, value_reg)?;
            for s in &arm.body {
                self.generate_statement(s)?;
            }
            self.emit_jump(end_name)?;

            if let Some((next, _)) = next_name {
                self.place_label(next)?;
            }
        }
        Ok(())
    }

    /// Emit jump-table or binary-search dispatch, then the arm bodies under
    /// their labels.
    fn generate_integer_dispatch(
        &mut self,
        arms: &[MatchArm],
        plan: &IntegerMatchPlan,
        strategy: MatchStrategy,
        value_reg: crate::target::PhysReg,
        end_name: &str,
    ) -> CodegenResult<()> {
        self.emit_comment("integer match dispatch")?;

        // A label per integer arm body.
        let mut targets: Vec<(i64, String)> = Vec::with_capacity(plan.tags.len());
        let mut body_labels = Vec::with_capacity(arms.len());
        for arm in arms {
            let label = self.labels.create_label(LabelKind::BranchTarget, ".L_match_arm");
            body_labels.push(label);
            if let Pattern::IntLiteral(tag) = arm.pattern {
                targets.push((tag, self.labels.name(label)));
            }
        }
        let default_label = self.labels.create_label(LabelKind::BranchTarget, ".L_match_default");
        let default_name = self.labels.name(default_label);

        match strategy {
            MatchStrategy::JumpTable { min, table_len } => {
                match_opt::generate_jump_table(
                    &self.buffer,
                    &self.labels,
                    &mut self.regs,
                    &self.optimizer.stats,
                    value_reg,
                    &targets,
                    &default_name,
                    min,
                    table_len,
                )?;
            }
            MatchStrategy::BinarySearch => {
                match_opt::generate_binary_search(
                    &self.buffer,
                    &self.labels,
                    &self.optimizer.stats,
                    value_reg,
                    &targets,
                )?;
                // Search misses fall through to the default path.
                self.emit_jump(&default_name)?;
            }
            MatchStrategy::LinearChain => unreachable!("caller filters the fallback"),
        }

        for (arm, label) in arms.iter().zip(&body_labels) {
            self.place_label(*label)?;
            self.generate_pattern_bindings(&arm.pattern, value_reg)?;
            for s in &arm.body {
                self.generate_statement(s)?;
            }
            self.emit_jump(end_name)?;
        }

        self.place_label(default_label)?;
        if let Some(default_idx) = plan.default_arm {
            // The trailing wildcard arm already emitted its body above;
            // route the default path there.
            let target = self.labels.name(body_labels[default_idx]);
            self.emit_jump(&target)?;
        }
        Ok(())
    }
}

/// Shape extracted from an all-integer match.
struct IntegerMatchPlan {
    tags: Vec<i64>,
    /// Index of a trailing wildcard/binding arm acting as the default.
    default_arm: Option<usize>,
}

/// Integer-dispatch eligibility: every arm is an integer literal, except an
/// optional final wildcard (or binding) default.
fn integer_match_plan(arms: &[MatchArm]) -> Option<IntegerMatchPlan> {
    let mut tags = Vec::with_capacity(arms.len());
    let mut default_arm = None;
    for (i, arm) in arms.iter().enumerate() {
        match &arm.pattern {
            Pattern::IntLiteral(tag) => tags.push(*tag),
            Pattern::Wildcard | Pattern::Binding(_) if i + 1 == arms.len() => {
                default_arm = Some(i);
            }
            _ => return None,
        }
    }
    if tags.is_empty() {
        None
    } else {
        Some(IntegerMatchPlan { tags, default_arm })
    }
}
