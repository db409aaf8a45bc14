//! Expression lowering.
//!
//! Every expression evaluates into a register the caller owns and must
//! free. Integer arithmetic follows the two-operand ALU shape (result in
//! the left register); comparisons materialize through SETcc; `&&`/`||`
//! short-circuit with TEST + conditional jumps; calls follow the ABI's
//! argument placement with 16-byte stack alignment.

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::CodeGenerator;
use crate::core::error::{CodegenError, CodegenResult};
use crate::inst::{Instruction, Opcode, Operand};
use crate::labels::LabelKind;
use crate::target::PhysReg;

impl<'s, 'arena> CodeGenerator<'s, 'arena> {
    /// Evaluate `expr` into a freshly allocated register (caller frees).
    pub(crate) fn generate_expression(&mut self, expr: &Expr) -> CodegenResult<PhysReg> {
        match expr {
            Expr::IntLiteral(value) => {
                let reg = self.allocate_reg()?;
                self.emit(Instruction::mov_imm(reg, *value)?);
                Ok(reg)
            }
            Expr::BoolLiteral(value) => {
                let reg = self.allocate_reg()?;
                self.emit(Instruction::mov_imm(reg, i64::from(*value))?);
                Ok(reg)
            }
            Expr::FloatLiteral(value) => {
                let reg = self.allocate_reg_for(true)?;
                self.emit(Instruction::with_operands(
                    Opcode::Movsd,
                    vec![
                        Operand::Register(reg),
                        Operand::Immediate(value.to_bits() as i64),
                    ],
                )?);
                Ok(reg)
            }
            Expr::Ident { name, .. } => {
                let local = self.lookup_local(name)?;
                let fp = self.abi.frame_pointer;
                let reg = self.allocate_reg_for(local.ty.is_float())?;
                if local.ty.is_float() {
                    self.emit(Instruction::with_operands(
                        Opcode::Movsd,
                        vec![Operand::Register(reg), Operand::mem(fp, local.offset)],
                    )?);
                } else {
                    self.emit(Instruction::load(reg, fp, local.offset)?);
                }
                Ok(reg)
            }
            Expr::Unary { op, operand } => self.generate_unary(*op, operand),
            Expr::Binary { op, lhs, rhs, ty } => {
                self.generate_binary(*op, lhs, rhs, ty.is_float())
            }
            Expr::Call { callee, args, ty } => {
                self.generate_call(callee, args, ty.is_float())
            }
        }
    }

    /// Evaluate `expr`, then move the result into `dest` if it landed
    /// elsewhere. `dest` is not taken from the allocator.
    pub(crate) fn generate_expression_into(
        &mut self,
        expr: &Expr,
        dest: PhysReg,
    ) -> CodegenResult<()> {
        let float = expr.ty().is_float();
        let reg = self.generate_expression(expr)?;
        if reg != dest {
            if float {
                self.emit(Instruction::with_operands(
                    Opcode::Movsd,
                    vec![Operand::Register(dest), Operand::Register(reg)],
                )?);
            } else {
                self.emit(Instruction::mov_reg(dest, reg)?);
            }
        }
        self.free_reg(reg);
        Ok(())
    }

    fn generate_unary(&mut self, op: UnaryOp, operand: &Expr) -> CodegenResult<PhysReg> {
        let reg = self.generate_expression(operand)?;
        match op {
            UnaryOp::Neg => {
                self.emit(Instruction::with_operands(
                    Opcode::Neg,
                    vec![Operand::Register(reg)],
                )?);
            }
            UnaryOp::Not => {
                // TEST sets ZF; SETE materializes the logical complement.
                self.emit(Instruction::test(reg, reg)?);
                self.emit(Instruction::set_cc(Opcode::Sete, reg)?);
                self.emit(Instruction::with_operands(
                    Opcode::Movzx,
                    vec![Operand::Register(reg), Operand::Register(reg)],
                )?);
            }
            UnaryOp::BitNot => {
                self.emit(Instruction::with_operands(
                    Opcode::Not,
                    vec![Operand::Register(reg)],
                )?);
            }
        }
        Ok(reg)
    }

    fn generate_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        float: bool,
    ) -> CodegenResult<PhysReg> {
        match op {
            BinaryOp::And | BinaryOp::Or => self.generate_short_circuit(op, lhs, rhs),
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => self.generate_comparison(op, lhs, rhs),
            BinaryOp::Div | BinaryOp::Mod => self.generate_division(op, lhs, rhs),
            _ => {
                let lhs_reg = self.generate_expression(lhs)?;
                let rhs_reg = self.generate_expression(rhs)?;
                let opcode = if float {
                    match op {
                        BinaryOp::Add => Opcode::Fadd,
                        BinaryOp::Sub => Opcode::Fsub,
                        BinaryOp::Mul => Opcode::Fmul,
                        _ => {
                            return Err(CodegenError::unsupported(format!(
                                "floating-point operator {op:?}"
                            )))
                        }
                    }
                } else {
                    match op {
                        BinaryOp::Add => Opcode::Add,
                        BinaryOp::Sub => Opcode::Sub,
                        BinaryOp::Mul => Opcode::Imul,
                        BinaryOp::BitAnd => Opcode::And,
                        BinaryOp::BitOr => Opcode::Or,
                        BinaryOp::BitXor => Opcode::Xor,
                        BinaryOp::Shl => Opcode::Shl,
                        BinaryOp::Shr => Opcode::Shr,
                        _ => unreachable!("handled above"),
                    }
                };
                self.emit(Instruction::with_operands(
                    opcode,
                    vec![Operand::Register(lhs_reg), Operand::Register(rhs_reg)],
                )?);
                self.free_reg(rhs_reg);
                Ok(lhs_reg)
            }
        }
    }

    /// CMP + SETcc + zero-extend into the left operand's register.
    fn generate_comparison(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> CodegenResult<PhysReg> {
        if lhs.ty().is_float() || rhs.ty().is_float() {
            return Err(CodegenError::unsupported("floating-point comparison"));
        }
        let lhs_reg = self.generate_expression(lhs)?;
        let rhs_reg = self.generate_expression(rhs)?;
        self.emit(Instruction::cmp(
            Operand::Register(lhs_reg),
            Operand::Register(rhs_reg),
        )?);
        let setcc = match op {
            BinaryOp::Eq => Opcode::Sete,
            BinaryOp::Ne => Opcode::Setne,
            BinaryOp::Lt => Opcode::Setl,
            BinaryOp::Le => Opcode::Setle,
            BinaryOp::Gt => Opcode::Setg,
            BinaryOp::Ge => Opcode::Setge,
            _ => unreachable!("caller filters comparison operators"),
        };
        self.emit(Instruction::set_cc(setcc, lhs_reg)?);
        self.emit(Instruction::with_operands(
            Opcode::Movzx,
            vec![Operand::Register(lhs_reg), Operand::Register(lhs_reg)],
        )?);
        self.free_reg(rhs_reg);
        Ok(lhs_reg)
    }

    /// Short-circuit `&&`/`||`: the right operand only evaluates when the
    /// left one did not decide the result.
    fn generate_short_circuit(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> CodegenResult<PhysReg> {
        let result = self.generate_expression(lhs)?;
        let decided = self.labels.create_label(
            LabelKind::BranchTarget,
            if op == BinaryOp::And { ".L_and_false" } else { ".L_or_true" },
        );
        let end = self.labels.create_label(
            LabelKind::BranchTarget,
            if op == BinaryOp::And { ".L_and_end" } else { ".L_or_end" },
        );
        let decided_name = self.labels.name(decided);
        let end_name = self.labels.name(end);

        self.emit(Instruction::test(result, result)?);
        let jump = if op == BinaryOp::And { Opcode::Je } else { Opcode::Jne };
        self.emit(Instruction::jump_cc(jump, &decided_name)?);

        // Left operand did not decide: the right operand's truthiness is
        // the result.
        let rhs_reg = self.generate_expression(rhs)?;
        self.emit(Instruction::test(rhs_reg, rhs_reg)?);
        self.emit(Instruction::set_cc(Opcode::Setne, result)?);
        self.emit(Instruction::with_operands(
            Opcode::Movzx,
            vec![Operand::Register(result), Operand::Register(result)],
        )?);
        self.free_reg(rhs_reg);
        self.emit_jump(&end_name)?;

        self.place_label(decided)?;
        let decided_value = i64::from(op == BinaryOp::Or);
        self.emit(Instruction::mov_imm(result, decided_value)?);

        self.place_label(end)?;
        Ok(result)
    }

    /// Signed division/remainder through the architecture's divide idiom:
    /// dividend widened into the RAX:RDX pair, quotient in RAX, remainder
    /// in RDX. Live values in those registers are preserved around it.
    fn generate_division(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> CodegenResult<PhysReg> {
        use crate::target::x86::{RAX, RDX};

        let lhs_reg = self.generate_expression(lhs)?;
        let rhs_reg = self.generate_expression(rhs)?;
        let result = lhs_reg;

        let save_rax = result != RAX;
        let save_rdx = result != RDX;
        if save_rax {
            self.emit(Instruction::push(Operand::Register(RAX))?);
        }
        if save_rdx {
            self.emit(Instruction::push(Operand::Register(RDX))?);
        }

        // The divisor must survive the dividend setup and the sign extend.
        let divisor = if rhs_reg == RAX || rhs_reg == RDX {
            let scratch = self.allocate_reg()?;
            self.emit(Instruction::mov_reg(scratch, rhs_reg)?);
            scratch
        } else {
            rhs_reg
        };

        if lhs_reg != RAX {
            self.emit(Instruction::mov_reg(RAX, lhs_reg)?);
        }
        self.emit(Instruction::with_operands(Opcode::Cqo, vec![])?);
        self.emit(Instruction::with_operands(
            Opcode::Idiv,
            vec![Operand::Register(divisor)],
        )?);

        let value_reg = if op == BinaryOp::Div { RAX } else { RDX };
        if result != value_reg {
            self.emit(Instruction::mov_reg(result, value_reg)?);
        }

        if save_rdx {
            self.emit(Instruction::pop(RDX)?);
        }
        if save_rax {
            self.emit(Instruction::pop(RAX)?);
        }

        if divisor != rhs_reg {
            self.free_reg(divisor);
        }
        self.free_reg(rhs_reg);
        Ok(result)
    }

    /// Call sequence per the ABI: integer arguments into the integer
    /// argument registers, floats into the float registers, the overflow
    /// pushed on the stack with 16-byte alignment, cleanup after the call.
    fn generate_call(
        &mut self,
        callee: &str,
        args: &[Expr],
        float_result: bool,
    ) -> CodegenResult<PhysReg> {
        let mut int_idx = 0usize;
        let mut float_idx = 0usize;
        let mut stack_bytes = 0i64;

        for arg in args {
            let is_float = arg.ty().is_float();
            let temp = self.generate_expression(arg)?;
            if is_float {
                if float_idx < self.abi.float_arg_regs.len() {
                    let dest = self.abi.float_arg_regs[float_idx];
                    float_idx += 1;
                    self.emit(Instruction::with_operands(
                        Opcode::Movsd,
                        vec![Operand::Register(dest), Operand::Register(temp)],
                    )?);
                } else {
                    self.emit(Instruction::push(Operand::Register(temp))?);
                    stack_bytes += 8;
                }
            } else if int_idx < self.abi.int_arg_regs.len() {
                let dest = self.abi.int_arg_regs[int_idx];
                int_idx += 1;
                if dest != temp {
                    self.emit(Instruction::mov_reg(dest, temp)?);
                }
            } else {
                self.emit(Instruction::push(Operand::Register(temp))?);
                stack_bytes += 8;
            }
            self.free_reg(temp);
        }

        // The ABI requires a 16-byte aligned stack at the call.
        let padding = (16 - stack_bytes % 16) % 16;
        if padding > 0 {
            self.emit(Instruction::sub(
                Operand::Register(self.abi.stack_pointer),
                Operand::Immediate(padding),
            )?);
        }

        self.emit(Instruction::call(callee)?);

        let cleanup = stack_bytes + padding;
        if cleanup > 0 {
            self.emit(Instruction::add(
                Operand::Register(self.abi.stack_pointer),
                Operand::Immediate(cleanup),
            )?);
        }

        // Result arrives in the ABI return register.
        let dest = self.allocate_reg_for(float_result)?;
        if float_result {
            if dest != self.abi.float_return_reg {
                self.emit(Instruction::with_operands(
                    Opcode::Movsd,
                    vec![
                        Operand::Register(dest),
                        Operand::Register(self.abi.float_return_reg),
                    ],
                )?);
            }
        } else if dest != self.abi.int_return_reg {
            self.emit(Instruction::mov_reg(dest, self.abi.int_return_reg)?);
        }
        Ok(dest)
    }
}
