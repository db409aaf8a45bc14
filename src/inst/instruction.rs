//! Target instruction model.
//!
//! An [`Instruction`] is an opcode, an owned operand list, and an optional
//! comment. Operand count and operand kinds are validated against the
//! opcode's fixed contract at construction time; a malformed instruction is
//! never built. Comment/directive pseudo-instructions bypass arity checking
//! but must carry non-empty text.

use crate::core::error::{CodegenError, CodegenResult};
use crate::target::PhysReg;

/// Opcodes the backend generates. Mnemonics follow x86-64 naming; the
/// emitter maps them onto each target dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Mov,
    Movsd,
    Movzx,
    Lea,
    Add,
    Sub,
    Imul,
    Idiv,
    Cqo,
    Inc,
    Neg,
    Not,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Cmp,
    Test,
    Sete,
    Setne,
    Setl,
    Setle,
    Setg,
    Setge,
    Jmp,
    Je,
    Jne,
    Jl,
    Jle,
    Jg,
    Jge,
    Jae,
    Push,
    Pop,
    Call,
    Ret,
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
}

/// Operand kind bits used by the per-opcode contracts.
const K_REG: u8 = 1 << 0;
const K_IMM: u8 = 1 << 1;
const K_MEM: u8 = 1 << 2;
const K_LABEL: u8 = 1 << 3;

const RM: u8 = K_REG | K_MEM;
const RMI: u8 = K_REG | K_MEM | K_IMM;
const RI: u8 = K_REG | K_IMM;

impl Opcode {
    /// Allowed operand kinds per slot. The slice length is the opcode's
    /// fixed arity.
    fn operand_contract(self) -> &'static [u8] {
        use Opcode::*;
        match self {
            Mov => &[RM, RMI],
            Movsd => &[RM, RMI],
            Movzx => &[K_REG, RM],
            Lea => &[K_REG, K_MEM | K_LABEL],
            Add | Sub | Imul | And | Or | Xor => &[RM, RMI],
            Shl | Shr => &[RM, RI],
            Cmp | Test => &[RM, RMI],
            Idiv => &[RM],
            Cqo | Ret => &[],
            Inc | Neg | Not | Pop => &[RM],
            Push => &[RMI],
            Sete | Setne | Setl | Setle | Setg | Setge => &[K_REG],
            Jmp => &[K_LABEL | K_REG | K_MEM],
            Je | Jne | Jl | Jle | Jg | Jge | Jae => &[K_LABEL],
            Call => &[K_LABEL | K_REG],
            Fadd | Fsub | Fmul | Fdiv => &[K_REG, RMI],
        }
    }

    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Mov => "mov",
            Movsd => "movsd",
            Movzx => "movzx",
            Lea => "lea",
            Add => "add",
            Sub => "sub",
            Imul => "imul",
            Idiv => "idiv",
            Cqo => "cqo",
            Inc => "inc",
            Neg => "neg",
            Not => "not",
            And => "and",
            Or => "or",
            Xor => "xor",
            Shl => "shl",
            Shr => "shr",
            Cmp => "cmp",
            Test => "test",
            Sete => "sete",
            Setne => "setne",
            Setl => "setl",
            Setle => "setle",
            Setg => "setg",
            Setge => "setge",
            Jmp => "jmp",
            Je => "je",
            Jne => "jne",
            Jl => "jl",
            Jle => "jle",
            Jg => "jg",
            Jge => "jge",
            Jae => "jae",
            Push => "push",
            Pop => "pop",
            Call => "call",
            Ret => "ret",
            Fadd => "addsd",
            Fsub => "subsd",
            Fmul => "mulsd",
            Fdiv => "divsd",
        }
    }

    /// True for jumps, calls, and returns: anything that ends a basic block.
    pub fn is_control_transfer(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Jmp | Je | Jne | Jl | Jle | Jg | Jge | Jae | Call | Ret
        )
    }

    pub fn is_conditional_jump(self) -> bool {
        use Opcode::*;
        matches!(self, Je | Jne | Jl | Jle | Jg | Jge | Jae)
    }

    pub fn is_unconditional_jump(self) -> bool {
        self == Opcode::Jmp
    }

    /// Two-operand ALU ops where the destination is both read and written.
    pub fn reads_destination(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Add | Sub | Imul | And | Or | Xor | Shl | Shr | Inc | Neg | Not | Fadd
                | Fsub | Fmul | Fdiv
        )
    }

    /// Integer two-operand arithmetic eligible for constant folding.
    pub fn is_foldable_int_alu(self) -> bool {
        use Opcode::*;
        matches!(self, Add | Sub | Imul | And | Or | Xor | Shl | Shr)
    }

    /// Floating-point two-operand arithmetic eligible for IEEE folding.
    pub fn is_foldable_float_alu(self) -> bool {
        use Opcode::*;
        matches!(self, Fadd | Fsub | Fmul | Fdiv)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Memory operand: `[base + index * scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemOperand {
    pub base: PhysReg,
    pub index: Option<PhysReg>,
    pub scale: u8,
    pub disp: i32,
}

impl MemOperand {
    pub fn base_disp(base: PhysReg, disp: i32) -> Self {
        Self { base, index: None, scale: 1, disp }
    }
}

/// A single instruction operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    Register(PhysReg),
    Immediate(i64),
    Memory(MemOperand),
    Label(String),
}

impl Operand {
    pub fn mem(base: PhysReg, disp: i32) -> Self {
        Operand::Memory(MemOperand::base_disp(base, disp))
    }

    pub fn label(name: impl Into<String>) -> Self {
        Operand::Label(name.into())
    }

    fn kind_bit(&self) -> u8 {
        match self {
            Operand::Register(_) => K_REG,
            Operand::Immediate(_) => K_IMM,
            Operand::Memory(_) => K_MEM,
            Operand::Label(_) => K_LABEL,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Operand::Register(_) => "register",
            Operand::Immediate(_) => "immediate",
            Operand::Memory(_) => "memory",
            Operand::Label(_) => "label",
        }
    }

    pub fn as_register(&self) -> Option<PhysReg> {
        match self {
            Operand::Register(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_immediate(&self) -> Option<i64> {
        match self {
            Operand::Immediate(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_label(&self) -> Option<&str> {
        match self {
            Operand::Label(name) => Some(name),
            _ => None,
        }
    }
}

/// One target machine operation.
///
/// Immutable once appended to an [`super::InstructionBuffer`], except by
/// optimization passes that replace or remove entries under the buffer's
/// lock.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    /// Human-readable comment; also carries assembler directives for
    /// comment-only pseudo-instructions (e.g. `.quad .L_arm_3`).
    pub comment: Option<String>,
    /// Pseudo-instruction flag: no operation, only `comment` is emitted.
    pub is_directive: bool,
}

impl Instruction {
    /// Generic checked factory: validates operand count and kinds against the
    /// opcode's contract.
    pub fn with_operands(opcode: Opcode, operands: Vec<Operand>) -> CodegenResult<Self> {
        let contract = opcode.operand_contract();
        if operands.len() != contract.len() {
            return Err(CodegenError::InvalidInstruction {
                opcode: opcode.mnemonic(),
                reason: format!(
                    "expected {} operand(s), got {}",
                    contract.len(),
                    operands.len()
                ),
            });
        }
        for (i, (op, &mask)) in operands.iter().zip(contract).enumerate() {
            if op.kind_bit() & mask == 0 {
                return Err(CodegenError::InvalidInstruction {
                    opcode: opcode.mnemonic(),
                    reason: format!("operand {} may not be a {}", i, op.kind_name()),
                });
            }
        }
        Ok(Self { opcode, operands, comment: None, is_directive: false })
    }

    /// Re-run the constructor-time contract check. Used by
    /// `validate_instructions` to certify a finished buffer.
    pub fn validate(&self) -> CodegenResult<()> {
        if self.is_directive {
            return if self.comment.as_deref().is_some_and(|c| !c.is_empty()) {
                Ok(())
            } else {
                Err(CodegenError::InvalidInstruction {
                    opcode: "directive",
                    reason: "directive pseudo-instruction with empty text".into(),
                })
            };
        }
        Self::with_operands(self.opcode, self.operands.clone()).map(|_| ())
    }

    pub fn with_comment(mut self, text: impl Into<String>) -> Self {
        self.comment = Some(text.into());
        self
    }

    // ---- per-opcode factories ----

    pub fn mov(dst: Operand, src: Operand) -> CodegenResult<Self> {
        Self::with_operands(Opcode::Mov, vec![dst, src])
    }

    pub fn mov_reg(dst: PhysReg, src: PhysReg) -> CodegenResult<Self> {
        Self::mov(Operand::Register(dst), Operand::Register(src))
    }

    pub fn mov_imm(dst: PhysReg, value: i64) -> CodegenResult<Self> {
        Self::mov(Operand::Register(dst), Operand::Immediate(value))
    }

    /// Load from `[base + disp]`.
    pub fn load(dst: PhysReg, base: PhysReg, disp: i32) -> CodegenResult<Self> {
        Self::mov(Operand::Register(dst), Operand::mem(base, disp))
    }

    /// Store to `[base + disp]`.
    pub fn store(base: PhysReg, disp: i32, src: PhysReg) -> CodegenResult<Self> {
        Self::mov(Operand::mem(base, disp), Operand::Register(src))
    }

    pub fn add(dst: Operand, src: Operand) -> CodegenResult<Self> {
        Self::with_operands(Opcode::Add, vec![dst, src])
    }

    pub fn sub(dst: Operand, src: Operand) -> CodegenResult<Self> {
        Self::with_operands(Opcode::Sub, vec![dst, src])
    }

    pub fn imul(dst: Operand, src: Operand) -> CodegenResult<Self> {
        Self::with_operands(Opcode::Imul, vec![dst, src])
    }

    pub fn cmp(lhs: Operand, rhs: Operand) -> CodegenResult<Self> {
        Self::with_operands(Opcode::Cmp, vec![lhs, rhs])
    }

    pub fn test(lhs: PhysReg, rhs: PhysReg) -> CodegenResult<Self> {
        Self::with_operands(
            Opcode::Test,
            vec![Operand::Register(lhs), Operand::Register(rhs)],
        )
    }

    pub fn jump(target: impl Into<String>) -> CodegenResult<Self> {
        Self::with_operands(Opcode::Jmp, vec![Operand::Label(target.into())])
    }

    pub fn jump_cc(opcode: Opcode, target: impl Into<String>) -> CodegenResult<Self> {
        if !opcode.is_conditional_jump() {
            return Err(CodegenError::InvalidInstruction {
                opcode: opcode.mnemonic(),
                reason: "not a conditional jump".into(),
            });
        }
        Self::with_operands(opcode, vec![Operand::Label(target.into())])
    }

    /// Indirect jump through a register (jump-table dispatch).
    pub fn jump_indirect(target: Operand) -> CodegenResult<Self> {
        Self::with_operands(Opcode::Jmp, vec![target])
    }

    pub fn call(target: impl Into<String>) -> CodegenResult<Self> {
        Self::with_operands(Opcode::Call, vec![Operand::Label(target.into())])
    }

    pub fn ret() -> CodegenResult<Self> {
        Self::with_operands(Opcode::Ret, vec![])
    }

    pub fn push(src: Operand) -> CodegenResult<Self> {
        Self::with_operands(Opcode::Push, vec![src])
    }

    pub fn pop(dst: PhysReg) -> CodegenResult<Self> {
        Self::with_operands(Opcode::Pop, vec![Operand::Register(dst)])
    }

    pub fn inc(reg: PhysReg) -> CodegenResult<Self> {
        Self::with_operands(Opcode::Inc, vec![Operand::Register(reg)])
    }

    pub fn lea(dst: PhysReg, src: Operand) -> CodegenResult<Self> {
        Self::with_operands(Opcode::Lea, vec![Operand::Register(dst), src])
    }

    pub fn set_cc(opcode: Opcode, dst: PhysReg) -> CodegenResult<Self> {
        Self::with_operands(opcode, vec![Operand::Register(dst)])
    }

    /// Comment pseudo-instruction: no operation, only assembly text.
    pub fn comment(text: impl Into<String>) -> CodegenResult<Self> {
        let text = text.into();
        if text.is_empty() {
            return Err(CodegenError::InvalidInstruction {
                opcode: "directive",
                reason: "comment pseudo-instruction requires non-empty text".into(),
            });
        }
        Ok(Self {
            opcode: Opcode::Mov,
            operands: Vec::new(),
            comment: Some(text),
            is_directive: true,
        })
    }

    /// Assembler directive carried as a pseudo-instruction (`.globl`,
    /// `.quad`, section switches).
    pub fn directive(text: impl Into<String>) -> CodegenResult<Self> {
        Self::comment(text)
    }

    // ---- queries ----

    pub fn is_control_transfer(&self) -> bool {
        !self.is_directive && self.opcode.is_control_transfer()
    }

    /// Branch target label, for jumps and calls with a label operand.
    pub fn branch_target(&self) -> Option<&str> {
        if self.is_directive {
            return None;
        }
        match self.opcode {
            Opcode::Jmp
            | Opcode::Je
            | Opcode::Jne
            | Opcode::Jl
            | Opcode::Jle
            | Opcode::Jg
            | Opcode::Jge
            | Opcode::Jae => self.operands.first().and_then(Operand::as_label),
            _ => None,
        }
    }

    /// Whether removing this instruction could change observable behavior
    /// beyond its register destination.
    pub fn has_side_effects(&self) -> bool {
        if self.is_directive {
            return true;
        }
        match self.opcode {
            Opcode::Call | Opcode::Ret | Opcode::Push | Opcode::Pop | Opcode::Idiv => true,
            op if op.is_control_transfer() => true,
            // A store through a memory destination is observable.
            _ => matches!(self.operands.first(), Some(Operand::Memory(_))),
        }
    }

    /// Register defined by this instruction, if any.
    pub fn def_register(&self) -> Option<PhysReg> {
        if self.is_directive {
            return None;
        }
        use Opcode::*;
        match self.opcode {
            Mov | Movsd | Movzx | Lea | Add | Sub | Imul | And | Or | Xor | Shl | Shr
            | Inc | Neg | Not | Fadd | Fsub | Fmul | Fdiv | Sete | Setne | Setl
            | Setle | Setg | Setge | Pop => self.operands.first().and_then(Operand::as_register),
            _ => None,
        }
    }

    /// Registers read by this instruction, including memory-operand bases.
    pub fn use_registers(&self) -> Vec<PhysReg> {
        if self.is_directive {
            return Vec::new();
        }
        let mut uses = Vec::new();
        for (i, op) in self.operands.iter().enumerate() {
            match op {
                Operand::Memory(mem) => {
                    uses.push(mem.base);
                    if let Some(idx) = mem.index {
                        uses.push(idx);
                    }
                }
                Operand::Register(r) => {
                    // Operand 0 is the write slot for defining opcodes; it
                    // still counts as a use for read-modify-write ALU ops.
                    let is_dest = i == 0 && self.def_register().is_some();
                    if !is_dest || self.opcode.reads_destination() {
                        uses.push(*r);
                    }
                }
                _ => {}
            }
        }
        uses
    }

    /// Rough encoded-size estimate in bytes, for the buffer's running total.
    pub fn estimated_size(&self) -> usize {
        if self.is_directive {
            return 0;
        }
        use Opcode::*;
        let base = match self.opcode {
            Ret | Cqo => 1,
            Push | Pop | Inc | Neg | Not => 2,
            Jmp | Je | Jne | Jl | Jle | Jg | Jge | Jae | Call => 5,
            Sete | Setne | Setl | Setle | Setg | Setge => 3,
            Movsd | Fadd | Fsub | Fmul | Fdiv => 4,
            _ => 3,
        };
        let extra: usize = self
            .operands
            .iter()
            .map(|op| match op {
                Operand::Immediate(v) if *v as i32 as i64 != *v => 8,
                Operand::Immediate(_) => 4,
                Operand::Memory(_) => 2,
                _ => 0,
            })
            .sum();
        base + extra
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::x86;

    #[test]
    fn test_ret_rejects_operands() {
        let err = Instruction::with_operands(
            Opcode::Ret,
            vec![Operand::Register(x86::RAX)],
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_cmp_arity() {
        assert!(Instruction::with_operands(
            Opcode::Cmp,
            vec![Operand::Register(x86::RAX)]
        )
        .is_err());
        assert!(Instruction::cmp(
            Operand::Register(x86::RAX),
            Operand::Register(x86::RCX)
        )
        .is_ok());
    }

    #[test]
    fn test_operand_kind_contract() {
        // Immediate destination is never valid.
        assert!(Instruction::mov(Operand::Immediate(1), Operand::Immediate(2)).is_err());
        // Conditional jumps take labels only.
        assert!(Instruction::with_operands(
            Opcode::Je,
            vec![Operand::Register(x86::RAX)]
        )
        .is_err());
        // Indirect unconditional jump through a register is allowed.
        assert!(Instruction::jump_indirect(Operand::Register(x86::RAX)).is_ok());
    }

    #[test]
    fn test_comment_requires_text() {
        assert!(Instruction::comment("").is_err());
        let c = Instruction::comment(".globl add").unwrap();
        assert!(c.is_directive);
        assert_eq!(c.operands.len(), 0);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_def_use_extraction() {
        let add = Instruction::add(
            Operand::Register(x86::RAX),
            Operand::Register(x86::RCX),
        )
        .unwrap();
        assert_eq!(add.def_register(), Some(x86::RAX));
        let uses = add.use_registers();
        assert!(uses.contains(&x86::RAX)); // two-operand ALU reads its destination
        assert!(uses.contains(&x86::RCX));

        let mov = Instruction::mov_imm(x86::RAX, 7).unwrap();
        assert_eq!(mov.def_register(), Some(x86::RAX));
        assert!(mov.use_registers().is_empty());

        let store = Instruction::store(x86::RBP, -8, x86::RAX).unwrap();
        assert_eq!(store.def_register(), None);
        let uses = store.use_registers();
        assert!(uses.contains(&x86::RBP));
        assert!(uses.contains(&x86::RAX));
        assert!(store.has_side_effects());
    }

    #[test]
    fn test_branch_target() {
        let j = Instruction::jump(".L_exit_1").unwrap();
        assert_eq!(j.branch_target(), Some(".L_exit_1"));
        let call = Instruction::call("foo").unwrap();
        assert_eq!(call.branch_target(), None);
    }
}
