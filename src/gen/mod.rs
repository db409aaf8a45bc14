//! Code generation driver.
//!
//! One [`CodeGenerator`] lowers typed-AST functions into an instruction
//! buffer, consulting the register allocator and label manager directly so
//! straight-line code needs no separate allocation pass. The generator is
//! scoped to a compilation unit; multiple units may run concurrently, each
//! with its own generator, sharing a [`CompilationSession`].
//!
//! Function shape: prologue (frame setup with a backpatched allocation),
//! parameter homing, body statements, then a single epilogue at the exit
//! label — `return` lowers to a jump there once the return register is
//! loaded, so the callee-saved restore sequence is emitted exactly once,
//! after the clobber set is fully known.

pub mod ast;
pub mod expr;
pub mod frame;
pub mod pattern;
pub mod stmt;

use crate::core::error::{CodegenError, CodegenResult};
use crate::core::session::{CompilationSession, StatisticsSnapshot};
use crate::inst::{Instruction, InstructionBuffer, Opcode, Operand};
use crate::labels::{LabelKind, LabelManager};
use crate::opt::{OptLevel, Optimizer};
use crate::regalloc::RegisterAllocator;
use crate::target::{CallingConvention, PhysReg, TargetAbi, TargetArchitecture};
use ast::{Function, TypeInfo};
use frame::FunctionFrame;
use hashbrown::HashMap;
use std::sync::atomic::Ordering;

/// Loop labels the body statements jump to for `break`/`continue`.
#[derive(Debug, Clone)]
pub(crate) struct LoopContext {
    pub exit_label: String,
    pub continue_label: String,
}

/// A named stack slot in the current function.
#[derive(Debug, Clone)]
pub(crate) struct LocalVariable {
    pub offset: i32,
    pub ty: TypeInfo,
}

/// Generator configuration knobs.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Emit comment pseudo-instructions into the buffer.
    pub emit_comments: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self { emit_comments: false }
    }
}

/// Walks the typed AST and emits instructions for one compilation unit.
pub struct CodeGenerator<'s, 'arena> {
    pub(crate) abi: TargetAbi,
    session: &'s CompilationSession<'arena>,
    pub buffer: InstructionBuffer,
    pub labels: LabelManager,
    pub(crate) regs: RegisterAllocator,
    pub optimizer: Optimizer,
    pub config: GeneratorConfig,

    // Per-function state, reset by `generate_function`.
    pub(crate) frame: FunctionFrame<'arena>,
    pub(crate) locals: HashMap<String, LocalVariable>,
    pub(crate) loop_stack: Vec<LoopContext>,
    pub(crate) current_exit_label: Option<String>,
    pub(crate) current_return_type: TypeInfo,
    prologue_patch_index: Option<usize>,
}

impl<'s, 'arena> CodeGenerator<'s, 'arena> {
    pub fn new(
        arch: TargetArchitecture,
        convention: CallingConvention,
        opt_level: OptLevel,
        session: &'s CompilationSession<'arena>,
    ) -> CodegenResult<Self> {
        let abi = TargetAbi::new(arch, convention)?;
        let regs = RegisterAllocator::new(&abi);
        Ok(Self {
            abi,
            session,
            buffer: InstructionBuffer::new(),
            labels: LabelManager::new(),
            regs,
            optimizer: Optimizer::new(opt_level),
            config: GeneratorConfig::default(),
            frame: FunctionFrame::new(session.arena()),
            locals: HashMap::new(),
            loop_stack: Vec::new(),
            current_exit_label: None,
            current_return_type: TypeInfo::void(),
            prologue_patch_index: None,
        })
    }

    pub fn abi(&self) -> &TargetAbi {
        &self.abi
    }

    pub fn session(&self) -> &'s CompilationSession<'arena> {
        self.session
    }

    /// Append an instruction to the unit's buffer.
    pub(crate) fn emit(&self, inst: Instruction) -> usize {
        self.buffer.append(inst)
    }

    /// Append a comment pseudo-instruction if comments are enabled.
    pub(crate) fn emit_comment(&self, text: &str) -> CodegenResult<()> {
        if self.config.emit_comments {
            self.emit(Instruction::comment(format!("# {text}"))?);
        }
        Ok(())
    }

    pub(crate) fn emit_jump(&self, target: &str) -> CodegenResult<()> {
        self.emit(Instruction::jump(target)?);
        Ok(())
    }

    /// Define `label` at the current end of the buffer.
    pub(crate) fn place_label(&self, id: crate::labels::LabelId) -> CodegenResult<()> {
        self.labels.define_label(id, self.buffer.len())
    }

    /// TEST + JE: jump to `target` when `cond_reg` is zero.
    pub(crate) fn emit_jump_if_false(
        &self,
        cond_reg: PhysReg,
        target: &str,
    ) -> CodegenResult<()> {
        self.emit(Instruction::test(cond_reg, cond_reg)?);
        self.emit(Instruction::jump_cc(Opcode::Je, target)?);
        Ok(())
    }

    pub(crate) fn allocate_reg(&mut self) -> CodegenResult<PhysReg> {
        self.allocate_reg_for(false)
    }

    /// Allocate from the ABI partition, spill-free; exhaustion becomes a
    /// reportable error rather than a crash.
    pub(crate) fn allocate_reg_for(&mut self, float: bool) -> CodegenResult<PhysReg> {
        let reg = if float {
            self.regs.allocate_float()
        } else {
            self.regs.allocate(true)
        };
        let reg = reg.ok_or_else(|| CodegenError::RegisterAllocationFailed {
            reason: "no free physical register; expression too complex".into(),
        })?;
        self.session.stats().observe_pressure(self.regs.current_pressure());
        Ok(reg)
    }

    pub(crate) fn free_reg(&mut self, reg: PhysReg) {
        self.regs.free(reg);
    }

    /// Bind `name` to a fresh stack slot in the current frame.
    pub(crate) fn create_local(&mut self, name: &str, ty: TypeInfo) -> i32 {
        let offset = self.frame.allocate_local(8);
        self.locals
            .insert(name.to_string(), LocalVariable { offset, ty });
        offset
    }

    pub(crate) fn lookup_local(&self, name: &str) -> CodegenResult<LocalVariable> {
        self.locals.get(name).cloned().ok_or_else(|| {
            CodegenError::UnsupportedOperation {
                what: format!("reference to unknown local `{name}`"),
            }
        })
    }

    /// Run `body` with a loop context pushed; the context is popped on every
    /// exit path, including errors.
    pub(crate) fn with_loop_context<R>(
        &mut self,
        ctx: LoopContext,
        body: impl FnOnce(&mut Self) -> CodegenResult<R>,
    ) -> CodegenResult<R> {
        self.loop_stack.push(ctx);
        let result = body(self);
        self.loop_stack.pop();
        result
    }

    /// Generate every function of a program into this unit's buffer.
    pub fn generate_program(&mut self, functions: &[Function]) -> CodegenResult<()> {
        for func in functions {
            self.generate_function(func)?;
        }
        Ok(())
    }

    /// Lower one function: prologue, homed parameters, body, epilogue.
    pub fn generate_function(&mut self, func: &Function) -> CodegenResult<()> {
        log::debug!("generating function `{}`", func.name);
        let instructions_before = self.buffer.total_generated();
        let bytes_before = self.buffer.estimated_bytes();

        // Reset per-function state.
        self.frame = FunctionFrame::new(self.session.arena());
        self.locals.clear();
        self.loop_stack.clear();
        self.regs.reset();
        self.current_return_type = func.return_type.clone();

        let fp = self.abi.frame_pointer;
        let sp = self.abi.stack_pointer;

        self.emit(Instruction::directive(format!(".globl {}", func.name))?);
        let entry = self.labels.create_named(LabelKind::FunctionEntry, &func.name)?;
        self.place_label(entry)?;

        // Prologue; the frame allocation is patched once the body is done.
        self.emit(Instruction::push(Operand::Register(fp))?);
        self.emit(Instruction::mov_reg(fp, sp)?);
        let patch = self.emit(Instruction::sub(
            Operand::Register(sp),
            Operand::Immediate(0),
        )?);
        self.prologue_patch_index = Some(patch);

        let exit = self.labels.create_label(LabelKind::BranchTarget, ".L_epilogue");
        self.current_exit_label = Some(self.labels.name(exit));

        self.home_parameters(func)?;

        for stmt in &func.body {
            self.generate_statement(stmt)?;
        }

        // Single exit: every `return` jumped here.
        self.place_label(exit)?;
        self.emit_epilogue()?;
        self.patch_prologue()?;

        self.current_exit_label = None;
        self.prologue_patch_index = None;

        let stats = self.session.stats();
        stats.record_function();
        stats.record_instructions(
            self.buffer.total_generated() - instructions_before,
            self.buffer.estimated_bytes() - bytes_before,
        );
        stats.observe_pressure(self.regs.max_pressure());
        Ok(())
    }

    /// Move incoming arguments to their stack homes. Register arguments get
    /// fresh slots; stack arguments are addressed where the caller left
    /// them, above the saved frame pointer.
    fn home_parameters(&mut self, func: &Function) -> CodegenResult<()> {
        let fp = self.abi.frame_pointer;
        let mut int_idx = 0usize;
        let mut float_idx = 0usize;
        let mut stack_idx = 0usize;

        for param in &func.params {
            if param.ty.is_float() {
                if float_idx < self.abi.float_arg_regs.len() {
                    let src = self.abi.float_arg_regs[float_idx];
                    float_idx += 1;
                    let offset = self.create_local(&param.name, param.ty.clone());
                    self.emit(Instruction::with_operands(
                        Opcode::Movsd,
                        vec![Operand::mem(fp, offset), Operand::Register(src)],
                    )?);
                } else {
                    let offset = 16 + 8 * stack_idx as i32;
                    stack_idx += 1;
                    self.locals.insert(
                        param.name.clone(),
                        LocalVariable { offset, ty: param.ty.clone() },
                    );
                }
            } else if int_idx < self.abi.int_arg_regs.len() {
                let src = self.abi.int_arg_regs[int_idx];
                int_idx += 1;
                let offset = self.create_local(&param.name, param.ty.clone());
                self.emit(Instruction::store(fp, offset, src)?);
            } else {
                let offset = 16 + 8 * stack_idx as i32;
                stack_idx += 1;
                self.locals.insert(
                    param.name.clone(),
                    LocalVariable { offset, ty: param.ty.clone() },
                );
            }
        }
        Ok(())
    }

    /// Restore clobbered callee-saved registers, tear the frame down, `ret`.
    fn emit_epilogue(&mut self) -> CodegenResult<()> {
        let fp = self.abi.frame_pointer;
        let sp = self.abi.stack_pointer;
        let clobbered: Vec<PhysReg> = self.regs.clobbered_callee_saved().iter().collect();
        for &reg in clobbered.iter().rev() {
            self.emit(Instruction::pop(reg)?);
        }
        self.emit(Instruction::mov_reg(sp, fp)?);
        self.emit(Instruction::pop(fp)?);
        self.emit(Instruction::ret()?);
        Ok(())
    }

    /// Backpatch the prologue: fix the frame allocation and insert saves for
    /// the callee-saved registers the body actually clobbered.
    fn patch_prologue(&mut self) -> CodegenResult<()> {
        let patch = self
            .prologue_patch_index
            .expect("patch_prologue called outside a function");
        let sp = self.abi.stack_pointer;

        let clobbered: Vec<PhysReg> = self.regs.clobbered_callee_saved().iter().collect();
        for &reg in &clobbered {
            self.frame.add_saved_register(reg);
        }

        let frame_size = self.frame.frame_size();
        self.buffer.replace(
            patch,
            Instruction::sub(
                Operand::Register(sp),
                Operand::Immediate(frame_size as i64),
            )?,
        );

        if !clobbered.is_empty() {
            let insert_at = patch + 1;
            self.buffer.with_instructions_mut(|insts| -> CodegenResult<()> {
                for (i, &reg) in clobbered.iter().enumerate() {
                    insts.insert(insert_at + i, Instruction::push(Operand::Register(reg))?);
                }
                Ok(())
            })?;
            let shift = clobbered.len();
            self.labels.remap_definitions(|at| {
                if at >= insert_at {
                    at + shift
                } else {
                    at
                }
            });
        }
        Ok(())
    }

    /// Run the optimizer pipeline over the finished buffer.
    pub fn optimize(&self) -> CodegenResult<bool> {
        let at_exits = [self.abi.int_return_reg, self.abi.float_return_reg];
        let pinned = [self.abi.stack_pointer, self.abi.frame_pointer];
        let roots = crate::opt::LiveRoots { at_exits: &at_exits, pinned: &pinned };
        let changed = self.optimizer.run(&self.buffer, &self.labels, roots)?;
        let stats = self.session.stats();
        stats.record_eliminated(
            self.optimizer.stats.instructions_eliminated.load(Ordering::Relaxed),
        );
        stats.record_folded(
            self.optimizer.stats.constants_folded.load(Ordering::Relaxed),
        );
        Ok(changed)
    }

    /// Certify the finished sequence: every instruction still satisfies its
    /// opcode contract, and every jump target is defined.
    pub fn validate_instructions(&self) -> CodegenResult<()> {
        self.buffer.with_instructions(|insts| {
            for inst in insts {
                inst.validate()?;
                if let Some(target) = inst.branch_target() {
                    if self.labels.definition_of(target).is_none() {
                        return Err(CodegenError::LabelNotFound {
                            name: target.to_string(),
                        });
                    }
                }
            }
            Ok(())
        })
    }

    /// Merged statistics for reporting: session counters plus this unit's
    /// allocator and optimizer counters.
    pub fn statistics(&self) -> StatisticsSnapshot {
        let mut snap = self.session.stats().snapshot();
        snap.spills += self.regs.spill_count();
        snap.max_register_pressure = snap.max_register_pressure.max(self.regs.max_pressure());
        snap.optimizations_applied += self
            .optimizer
            .stats
            .optimizations_applied
            .load(Ordering::Relaxed);
        snap
    }
}
