//! Assembly emission.
//!
//! Renders an instruction-buffer snapshot into target-specific text: x86-64
//! in AT&T (default) or Intel syntax, AArch64 mnemonics, or WebAssembly
//! text. Labels print ahead of the instruction they are defined at;
//! directive/comment pseudo-instructions are emitted verbatim. Emission is
//! deterministic: the same buffer renders byte-identically every time.
//!
//! Writer failure maps to [`CodegenError::OutputExhausted`], which is
//! distinct from the empty-buffer case (that renders successfully to an
//! empty body).

use crate::core::error::{CodegenError, CodegenResult};
use crate::inst::{Instruction, InstructionBuffer, MemOperand, Opcode, Operand};
use crate::labels::LabelManager;
use crate::target::{byte_register_name, register_name, PhysReg, TargetArchitecture};
use hashbrown::HashMap;
use std::fmt::Write as _;

/// x86-64 dialect selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum X86Syntax {
    #[default]
    Att,
    Intel,
}

/// Renders instruction buffers for one architecture/dialect pair.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyEmitter {
    arch: TargetArchitecture,
    syntax: X86Syntax,
}

impl AssemblyEmitter {
    pub fn new(arch: TargetArchitecture) -> Self {
        Self { arch, syntax: X86Syntax::default() }
    }

    pub fn with_syntax(arch: TargetArchitecture, syntax: X86Syntax) -> Self {
        Self { arch, syntax }
    }

    /// Render the buffer to a fresh string.
    pub fn emit(
        &self,
        buffer: &InstructionBuffer,
        labels: &LabelManager,
    ) -> CodegenResult<String> {
        let mut out = String::new();
        self.emit_to(buffer, labels, &mut out)?;
        Ok(out)
    }

    /// Render into a caller-supplied writer. A writer error is reported as
    /// output exhaustion, never swallowed as truncated text.
    pub fn emit_to<W: std::fmt::Write>(
        &self,
        buffer: &InstructionBuffer,
        labels: &LabelManager,
        out: &mut W,
    ) -> CodegenResult<()> {
        let snapshot = buffer.snapshot();
        let mut labels_at: HashMap<usize, Vec<String>> = HashMap::new();
        for (name, index) in labels.definitions() {
            labels_at.entry(index).or_default().push(name);
        }

        let exhausted = |_: std::fmt::Error| CodegenError::OutputExhausted;

        for (idx, inst) in snapshot.iter().enumerate() {
            if let Some(names) = labels_at.get(&idx) {
                for name in names {
                    writeln!(out, "{name}:").map_err(exhausted)?;
                }
            }
            writeln!(out, "{}", self.render(inst)).map_err(exhausted)?;
        }
        // Labels defined past the last instruction still print.
        if let Some(names) = labels_at.get(&snapshot.len()) {
            for name in names {
                writeln!(out, "{name}:").map_err(exhausted)?;
            }
        }
        Ok(())
    }

    /// Render the buffer and write it to `path`.
    pub fn emit_to_file(
        &self,
        buffer: &InstructionBuffer,
        labels: &LabelManager,
        path: &std::path::Path,
    ) -> CodegenResult<()> {
        let text = self.emit(buffer, labels)?;
        std::fs::write(path, text).map_err(|e| {
            log::error!("failed to write assembly to {}: {e}", path.display());
            CodegenError::OutputExhausted
        })
    }

    fn render(&self, inst: &Instruction) -> String {
        if inst.is_directive {
            let text = inst.comment.as_deref().unwrap_or_default();
            return if text.starts_with('.') {
                text.to_string()
            } else {
                format!("    {text}")
            };
        }
        let body = match self.arch {
            TargetArchitecture::X86_64 => self.render_x86(inst),
            TargetArchitecture::Aarch64 => self.render_aarch64(inst),
            TargetArchitecture::Wasm32 => self.render_wasm(inst),
        };
        match &inst.comment {
            Some(c) => format!("    {body:<40}# {c}"),
            None => format!("    {body}"),
        }
    }

    // ---- x86-64 ----

    fn x86_reg(&self, reg: PhysReg) -> String {
        let name = register_name(TargetArchitecture::X86_64, reg);
        match self.syntax {
            X86Syntax::Att => format!("%{name}"),
            X86Syntax::Intel => name,
        }
    }

    fn x86_byte_reg(&self, reg: PhysReg) -> String {
        let name = byte_register_name(TargetArchitecture::X86_64, reg);
        match self.syntax {
            X86Syntax::Att => format!("%{name}"),
            X86Syntax::Intel => name,
        }
    }

    fn x86_mem(&self, mem: &MemOperand) -> String {
        match self.syntax {
            X86Syntax::Att => {
                let base = self.x86_reg(mem.base);
                match mem.index {
                    Some(index) => format!(
                        "{}({base},{},{})",
                        fmt_disp(mem.disp),
                        self.x86_reg(index),
                        mem.scale
                    ),
                    None => format!("{}({base})", fmt_disp(mem.disp)),
                }
            }
            X86Syntax::Intel => {
                let base = self.x86_reg(mem.base);
                let mut s = format!("[{base}");
                if let Some(index) = mem.index {
                    let _ = write!(s, "+{}*{}", self.x86_reg(index), mem.scale);
                }
                if mem.disp != 0 {
                    let _ = write!(s, "{:+}", mem.disp);
                }
                s.push(']');
                s
            }
        }
    }

    fn x86_operand(&self, op: &Operand) -> String {
        match op {
            Operand::Register(r) => self.x86_reg(*r),
            Operand::Immediate(v) => match self.syntax {
                X86Syntax::Att => format!("${v}"),
                X86Syntax::Intel => v.to_string(),
            },
            Operand::Memory(mem) => self.x86_mem(mem),
            Operand::Label(name) => name.clone(),
        }
    }

    fn render_x86(&self, inst: &Instruction) -> String {
        use Opcode::*;
        let mnemonic: String = match (self.syntax, inst.opcode) {
            // AT&T carries the operand width in the mnemonic.
            (X86Syntax::Att, Mov) => "movq".into(),
            (X86Syntax::Att, Add) => "addq".into(),
            (X86Syntax::Att, Sub) => "subq".into(),
            (X86Syntax::Att, Imul) => "imulq".into(),
            (X86Syntax::Att, And) => "andq".into(),
            (X86Syntax::Att, Or) => "orq".into(),
            (X86Syntax::Att, Xor) => "xorq".into(),
            (X86Syntax::Att, Shl) => "shlq".into(),
            (X86Syntax::Att, Shr) => "shrq".into(),
            (X86Syntax::Att, Cmp) => "cmpq".into(),
            (X86Syntax::Att, Test) => "testq".into(),
            (X86Syntax::Att, Lea) => "leaq".into(),
            (X86Syntax::Att, Inc) => "incq".into(),
            (X86Syntax::Att, Neg) => "negq".into(),
            (X86Syntax::Att, Not) => "notq".into(),
            (X86Syntax::Att, Push) => "pushq".into(),
            (X86Syntax::Att, Pop) => "popq".into(),
            (X86Syntax::Att, Idiv) => "idivq".into(),
            (X86Syntax::Att, Movzx) => "movzbq".into(),
            (X86Syntax::Intel, Movzx) => "movzx".into(),
            (_, op) => op.mnemonic().into(),
        };

        match inst.opcode {
            Ret | Cqo => mnemonic,
            Sete | Setne | Setl | Setle | Setg | Setge => {
                let reg = inst.operands[0]
                    .as_register()
                    .expect("setcc destination is a register");
                format!("{mnemonic} {}", self.x86_byte_reg(reg))
            }
            Movzx => {
                let dst = inst.operands[0].as_register().expect("movzx dest");
                let src = match &inst.operands[1] {
                    Operand::Register(r) => self.x86_byte_reg(*r),
                    other => self.x86_operand(other),
                };
                match self.syntax {
                    X86Syntax::Att => format!("{mnemonic} {src}, {}", self.x86_reg(dst)),
                    X86Syntax::Intel => {
                        format!("{mnemonic} {}, {src}", self.x86_reg(dst))
                    }
                }
            }
            Jmp => match &inst.operands[0] {
                Operand::Label(name) => format!("{mnemonic} {name}"),
                // Indirect jump (jump-table dispatch).
                other => match self.syntax {
                    X86Syntax::Att => format!("{mnemonic} *{}", self.x86_operand(other)),
                    X86Syntax::Intel => format!("{mnemonic} {}", self.x86_operand(other)),
                },
            },
            _ => {
                let rendered: Vec<String> =
                    inst.operands.iter().map(|op| self.x86_operand(op)).collect();
                match (self.syntax, rendered.as_slice()) {
                    (_, []) => mnemonic,
                    (X86Syntax::Att, ops) => {
                        // AT&T reverses to source-first.
                        let mut reversed: Vec<&str> =
                            ops.iter().map(String::as_str).collect();
                        reversed.reverse();
                        format!("{mnemonic} {}", reversed.join(", "))
                    }
                    (X86Syntax::Intel, ops) => {
                        format!("{mnemonic} {}", ops.join(", "))
                    }
                }
            }
        }
    }

    // ---- AArch64 ----

    fn a64_reg(&self, reg: PhysReg) -> String {
        register_name(TargetArchitecture::Aarch64, reg)
    }

    fn a64_operand(&self, op: &Operand) -> String {
        match op {
            Operand::Register(r) => self.a64_reg(*r),
            Operand::Immediate(v) => format!("#{v}"),
            Operand::Memory(mem) => match mem.index {
                Some(index) => format!(
                    "[{}, {}, lsl #{}]",
                    self.a64_reg(mem.base),
                    self.a64_reg(index),
                    mem.scale.trailing_zeros()
                ),
                None => format!("[{}, #{}]", self.a64_reg(mem.base), mem.disp),
            },
            Operand::Label(name) => name.clone(),
        }
    }

    fn render_aarch64(&self, inst: &Instruction) -> String {
        use Opcode::*;
        let ops = &inst.operands;
        match inst.opcode {
            Mov | Movsd => match (&ops[0], &ops[1]) {
                (Operand::Register(d), Operand::Memory(_)) => {
                    format!("ldr {}, {}", self.a64_reg(*d), self.a64_operand(&ops[1]))
                }
                (Operand::Memory(_), Operand::Register(s)) => {
                    format!("str {}, {}", self.a64_reg(*s), self.a64_operand(&ops[0]))
                }
                _ => format!(
                    "mov {}, {}",
                    self.a64_operand(&ops[0]),
                    self.a64_operand(&ops[1])
                ),
            },
            Add | Sub | Imul | And | Or | Xor | Shl | Shr | Fadd | Fsub | Fmul | Fdiv => {
                let name = match inst.opcode {
                    Add => "add",
                    Sub => "sub",
                    Imul => "mul",
                    And => "and",
                    Or => "orr",
                    Xor => "eor",
                    Shl => "lsl",
                    Shr => "lsr",
                    Fadd => "fadd",
                    Fsub => "fsub",
                    Fmul => "fmul",
                    _ => "fdiv",
                };
                let dst = self.a64_operand(&ops[0]);
                format!("{name} {dst}, {dst}, {}", self.a64_operand(&ops[1]))
            }
            Cmp => format!(
                "cmp {}, {}",
                self.a64_operand(&ops[0]),
                self.a64_operand(&ops[1])
            ),
            Test => format!(
                "tst {}, {}",
                self.a64_operand(&ops[0]),
                self.a64_operand(&ops[1])
            ),
            Sete | Setne | Setl | Setle | Setg | Setge => {
                let cond = match inst.opcode {
                    Sete => "eq",
                    Setne => "ne",
                    Setl => "lt",
                    Setle => "le",
                    Setg => "gt",
                    _ => "ge",
                };
                format!("cset {}, {cond}", self.a64_operand(&ops[0]))
            }
            Jmp => format!("b {}", self.a64_operand(&ops[0])),
            Je => format!("b.eq {}", self.a64_operand(&ops[0])),
            Jne => format!("b.ne {}", self.a64_operand(&ops[0])),
            Jl => format!("b.lt {}", self.a64_operand(&ops[0])),
            Jle => format!("b.le {}", self.a64_operand(&ops[0])),
            Jg => format!("b.gt {}", self.a64_operand(&ops[0])),
            Jge => format!("b.ge {}", self.a64_operand(&ops[0])),
            Jae => format!("b.hs {}", self.a64_operand(&ops[0])),
            Call => format!("bl {}", self.a64_operand(&ops[0])),
            Ret => "ret".to_string(),
            Push => format!("str {}, [sp, #-16]!", self.a64_operand(&ops[0])),
            Pop => format!("ldr {}, [sp], #16", self.a64_operand(&ops[0])),
            Neg => {
                let dst = self.a64_operand(&ops[0]);
                format!("neg {dst}, {dst}")
            }
            Not => {
                let dst = self.a64_operand(&ops[0]);
                format!("mvn {dst}, {dst}")
            }
            Inc => {
                let dst = self.a64_operand(&ops[0]);
                format!("add {dst}, {dst}, #1")
            }
            Movzx => {
                let dst = self.a64_operand(&ops[0]);
                format!("uxtb {dst}, {dst}")
            }
            Lea => format!(
                "adr {}, {}",
                self.a64_operand(&ops[0]),
                self.a64_operand(&ops[1])
            ),
            // No direct AArch64 counterpart; kept visible, not dropped.
            Cqo => "// cqo (implicit in sdiv)".to_string(),
            Idiv => format!("// idiv {}", self.a64_operand(&ops[0])),
        }
    }

    // ---- WebAssembly text ----

    fn wasm_local(&self, reg: PhysReg) -> String {
        register_name(TargetArchitecture::Wasm32, reg)
    }

    fn render_wasm(&self, inst: &Instruction) -> String {
        use Opcode::*;
        let ops = &inst.operands;
        let get = |op: &Operand| -> String {
            match op {
                Operand::Register(r) => format!("(local.get {})", self.wasm_local(*r)),
                Operand::Immediate(v) => format!("(i64.const {v})"),
                Operand::Memory(mem) => format!(
                    "(i64.load (i64.add (local.get {}) (i64.const {})))",
                    self.wasm_local(mem.base),
                    mem.disp
                ),
                Operand::Label(name) => name.clone(),
            }
        };
        match inst.opcode {
            Mov | Movsd => match (&ops[0], &ops[1]) {
                (Operand::Register(d), src) => {
                    format!("(local.set {} {})", self.wasm_local(*d), get(src))
                }
                (Operand::Memory(mem), src) => format!(
                    "(i64.store (i64.add (local.get {}) (i64.const {})) {})",
                    self.wasm_local(mem.base),
                    mem.disp,
                    get(src)
                ),
                _ => format!(";; {}", inst.opcode),
            },
            Add | Sub | Imul | And | Or | Xor | Shl | Shr => {
                let name = match inst.opcode {
                    Add => "i64.add",
                    Sub => "i64.sub",
                    Imul => "i64.mul",
                    And => "i64.and",
                    Or => "i64.or",
                    Xor => "i64.xor",
                    Shl => "i64.shl",
                    _ => "i64.shr_u",
                };
                if let Operand::Register(d) = &ops[0] {
                    format!(
                        "(local.set {} ({name} {} {}))",
                        self.wasm_local(*d),
                        get(&ops[0]),
                        get(&ops[1])
                    )
                } else {
                    format!(";; {}", inst.opcode)
                }
            }
            Jmp => format!("(br {})", get(&ops[0])),
            Je | Jne | Jl | Jle | Jg | Jge | Jae => {
                format!("(br_if {}) ;; {}", get(&ops[0]), inst.opcode)
            }
            Call => format!("(call ${})", get(&ops[0])),
            Ret => "(return)".to_string(),
            _ => format!(";; {}", inst.opcode),
        }
    }
}

/// AT&T displacement prefix: zero renders empty, like assemblers print it.
fn fmt_disp(disp: i32) -> String {
    if disp == 0 {
        String::new()
    } else {
        disp.to_string()
    }
}
