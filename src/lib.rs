//! cinder — native code-generation backend core.
//!
//! The backend turns a typed, semantically-analyzed AST into validated
//! target-specific assembly. It covers the hard middle of a compiler: a
//! register allocator with spilling, control-flow and data-flow analysis,
//! an optimization pipeline, and ABI-correct instruction emission.
//!
//! # Primary Usage
//!
//! ```
//! use bumpalo::Bump;
//! use cinder::core::CompilationSession;
//! use cinder::emit::AssemblyEmitter;
//! use cinder::gen::ast::{Function, TypeInfo, PrimitiveKind};
//! use cinder::gen::CodeGenerator;
//! use cinder::opt::OptLevel;
//! use cinder::target::{CallingConvention, TargetArchitecture};
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let mut generator = CodeGenerator::new(
//!     TargetArchitecture::X86_64,
//!     CallingConvention::SystemV,
//!     OptLevel::Standard,
//!     &session,
//! ).unwrap();
//!
//! let func = Function::new("empty", TypeInfo::primitive(PrimitiveKind::Void));
//! generator.generate_function(&func).unwrap();
//! generator.optimize().unwrap();
//! generator.validate_instructions().unwrap();
//!
//! let emitter = AssemblyEmitter::new(TargetArchitecture::X86_64);
//! let asm = emitter.emit(&generator.buffer, &generator.labels).unwrap();
//! assert!(asm.contains("empty:"));
//! ```
//!
//! # Architecture
//!
//! - [`gen`] - AST-driven code generation (statements, expressions, patterns)
//! - [`inst`] - Instruction model and the thread-safe instruction buffer
//! - [`regalloc`] - Fast linear allocation plus graph-coloring allocation
//! - [`labels`] - Unique label creation and definition tracking
//! - [`cfg`] - Basic-block partitioning, dominators, loop detection
//! - [`dataflow`] - Bit-vector fixpoint analyses (liveness and friends)
//! - [`opt`] - Optimization levels, pass pipeline, match dispatch strategy
//! - [`emit`] - Textual assembly for x86-64, AArch64, and WebAssembly
//! - [`target`] - Architecture/ABI descriptions and register tables
//! - [`core`] - Session, statistics, and the error taxonomy

pub mod cfg;
pub mod core;
pub mod dataflow;
pub mod emit;
pub mod gen;
pub mod inst;
pub mod labels;
pub mod opt;
pub mod regalloc;
pub mod target;

pub use crate::core::{CodegenError, CodegenResult, CompilationSession};
pub use cfg::ControlFlowGraph;
pub use emit::{AssemblyEmitter, X86Syntax};
pub use gen::CodeGenerator;
pub use inst::{Instruction, InstructionBuffer, Opcode, Operand};
pub use labels::{LabelKind, LabelManager};
pub use opt::{MatchStrategy, OptLevel, Optimizer};
pub use regalloc::RegisterAllocator;
pub use target::{CallingConvention, PhysReg, TargetAbi, TargetArchitecture};
