//! Component-level backend tests: allocator properties, CFG partitioning,
//! liveness fixpoints, and the generator's diagnostic error paths.

use bumpalo::Bump;
use cinder::cfg::ControlFlowGraph;
use cinder::core::{CodegenError, CompilationSession};
use cinder::dataflow::{analyze, AnalysisKind};
use cinder::gen::ast::{
    BinaryOp, Expr, Function, Param, Pattern, PrimitiveKind, Stmt, TypeInfo,
};
use cinder::gen::CodeGenerator;
use cinder::inst::{Instruction, Opcode, Operand};
use cinder::labels::{LabelKind, LabelManager};
use cinder::opt::OptLevel;
use cinder::regalloc::RegisterAllocator;
use cinder::target::{CallingConvention, PhysReg, TargetAbi, TargetArchitecture};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn i32_ty() -> TypeInfo {
    TypeInfo::primitive(PrimitiveKind::I32)
}

fn sysv_generator<'s, 'a>(
    session: &'s CompilationSession<'a>,
    level: OptLevel,
) -> CodeGenerator<'s, 'a> {
    CodeGenerator::new(
        TargetArchitecture::X86_64,
        CallingConvention::SystemV,
        level,
        session,
    )
    .unwrap()
}

#[test]
fn test_allocator_never_duplicates_until_exhaustion() {
    let abi =
        TargetAbi::new(TargetArchitecture::X86_64, CallingConvention::SystemV).unwrap();
    let mut alloc = RegisterAllocator::new(&abi);
    let mut handed_out = std::collections::HashSet::new();
    while let Some(reg) = alloc.allocate(true) {
        assert!(handed_out.insert(reg), "duplicate {reg:?}");
        assert!(handed_out.len() <= 14, "x86-64 SysV has 14 allocatable GP regs");
    }
    assert_eq!(handed_out.len(), 14);
    // Exhaustion is `None`, not a wraparound.
    assert_eq!(alloc.allocate(true), None);
}

#[test]
fn test_label_names_unique_across_kinds() {
    let labels = LabelManager::new();
    let mut names = std::collections::HashSet::new();
    for kind in [
        LabelKind::FunctionEntry,
        LabelKind::BranchTarget,
        LabelKind::LoopStart,
        LabelKind::LoopEnd,
    ] {
        for _ in 0..50 {
            let id = labels.create_label(kind, ".L_x");
            assert!(names.insert(labels.name(id)));
        }
    }
}

#[test]
fn test_cfg_partition_of_generated_function() {
    init_logging();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut generator = sysv_generator(&session, OptLevel::None);

    // A function with branches, a loop, and early returns.
    let mut func = Function::new("busy", i32_ty());
    func.params.push(Param { name: "n".into(), ty: i32_ty() });
    func.body.push(Stmt::If {
        cond: Expr::Binary {
            op: BinaryOp::Gt,
            lhs: Box::new(Expr::Ident { name: "n".into(), ty: i32_ty() }),
            rhs: Box::new(Expr::IntLiteral(10)),
            ty: TypeInfo::primitive(PrimitiveKind::Bool),
        },
        then_body: vec![Stmt::Return(Some(Expr::IntLiteral(1)))],
        else_body: None,
    });
    func.body.push(Stmt::For {
        var: "i".into(),
        iterable: Expr::Call {
            callee: "range".into(),
            args: vec![Expr::Ident { name: "n".into(), ty: i32_ty() }],
            ty: i32_ty(),
        },
        body: vec![Stmt::Continue, Stmt::Break],
    });
    func.body.push(Stmt::Return(Some(Expr::IntLiteral(0))));
    generator.generate_function(&func).unwrap();
    generator.validate_instructions().unwrap();

    let snapshot = generator.buffer.snapshot();
    let cfg = ControlFlowGraph::build(&snapshot, &generator.labels).unwrap();

    // Every instruction belongs to exactly one block.
    let mut covered = vec![0u32; snapshot.len()];
    for block in cfg.blocks() {
        for i in block.range.clone() {
            covered[i] += 1;
        }
    }
    assert!(covered.iter().all(|&c| c == 1), "blocks must partition the buffer");

    // Successor edges stay within the graph.
    for block in cfg.blocks() {
        for &succ in &block.successors {
            assert!(succ < cfg.block_count());
        }
    }
}

#[test]
fn test_liveness_on_generated_branch() {
    init_logging();
    // Hand-built diamond from the data-flow specification: the branch
    // value must be live into both successors.
    let labels = LabelManager::new();
    let else_l = labels.create_label(LabelKind::BranchTarget, ".L_else");
    let else_name = labels.name(else_l);
    let r0 = PhysReg(0);
    let insts = vec![
        Instruction::mov_imm(r0, 7).unwrap(),
        Instruction::cmp(Operand::Register(r0), Operand::Immediate(0)).unwrap(),
        Instruction::jump_cc(Opcode::Je, else_name).unwrap(),
        Instruction::mov_reg(PhysReg(1), r0).unwrap(),
        Instruction::ret().unwrap(),
        Instruction::mov_reg(PhysReg(2), r0).unwrap(),
        Instruction::ret().unwrap(),
    ];
    labels.define_label(else_l, 5).unwrap();
    let cfg = ControlFlowGraph::build(&insts, &labels).unwrap();
    let live = analyze(AnalysisKind::Liveness, &insts, &cfg);

    let entry = cfg.block_of(0).unwrap();
    assert!(live.out_set(entry).test(0));
    for &succ in cfg.successors(entry) {
        assert!(live.in_set(succ).test(0));
    }
}

#[test]
fn test_break_outside_loop_is_diagnosed() {
    init_logging();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut generator = sysv_generator(&session, OptLevel::None);

    let mut func = Function::new("bad", TypeInfo::void());
    func.body.push(Stmt::Break);
    let err = generator.generate_function(&func);
    match err {
        Err(CodegenError::UnsupportedOperation { what }) => {
            assert!(what.contains("break statement outside of loop"));
        }
        other => panic!("expected unsupported-operation, got {other:?}"),
    }
}

#[test]
fn test_struct_pattern_destructuring_is_explicit_error() {
    init_logging();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut generator = sysv_generator(&session, OptLevel::None);

    let mut func = Function::new("destructure", TypeInfo::void());
    func.body.push(Stmt::IfLet {
        pattern: Pattern::Struct {
            name: "Point".into(),
            fields: vec![("x".into(), Pattern::Binding("x".into()))],
        },
        value: Expr::Ident {
            name: "p".into(),
            ty: TypeInfo::named(cinder::gen::ast::TypeCategory::Struct, "Point"),
        },
        then_body: vec![],
        else_body: None,
    });
    // `p` is not a known local, so add it as a parameter.
    func.params.push(Param {
        name: "p".into(),
        ty: TypeInfo::named(cinder::gen::ast::TypeCategory::Struct, "Point"),
    });

    let err = generator.generate_function(&func);
    assert!(
        matches!(err, Err(CodegenError::UnsupportedOperation { ref what })
            if what.contains("struct pattern field destructuring")),
        "got {err:?}"
    );
}

#[test]
fn test_non_range_iterable_is_diagnosed() {
    init_logging();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut generator = sysv_generator(&session, OptLevel::None);

    let mut func = Function::new("iter", TypeInfo::void());
    func.body.push(Stmt::For {
        var: "x".into(),
        iterable: Expr::IntLiteral(3),
        body: vec![],
    });
    let err = generator.generate_function(&func);
    assert!(matches!(err, Err(CodegenError::UnsupportedOperation { .. })));
}

#[test]
fn test_enum_match_on_option() {
    init_logging();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut generator = sysv_generator(&session, OptLevel::None);

    // fn unwrap_or_zero(opt: Option) -> i32 {
    //     match opt { Option::Some(v) => return v, Option::None => return 0 }
    // }
    let opt_ty = TypeInfo::named(cinder::gen::ast::TypeCategory::Result, "Option");
    let mut func = Function::new("unwrap_or_zero", i32_ty());
    func.params.push(Param { name: "opt".into(), ty: opt_ty.clone() });
    func.body.push(Stmt::Match {
        scrutinee: Expr::Ident { name: "opt".into(), ty: opt_ty },
        arms: vec![
            cinder::gen::ast::MatchArm {
                pattern: Pattern::EnumVariant {
                    enum_name: "Option".into(),
                    variant: "Some".into(),
                    variant_index: None,
                    binding: Some("v".into()),
                },
                body: vec![Stmt::Return(Some(Expr::Ident {
                    name: "v".into(),
                    ty: i32_ty(),
                }))],
            },
            cinder::gen::ast::MatchArm {
                pattern: Pattern::EnumVariant {
                    enum_name: "Option".into(),
                    variant: "None".into(),
                    variant_index: None,
                    binding: None,
                },
                body: vec![Stmt::Return(Some(Expr::IntLiteral(0)))],
            },
        ],
    });

    generator.generate_function(&func).unwrap();
    generator.validate_instructions().unwrap();

    // The tag compare against Some(0) and None(1) must both appear.
    let snapshot = generator.buffer.snapshot();
    let cmp_immediates: Vec<i64> = snapshot
        .iter()
        .filter(|i| i.opcode == Opcode::Cmp)
        .filter_map(|i| i.operands[1].as_immediate())
        .collect();
    assert!(cmp_immediates.contains(&0), "Some tag compare missing");
    assert!(cmp_immediates.contains(&1), "None tag compare missing");
}

#[test]
fn test_aarch64_function_generation() {
    init_logging();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut generator = CodeGenerator::new(
        TargetArchitecture::Aarch64,
        CallingConvention::Aapcs64,
        OptLevel::None,
        &session,
    )
    .unwrap();

    let mut func = Function::new("forty_two", i32_ty());
    func.body.push(Stmt::Return(Some(Expr::IntLiteral(42))));
    generator.generate_function(&func).unwrap();
    generator.validate_instructions().unwrap();

    let emitter = cinder::AssemblyEmitter::new(TargetArchitecture::Aarch64);
    let asm = emitter.emit(&generator.buffer, &generator.labels).unwrap();
    assert!(asm.contains("forty_two:"));
    assert!(asm.contains("#42"));
    assert!(asm.contains("ret"));
}

#[test]
fn test_statistics_accumulate_across_functions() {
    init_logging();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut generator = sysv_generator(&session, OptLevel::None);

    for name in ["f1", "f2", "f3"] {
        let mut func = Function::new(name, i32_ty());
        func.body.push(Stmt::Return(Some(Expr::IntLiteral(1))));
        generator.generate_function(&func).unwrap();
    }

    let stats = generator.statistics();
    assert_eq!(stats.functions_generated, 3);
    assert!(stats.instructions_generated >= 3 * 6);
    assert!(stats.bytes_estimated > 0);
    assert!(stats.max_register_pressure >= 1);
}

#[test]
fn test_global_coloring_of_generated_function() {
    init_logging();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut generator = sysv_generator(&session, OptLevel::None);

    // let a = 1; let b = 2; let c = a + b; return c;
    let mut func = Function::new("sums", i32_ty());
    func.body.push(Stmt::Let {
        name: "a".into(),
        ty: i32_ty(),
        init: Expr::IntLiteral(1),
    });
    func.body.push(Stmt::Let {
        name: "b".into(),
        ty: i32_ty(),
        init: Expr::IntLiteral(2),
    });
    func.body.push(Stmt::Let {
        name: "c".into(),
        ty: i32_ty(),
        init: Expr::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(Expr::Ident { name: "a".into(), ty: i32_ty() }),
            rhs: Box::new(Expr::Ident { name: "b".into(), ty: i32_ty() }),
            ty: i32_ty(),
        },
    });
    func.body.push(Stmt::Return(Some(Expr::Ident { name: "c".into(), ty: i32_ty() })));
    generator.generate_function(&func).unwrap();

    // Whole-function allocation: build interference from liveness and color
    // against the ABI's allocatable set. Straight-line code this small must
    // color without spilling.
    let snapshot = generator.buffer.snapshot();
    let cfg = ControlFlowGraph::build(&snapshot, &generator.labels).unwrap();
    let liveness = analyze(AnalysisKind::Liveness, &snapshot, &cfg);
    let graph =
        cinder::regalloc::coloring::InterferenceGraph::build(&snapshot, &cfg, &liveness);

    let abi = generator.abi();
    let palette: Vec<PhysReg> = abi.allocatable_gp.iter().collect();
    let result = cinder::regalloc::coloring::color(&graph, &palette);
    assert!(result.spilled.is_empty(), "no spills expected: {:?}", result.spilled);
    assert!(result.colors_used() <= palette.len());
}
