//! Typed AST consumed by the code generator.
//!
//! The tree arrives from the semantic analyzer with symbols resolved and
//! type information attached; the generator never infers types. Statements,
//! expressions, and patterns are closed sums so lowering dispatch is
//! exhaustive: adding a node kind is a compile error until every consumer
//! handles it.

/// Type category exposed by the semantic analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Primitive,
    Slice,
    Pointer,
    Result,
    Struct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bool,
    Str,
    Void,
}

/// Resolved type attached to AST nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub category: TypeCategory,
    /// Set when `category` is `Primitive`.
    pub primitive: Option<PrimitiveKind>,
    /// Nominal name for structs and user-defined enums.
    pub name: Option<String>,
}

impl TypeInfo {
    pub fn primitive(kind: PrimitiveKind) -> Self {
        Self {
            category: TypeCategory::Primitive,
            primitive: Some(kind),
            name: None,
        }
    }

    pub fn void() -> Self {
        Self::primitive(PrimitiveKind::Void)
    }

    pub fn named(category: TypeCategory, name: impl Into<String>) -> Self {
        Self {
            category,
            primitive: None,
            name: Some(name.into()),
        }
    }

    /// Whether values of this type travel through floating-point registers.
    pub fn is_float(&self) -> bool {
        matches!(self.primitive, Some(PrimitiveKind::F32 | PrimitiveKind::F64))
    }

    pub fn is_void(&self) -> bool {
        self.primitive == Some(PrimitiveKind::Void)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Neg,
    /// Logical not.
    Not,
    /// Bitwise complement.
    BitNot,
}

/// Expression node with resolved types at the leaves that need them.
#[derive(Debug, Clone)]
pub enum Expr {
    IntLiteral(i64),
    FloatLiteral(f64),
    BoolLiteral(bool),
    Ident { name: String, ty: TypeInfo },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        ty: TypeInfo,
    },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Call {
        callee: String,
        args: Vec<Expr>,
        ty: TypeInfo,
    },
}

impl Expr {
    /// Result type of the expression.
    pub fn ty(&self) -> TypeInfo {
        match self {
            Expr::IntLiteral(_) => TypeInfo::primitive(PrimitiveKind::I64),
            Expr::FloatLiteral(_) => TypeInfo::primitive(PrimitiveKind::F64),
            Expr::BoolLiteral(_) => TypeInfo::primitive(PrimitiveKind::Bool),
            Expr::Ident { ty, .. } => ty.clone(),
            Expr::Binary { ty, .. } => ty.clone(),
            Expr::Unary { operand, .. } => operand.ty(),
            Expr::Call { ty, .. } => ty.clone(),
        }
    }
}

/// Pattern in a `match` arm or `if let`.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// `_` — always matches, binds nothing.
    Wildcard,
    /// Plain identifier — always matches, binds the scrutinee.
    Binding(String),
    /// Integer literal — matches on equality.
    IntLiteral(i64),
    /// `Enum::Variant(binding?)` — matches on the runtime tag word.
    EnumVariant {
        enum_name: String,
        variant: String,
        /// Declaration-order index assigned by the semantic analyzer.
        /// Built-in `Option`/`Result` variants use their well-known tags
        /// instead.
        variant_index: Option<u32>,
        binding: Option<String>,
    },
    /// `Struct { fields }` — structural acceptance; field destructuring is
    /// not lowered yet.
    Struct {
        name: String,
        fields: Vec<(String, Pattern)>,
    },
}

#[derive(Debug, Clone)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Let {
        name: String,
        ty: TypeInfo,
        init: Expr,
    },
    Assign { name: String, value: Expr },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },
    IfLet {
        pattern: Pattern,
        value: Expr,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },
    /// `for var in iterable { body }`. Only the `range(n)` iterable form is
    /// lowered; anything else reports an unsupported operation.
    For {
        var: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    Match { scrutinee: Expr, arms: Vec<MatchArm> },
    Return(Option<Expr>),
    Break,
    Continue,
    Expr(Expr),
    Block(Vec<Stmt>),
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: TypeInfo,
}

/// A function ready for code generation.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: TypeInfo,
    pub body: Vec<Stmt>,
}

impl Function {
    pub fn new(name: impl Into<String>, return_type: TypeInfo) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            return_type,
            body: Vec::new(),
        }
    }
}
