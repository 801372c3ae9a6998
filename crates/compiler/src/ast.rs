//! Typed AST.
//!
//! This is the input contract of the compiler core: the frontend (scanner,
//! parser, checker, resolver) produces one flat, fully typed module plus a
//! populated [`crate::types::TypeRegistry`]. Every expression carries its
//! checked `TypeIndex` and every node a span. The whole surface derives
//! serde so a module can be interchanged as JSON (`.cot.json`).

use crate::diag::Span;
use crate::types::TypeIndex;
use serde::{Deserialize, Serialize};

/// A flat module: imports are already resolved by the frontend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub decls: Vec<Decl>,
}

/// Top-level declarations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Decl {
    Fn(FnDecl),
    ExternFn(ExternFnDecl),
    GlobalVar(GlobalVarDecl),
    Const(ConstDecl),
    Struct(StructDecl),
    Enum(EnumDecl),
    Union(UnionDecl),
    Impl(ImplDecl),
    Test(TestDecl),
    Bench(BenchDecl),
    TypeAlias(TypeAliasDecl),
    ErrorSet(ErrorSetDecl),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: TypeIndex,
    /// True when the callee takes ownership of a managed argument.
    pub owned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FnDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: TypeIndex,
    pub body: BlockStmt,
    pub span: Span,
}

/// A function provided by the host environment (native path only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternFnDecl {
    pub name: String,
    pub params: Vec<TypeIndex>,
    pub ret: TypeIndex,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalVarDecl {
    pub name: String,
    pub ty: TypeIndex,
    /// Constant initializer; zero-initialized when absent.
    pub init: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstDecl {
    pub name: String,
    pub ty: TypeIndex,
    pub value: Expr,
    pub span: Span,
}

/// Struct/enum/union declarations carry only their registry index; layout
/// was computed by the checker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructDecl {
    pub name: String,
    pub ty: TypeIndex,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumDecl {
    pub name: String,
    pub ty: TypeIndex,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnionDecl {
    pub name: String,
    pub ty: TypeIndex,
    pub span: Span,
}

/// An impl block. Methods lower individually as `Type_method` with the
/// receiver prepended to the parameter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplDecl {
    pub target: String,
    pub target_ty: TypeIndex,
    pub methods: Vec<FnDecl>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestDecl {
    /// Mangled function name, unique within the module.
    pub name: String,
    /// Human-readable name printed by the test runner.
    pub display_name: String,
    pub body: BlockStmt,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchDecl {
    pub name: String,
    pub display_name: String,
    pub body: BlockStmt,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeAliasDecl {
    pub name: String,
    pub ty: TypeIndex,
    pub span: Span,
}

/// A named error set. Tags are global across the module: the checker has
/// already assigned each error name a non-zero tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSetDecl {
    pub name: String,
    pub errors: Vec<String>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockStmt {
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StmtKind {
    Let {
        name: String,
        ty: TypeIndex,
        init: Expr,
        /// Weak bindings do not retain and register no cleanup.
        weak: bool,
    },
    Assign {
        target: Expr,
        value: Expr,
    },
    CompoundAssign {
        target: Expr,
        op: BinOp,
        value: Expr,
    },
    If {
        cond: Expr,
        then_body: BlockStmt,
        else_body: Option<BlockStmt>,
    },
    While {
        label: Option<String>,
        cond: Expr,
        body: BlockStmt,
    },
    For {
        label: Option<String>,
        binding: String,
        iterable: Expr,
        body: BlockStmt,
    },
    Switch {
        scrutinee: Expr,
        arms: Vec<SwitchArm>,
    },
    Return(Option<Expr>),
    Break {
        label: Option<String>,
    },
    Continue {
        label: Option<String>,
    },
    Defer(BlockStmt),
    Errdefer(BlockStmt),
    Expr(Expr),
    Block(BlockStmt),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchArm {
    pub pattern: Pattern,
    /// Payload capture for `Union.variant |p|` arms.
    pub binding: Option<String>,
    pub body: BlockStmt,
    pub span: Span,
}

/// Switch arm patterns. Variant patterns arrive in both field-access and
/// zero-arg-call parse shapes; both carry only the variant name here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Pattern {
    Int(i64),
    EnumVariant { name: String, value: i64 },
    UnionVariant { name: String },
    Else,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: TypeIndex,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldInit {
    pub name: String,
    pub offset: u32,
    pub value: Expr,
}

/// One monomorphization of a generic function: the checker substitutes
/// type arguments and hands the instantiated body to the lowerer, which
/// dedups on `key` so each instance is lowered once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericInstance {
    pub key: String,
    pub decl: FnDecl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExprKind {
    IntLit(i64),
    FloatLit(f64),
    BoolLit(bool),
    StringLit(String),
    /// The none value of an optional type.
    NullLit,
    Ident(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Short-circuiting `and` / `or`; lowered to control flow.
    Logical {
        and: bool,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
        /// Present when this call instantiates a generic function.
        instance: Option<Box<GenericInstance>>,
    },
    MethodCall {
        recv: Box<Expr>,
        recv_type: String,
        method: String,
        args: Vec<Expr>,
    },
    Builtin {
        name: String,
        args: Vec<Expr>,
    },
    Field {
        base: Box<Expr>,
        name: String,
        offset: u32,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    /// Heap allocation: `new Foo { ... }`. Expression type is *Foo.
    New {
        ty: TypeIndex,
        fields: Vec<FieldInit>,
    },
    /// A by-value struct literal, materialized in a stack slot.
    StructLit {
        ty: TypeIndex,
        fields: Vec<FieldInit>,
    },
    UnionLit {
        ty: TypeIndex,
        variant: String,
        payload: Option<Box<Expr>>,
    },
    EnumLit {
        ty: TypeIndex,
        variant: String,
        value: i64,
    },
    ListLit {
        elem: TypeIndex,
        items: Vec<Expr>,
    },
    /// `try expr`: unwrap an error union, propagating the error arm.
    Try(Box<Expr>),
    /// `expr catch |e| { ... }`: handle the error arm locally.
    Catch {
        expr: Box<Expr>,
        binding: Option<String>,
        handler: BlockStmt,
    },
    /// A named error value; the checker resolved its global tag.
    ErrorValue {
        set: String,
        name: String,
        tag: i64,
    },
    /// Numeric conversion; the expression's `ty` is the target.
    Cast(Box<Expr>),
    /// `ptr.*`
    Deref(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// String concatenation (`++`).
    Concat,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
}

impl Module {
    pub fn find_fn(&self, name: &str) -> Option<&FnDecl> {
        self.decls.iter().find_map(|d| match d {
            Decl::Fn(f) if f.name == name => Some(f),
            _ => None,
        })
    }
}

/// A serialized compilation unit: the module plus the registry it was
/// checked against.
#[derive(Debug, Serialize, Deserialize)]
pub struct ModuleFile {
    pub module: Module,
    pub types: crate::types::TypeRegistry,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeRegistry;

    fn int_lit(v: i64) -> Expr {
        Expr {
            kind: ExprKind::IntLit(v),
            ty: TypeIndex::I64,
            span: Span::none(),
        }
    }

    #[test]
    fn test_find_fn() {
        let m = Module {
            name: "t".to_string(),
            decls: vec![Decl::Fn(FnDecl {
                name: "main".to_string(),
                params: vec![],
                ret: TypeIndex::I64,
                body: BlockStmt {
                    stmts: vec![Stmt {
                        kind: StmtKind::Return(Some(int_lit(42))),
                        span: Span::none(),
                    }],
                },
                span: Span::none(),
            })],
        };
        assert!(m.find_fn("main").is_some());
        assert!(m.find_fn("missing").is_none());
    }

    #[test]
    fn test_module_file_round_trip() {
        let file = ModuleFile {
            module: Module {
                name: "t".to_string(),
                decls: vec![],
            },
            types: TypeRegistry::new(),
        };
        let json = serde_json::to_string(&file).unwrap();
        let mut back: ModuleFile = serde_json::from_str(&json).unwrap();
        back.types.rehydrate();
        assert_eq!(back.module.name, "t");
        assert_eq!(back.types.len(), TypeRegistry::new().len());
    }
}
