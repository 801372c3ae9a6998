//! Cot compiler core.
//!
//! Lowers a typed AST to WebAssembly through an SSA middle-end with
//! ARC insertion:
//!
//! ```text
//! typed AST + TypeRegistry
//!   -> lower      (AST -> IR, cleanup/defer fan-outs)
//!   -> ssa build  (blocks, values, phis via forward references)
//!   -> rewritegeneric / rewritedec / decompose / expand_calls
//!   -> schedule / layout / lower_wasm
//!   -> wasm codegen + link (sections, runtime, metadata, test runtime)
//! ```
//!
//! The frontend (scanner, parser, checker) is an external collaborator:
//! it hands the core one flat module plus a populated registry, here
//! realized as a serde-interchangeable [`ast::ModuleFile`].

pub mod ast;
pub mod debug;
pub mod diag;
pub mod error;
pub mod ir;
pub mod lower;
pub mod ssa;
pub mod types;
pub mod wasm;

pub use error::{CompileError, SsaError};
pub use types::{TypeIndex, TypeRegistry};

use debug::Phase;

/// Test-mode exit codes report the failed-test count, capped here.
pub const MAX_TEST_EXIT_CODE: i64 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Wasm32,
    Native,
}

/// Per-compilation options handed through the whole pipeline.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub target: Target,
    pub test_mode: bool,
    pub bench_mode: bool,
    /// Stop the synthesized test runner after the first failure.
    pub fail_fast: bool,
    /// Only run tests whose display name contains this substring.
    pub filter: Option<String>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            target: Target::Wasm32,
            test_mode: false,
            bench_mode: false,
            fail_fast: false,
            filter: None,
        }
    }
}

impl CompileOptions {
    /// Host I/O imports (`cot_write`, `cot_time`) are linked in test and
    /// bench builds and on the native path; plain wasm32 modules import
    /// nothing.
    pub fn host_io(&self) -> bool {
        self.test_mode || self.bench_mode || self.target == Target::Native
    }
}

/// Compile one checked module to Wasm bytes.
pub fn compile_module(
    module: &ast::Module,
    types: &mut TypeRegistry,
    opts: &CompileOptions,
) -> Result<Vec<u8>, CompileError> {
    let ir = lower::Lowerer::new(types, opts).lower(module)?;
    let mut ssa_funcs = Vec::with_capacity(ir.funcs.len());
    for f in &ir.funcs {
        ssa_funcs.push(compile_func(f, &ir, types)?);
    }
    wasm::link_module(&ir, &ssa_funcs, types, opts)
}

/// Run the fixed pass order over one function. Pass order is not
/// reentrant; a pass reintroducing a pattern an earlier pass removes
/// trips the iteration bound.
fn compile_func(
    irf: &ir::IrFunc,
    ir: &ir::IrModule,
    types: &TypeRegistry,
) -> Result<ssa::Func, CompileError> {
    let checking = debug::enabled(Phase::Verify);
    let mut f = ssa::builder::build(irf, types)?;
    if checking {
        f.verify(types)?;
    }
    ssa::rewrite::rewrite_generic(&mut f, &ir.strings)?;
    ssa::rewrite::rewrite_dec(&mut f, types)?;
    if checking {
        f.verify(types)?;
    }
    ssa::decompose::decompose(&mut f, types, &ir.strings)?;
    ssa::expand_calls::expand_calls(&mut f, types)?;
    f.verify_sizes(types)?;
    if checking {
        f.verify(types)?;
    }
    ssa::schedule::schedule(&mut f)?;
    ssa::layout::layout(&mut f);
    ssa::lower_wasm::lower_wasm(&mut f, types)?;
    if checking {
        f.verify(types)?;
    }
    Ok(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BlockStmt, Decl, Expr, ExprKind, FnDecl, Module, Stmt, StmtKind};
    use crate::diag::Span;

    fn return_const_module(v: i64) -> Module {
        Module {
            name: "t".to_string(),
            decls: vec![Decl::Fn(FnDecl {
                name: "main".to_string(),
                params: vec![],
                ret: TypeIndex::I64,
                body: BlockStmt {
                    stmts: vec![Stmt {
                        kind: StmtKind::Return(Some(Expr {
                            kind: ExprKind::IntLit(v),
                            ty: TypeIndex::I64,
                            span: Span::none(),
                        })),
                        span: Span::none(),
                    }],
                },
                span: Span::none(),
            })],
        }
    }

    #[test]
    fn test_compile_minimal_module() {
        let mut types = TypeRegistry::new();
        let opts = CompileOptions::default();
        let bytes = compile_module(&return_const_module(42), &mut types, &opts).unwrap();
        assert_eq!(&bytes[..8], &wasm::encode::MAGIC);
    }

    #[test]
    fn test_plain_build_has_no_imports() {
        let mut types = TypeRegistry::new();
        let opts = CompileOptions::default();
        let bytes = compile_module(&return_const_module(0), &mut types, &opts).unwrap();
        // Section id 2 (import) must be absent in a wasm-only build.
        let mut pos = 8;
        while pos < bytes.len() {
            let id = bytes[pos];
            assert_ne!(id, 2, "plain wasm32 build emitted an import section");
            pos += 1;
            let mut size: u32 = 0;
            let mut shift = 0;
            loop {
                let b = bytes[pos];
                pos += 1;
                size |= ((b & 0x7F) as u32) << shift;
                shift += 7;
                if b & 0x80 == 0 {
                    break;
                }
            }
            pos += size as usize;
        }
    }

    #[test]
    fn test_test_mode_links_host_imports() {
        let mut types = TypeRegistry::new();
        let opts = CompileOptions {
            test_mode: true,
            ..CompileOptions::default()
        };
        let module = Module {
            name: "t".to_string(),
            decls: vec![Decl::Test(crate::ast::TestDecl {
                name: "test_t".to_string(),
                display_name: "t".to_string(),
                body: BlockStmt { stmts: vec![] },
                span: Span::none(),
            })],
        };
        let bytes = compile_module(&module, &mut types, &opts).unwrap();
        let found = bytes
            .windows(b"cot_write".len())
            .any(|w| w == b"cot_write");
        assert!(found, "test builds import cot_write");
    }
}
