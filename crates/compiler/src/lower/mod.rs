//! AST -> IR lowering.
//!
//! Walks the typed AST and populates a [`FuncBuilder`] per function,
//! synthesizing per-function locals and registering ARC cleanups for
//! every owned allocation. Cleanup and defer fan-outs are emitted on
//! every exit path: normal scope exit, return, break, continue, and the
//! error arm of `try`.
//!
//! Conventions used throughout the lowerer:
//!
//! - Scalar and pair-typed (string, slice, error-union) expressions
//!   evaluate to their value node.
//! - Wider aggregates (structs, arrays, unions by value) evaluate to the
//!   address of a stack slot holding them, and are copied with `MemCopy`.
//!   Aggregate parameters travel as an opaque pointer.
//! - Functions returning aggregates wider than 16 bytes take a hidden
//!   leading `__sret` pointer parameter.

pub mod arc;
mod builtins;
mod expressions;
mod statements;

pub use arc::{
    CleanupHandle, CleanupKind, CleanupStack, CleanupState, ManagedValue, HEAP_HEADER_SIZE,
    IMMORTAL_REFCOUNT, INVALID_CLEANUP, METADATA_RECORD_SIZE, REFCOUNT_OFFSET,
};

use crate::ast::{
    BlockStmt, Decl, Expr, ExprKind, FnDecl, Module, Param, TestDecl,
};
use crate::debug::{self, Phase};
use crate::diag::Span;
use crate::error::CompileError;
use crate::ir::{
    FuncBuilder, IrBlockId, IrGlobal, IrModule, IrOp, IrTerm, LocalId, NodeIndex, TestEntry,
};
use crate::types::{TypeIndex, TypeRegistry};
use crate::CompileOptions;
use std::collections::{HashMap, HashSet, VecDeque};

/// A compile-time constant value bound by a `const` declaration.
#[derive(Debug, Clone)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

/// One loop on the lowering stack; break/continue unwind to it.
struct LoopFrame {
    continue_block: IrBlockId,
    exit_block: IrBlockId,
    defer_depth: usize,
    cleanup_depth: usize,
    label: Option<String>,
}

#[derive(Clone)]
struct DeferEntry {
    body: BlockStmt,
    /// errdefer bodies run only when leaving through an error arm.
    error_only: bool,
}

/// Call signature recorded during declaration collection.
#[derive(Debug, Clone)]
pub struct FnSig {
    pub params: Vec<(TypeIndex, bool)>,
    pub ret: TypeIndex,
    /// True when the return travels through a hidden sret pointer.
    pub sret: bool,
}

pub struct Lowerer<'a> {
    types: &'a mut TypeRegistry,
    opts: &'a CompileOptions,
    module: IrModule,
    fb: FuncBuilder,
    cleanups: CleanupStack,
    loop_stack: Vec<LoopFrame>,
    defer_stack: Vec<DeferEntry>,
    scopes: Vec<HashMap<String, LocalId>>,
    weak_locals: HashSet<LocalId>,
    /// Aggregate parameters received by reference.
    byref_params: HashSet<LocalId>,
    ret_ty: TypeIndex,
    has_sret: bool,
    consts: HashMap<String, ConstValue>,
    global_types: HashMap<String, TypeIndex>,
    fn_sigs: HashMap<String, FnSig>,
    generic_queue: VecDeque<FnDecl>,
    generic_seen: HashSet<String>,
    temp_counter: usize,
}

pub(crate) fn err(msg: impl Into<String>) -> CompileError {
    CompileError::Lower(msg.into())
}

impl<'a> Lowerer<'a> {
    pub fn new(types: &'a mut TypeRegistry, opts: &'a CompileOptions) -> Lowerer<'a> {
        Lowerer {
            types,
            opts,
            module: IrModule::new(),
            fb: FuncBuilder::new("<none>", TypeIndex::VOID, false),
            cleanups: CleanupStack::new(),
            loop_stack: Vec::new(),
            defer_stack: Vec::new(),
            scopes: Vec::new(),
            weak_locals: HashSet::new(),
            byref_params: HashSet::new(),
            ret_ty: TypeIndex::VOID,
            has_sret: false,
            consts: HashMap::new(),
            global_types: HashMap::new(),
            fn_sigs: HashMap::new(),
            generic_queue: VecDeque::new(),
            generic_seen: HashSet::new(),
            temp_counter: 0,
        }
    }

    /// Lower a whole module: declarations in order, then the queued
    /// generic instantiations, then the synthesized test or bench runner.
    pub fn lower(mut self, m: &Module) -> Result<IrModule, CompileError> {
        self.collect_decls(m)?;
        for decl in &m.decls {
            self.lower_decl(decl)?;
        }
        self.drain_generic_queue()?;
        if self.opts.test_mode {
            self.synth_runner_main(false)?;
        } else if self.opts.bench_mode {
            self.synth_runner_main(true)?;
        }
        if debug::enabled(Phase::Lower) {
            for f in &self.module.funcs {
                eprintln!(
                    "[lower] fn {}: {} blocks, {} nodes, {} locals",
                    f.name,
                    f.blocks.len(),
                    f.nodes.len(),
                    f.locals.len()
                );
            }
        }
        Ok(self.module)
    }

    /// First pass: record signatures, constants, globals, and test names
    /// so later declarations can reference earlier and later ones alike.
    fn collect_decls(&mut self, m: &Module) -> Result<(), CompileError> {
        for decl in &m.decls {
            match decl {
                Decl::Fn(f) => {
                    let sig = self.sig_of(&f.params, f.ret);
                    self.fn_sigs.insert(f.name.clone(), sig);
                }
                Decl::ExternFn(f) => {
                    let params = f.params.iter().map(|&t| (t, false)).collect();
                    self.fn_sigs.insert(
                        f.name.clone(),
                        FnSig {
                            params,
                            ret: f.ret,
                            sret: false,
                        },
                    );
                }
                Decl::Impl(imp) => {
                    for method in &imp.methods {
                        let name = format!("{}_{}", imp.target, method.name);
                        let sig = self.sig_of(&method.params, method.ret);
                        self.fn_sigs.insert(name, sig);
                    }
                }
                Decl::Const(c) => {
                    let value = self.eval_const(&c.value)?;
                    self.consts.insert(c.name.clone(), value);
                }
                Decl::GlobalVar(g) => {
                    self.global_types.insert(g.name.clone(), g.ty);
                    let init = match &g.init {
                        Some(e) => match self.eval_const(e)? {
                            ConstValue::Int(v) => v,
                            ConstValue::Bool(b) => b as i64,
                            ConstValue::Float(f) => f.to_bits() as i64,
                            ConstValue::Str(_) => {
                                return Err(err(format!(
                                    "global '{}': string initializers are not supported",
                                    g.name
                                )))
                            }
                        },
                        None => 0,
                    };
                    self.module.globals.push(IrGlobal {
                        name: g.name.clone(),
                        ty: g.ty,
                        size: self.types.size_of(g.ty).max(8),
                        init,
                    });
                }
                Decl::Test(t) => {
                    if self.test_matches_filter(t) {
                        self.module.tests.push(TestEntry {
                            fn_name: t.name.clone(),
                            display: t.display_name.clone(),
                        });
                    }
                    self.fn_sigs.insert(
                        t.name.clone(),
                        FnSig {
                            params: vec![],
                            ret: TypeIndex::VOID,
                            sret: false,
                        },
                    );
                }
                Decl::Bench(b) => {
                    self.module.benches.push(TestEntry {
                        fn_name: b.name.clone(),
                        display: b.display_name.clone(),
                    });
                    self.fn_sigs.insert(
                        b.name.clone(),
                        FnSig {
                            params: vec![],
                            ret: TypeIndex::VOID,
                            sret: false,
                        },
                    );
                }
                Decl::Struct(_)
                | Decl::Enum(_)
                | Decl::Union(_)
                | Decl::TypeAlias(_)
                | Decl::ErrorSet(_) => {}
            }
        }
        Ok(())
    }

    fn test_matches_filter(&self, t: &TestDecl) -> bool {
        match &self.opts.filter {
            Some(pat) => t.display_name.contains(pat.as_str()),
            None => true,
        }
    }

    fn sig_of(&self, params: &[Param], ret: TypeIndex) -> FnSig {
        FnSig {
            params: params.iter().map(|p| (p.ty, p.owned)).collect(),
            ret,
            sret: self.needs_sret(ret),
        }
    }

    fn needs_sret(&self, ret: TypeIndex) -> bool {
        self.types.size_of(ret) > 16 && !self.types.is_pair(ret)
    }

    fn lower_decl(&mut self, decl: &Decl) -> Result<(), CompileError> {
        match decl {
            Decl::Fn(f) => {
                // Test and bench builds synthesize their own runner main.
                if f.name == "main" && (self.opts.test_mode || self.opts.bench_mode) {
                    return Ok(());
                }
                let exported = f.name == "main";
                self.lower_fn_common(&f.name, &f.params, f.ret, &f.body, exported, f.span)
            }
            Decl::Impl(imp) => {
                for method in &imp.methods {
                    let name = format!("{}_{}", imp.target, method.name);
                    self.lower_fn_common(&name, &method.params, method.ret, &method.body, false, method.span)?;
                }
                Ok(())
            }
            Decl::Test(t) => {
                if self.test_matches_filter(t) {
                    self.lower_fn_common(&t.name, &[], TypeIndex::VOID, &t.body, true, t.span)?;
                }
                Ok(())
            }
            Decl::Bench(b) => {
                self.lower_fn_common(&b.name, &[], TypeIndex::VOID, &b.body, true, b.span)
            }
            // Collected in the first pass; nothing to emit here.
            Decl::ExternFn(_)
            | Decl::GlobalVar(_)
            | Decl::Const(_)
            | Decl::Struct(_)
            | Decl::Enum(_)
            | Decl::Union(_)
            | Decl::TypeAlias(_)
            | Decl::ErrorSet(_) => Ok(()),
        }
    }

    fn lower_fn_common(
        &mut self,
        name: &str,
        params: &[Param],
        ret: TypeIndex,
        body: &BlockStmt,
        exported: bool,
        span: Span,
    ) -> Result<(), CompileError> {
        debug::trace_heading(name, "lower");
        self.fb = FuncBuilder::new(name, ret, exported);
        self.cleanups = CleanupStack::new();
        self.loop_stack.clear();
        self.defer_stack.clear();
        self.scopes = vec![HashMap::new()];
        // The weak-locals map is scoped per function body; a stale entry
        // would mark an unrelated local in the next function as weak.
        self.weak_locals.clear();
        self.byref_params.clear();
        self.ret_ty = ret;
        self.has_sret = self.needs_sret(ret);

        let mut slot = 0u32;
        if self.has_sret {
            let l = self.fb.add_param("__sret", TypeIndex::I64, 8);
            let node = self.fb.emit(IrOp::Param(slot), vec![], TypeIndex::I64, span);
            self.fb.emit_store_local(l, node, span);
            self.bind("__sret", l);
            slot += 1;
        }
        for p in params {
            let by_ref = self.is_aggregate(p.ty);
            let (local_ty, size) = if by_ref {
                (TypeIndex::I64, 8)
            } else {
                (p.ty, self.types.size_of(p.ty))
            };
            let l = self.fb.add_param(&p.name, local_ty, size);
            if by_ref {
                self.byref_params.insert(l);
            }
            let node = self.fb.emit(IrOp::Param(slot), vec![], if by_ref { TypeIndex::I64 } else { p.ty }, span);
            self.fb.emit_store_local(l, node, span);
            self.bind(&p.name, l);
            if p.owned && self.types.is_managed(p.ty) {
                self.cleanups.push(CleanupKind::Release, node, p.ty);
            }
            slot += 1;
        }

        self.lower_stmts(body)?;

        if !self.fb.is_terminated() {
            self.emit_cleanups_above(0, span);
            self.run_defers_above(0, false, span)?;
            let term = if ret == TypeIndex::VOID {
                IrTerm::Return(None)
            } else {
                let zero = self.zero_value(ret, span)?;
                IrTerm::Return(Some(zero))
            };
            self.fb.set_term(term);
        }

        let done = std::mem::replace(
            &mut self.fb,
            FuncBuilder::new("<none>", TypeIndex::VOID, false),
        );
        self.module.funcs.push(done.finish());
        Ok(())
    }

    /// A zero/default value of the given type, for implicit returns.
    fn zero_value(&mut self, ty: TypeIndex, span: Span) -> Result<NodeIndex, CompileError> {
        if self.types.is_float(ty) {
            return Ok(self.fb.emit(IrOp::ConstFloat(0.0), vec![], ty, span));
        }
        if self.types.is_pair(ty) {
            let a = self.fb.emit_const_int(0, TypeIndex::I64, span);
            let b = self.fb.emit_const_int(0, TypeIndex::I64, span);
            return Ok(self.fb.emit(IrOp::PairMake, vec![a, b], ty, span));
        }
        Ok(self.fb.emit_const_int(0, ty, span))
    }

    /// True for by-address aggregates: anything wider than a pair that is
    /// not itself a pair.
    pub(crate) fn is_aggregate(&self, ty: TypeIndex) -> bool {
        self.types.size_of(ty) > 8 && !self.types.is_pair(ty)
    }

    // Generic instantiations: each key is lowered once.

    pub(crate) fn queue_generic(&mut self, key: &str, decl: &FnDecl) {
        if self.generic_seen.insert(key.to_string()) {
            let sig = self.sig_of(&decl.params, decl.ret);
            self.fn_sigs.insert(decl.name.clone(), sig);
            self.generic_queue.push_back(decl.clone());
        }
    }

    fn drain_generic_queue(&mut self) -> Result<(), CompileError> {
        while let Some(decl) = self.generic_queue.pop_front() {
            self.lower_fn_common(&decl.name, &decl.params, decl.ret, &decl.body, false, decl.span)?;
        }
        Ok(())
    }

    // Scope and name management.

    pub(crate) fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    pub(crate) fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    pub(crate) fn bind(&mut self, name: &str, local: LocalId) {
        self.scopes
            .last_mut()
            .expect("scope stack is never empty inside a function")
            .insert(name.to_string(), local);
    }

    pub(crate) fn lookup_local(&self, name: &str) -> Option<LocalId> {
        for scope in self.scopes.iter().rev() {
            if let Some(&l) = scope.get(name) {
                return Some(l);
            }
        }
        None
    }

    pub(crate) fn fresh_temp(&mut self, prefix: &str) -> String {
        self.temp_counter += 1;
        format!("__{}{}", prefix, self.temp_counter)
    }

    // Cleanup / defer fan-outs.

    /// Emit the active cleanups above `depth` in LIFO order. Does not pop:
    /// sibling exit paths emit the same set.
    pub(crate) fn emit_cleanups_above(&mut self, depth: usize, span: Span) {
        let Lowerer { cleanups, fb, .. } = self;
        cleanups.emit_to_depth(depth, |kind, node, _ty| {
            if kind == CleanupKind::Release {
                fb.emit(
                    IrOp::Call {
                        name: "cot_release".to_string(),
                    },
                    vec![node],
                    TypeIndex::VOID,
                    span,
                );
            }
        });
    }

    /// Re-lower the defer bodies above `depth` in reverse registration
    /// order. errdefer bodies run only when `error_path` is set.
    pub(crate) fn run_defers_above(
        &mut self,
        depth: usize,
        error_path: bool,
        span: Span,
    ) -> Result<(), CompileError> {
        let entries: Vec<DeferEntry> = self.defer_stack[depth.min(self.defer_stack.len())..].to_vec();
        for entry in entries.iter().rev() {
            if entry.error_only && !error_path {
                continue;
            }
            self.lower_scoped_block(&entry.body, span)?;
        }
        Ok(())
    }

    pub(crate) fn push_defer(&mut self, body: &BlockStmt, error_only: bool) {
        self.defer_stack.push(DeferEntry {
            body: body.clone(),
            error_only,
        });
    }

    pub(crate) fn defer_depth(&self) -> usize {
        self.defer_stack.len()
    }

    pub(crate) fn loop_frame(
        &self,
        label: Option<&String>,
    ) -> Option<(IrBlockId, IrBlockId, usize, usize)> {
        let frame = match label {
            None => self.loop_stack.last(),
            Some(want) => self
                .loop_stack
                .iter()
                .rev()
                .find(|f| f.label.as_ref() == Some(want)),
        }?;
        Some((
            frame.continue_block,
            frame.exit_block,
            frame.defer_depth,
            frame.cleanup_depth,
        ))
    }

    pub(crate) fn push_loop(
        &mut self,
        continue_block: IrBlockId,
        exit_block: IrBlockId,
        label: Option<String>,
    ) {
        self.loop_stack.push(LoopFrame {
            continue_block,
            exit_block,
            defer_depth: self.defer_stack.len(),
            cleanup_depth: self.cleanups.depth(),
            label,
        });
    }

    pub(crate) fn pop_loop(&mut self) {
        self.loop_stack.pop();
    }

    // Constant evaluation for `const` declarations; also folds the
    // simple integer expressions that reach it.

    pub(crate) fn eval_const(&self, e: &Expr) -> Result<ConstValue, CompileError> {
        use crate::ast::BinOp;
        match &e.kind {
            ExprKind::IntLit(v) => Ok(ConstValue::Int(*v)),
            ExprKind::FloatLit(v) => Ok(ConstValue::Float(*v)),
            ExprKind::BoolLit(v) => Ok(ConstValue::Bool(*v)),
            ExprKind::StringLit(s) => Ok(ConstValue::Str(s.clone())),
            ExprKind::EnumLit { value, .. } => Ok(ConstValue::Int(*value)),
            ExprKind::Ident(name) => self
                .consts
                .get(name)
                .cloned()
                .ok_or_else(|| err(format!("'{}' is not a compile-time constant", name))),
            ExprKind::Unary { op, operand } => {
                let v = self.eval_const(operand)?;
                match (op, v) {
                    (crate::ast::UnOp::Neg, ConstValue::Int(i)) => Ok(ConstValue::Int(-i)),
                    (crate::ast::UnOp::Neg, ConstValue::Float(f)) => Ok(ConstValue::Float(-f)),
                    (crate::ast::UnOp::Not, ConstValue::Bool(b)) => Ok(ConstValue::Bool(!b)),
                    (crate::ast::UnOp::BitNot, ConstValue::Int(i)) => Ok(ConstValue::Int(!i)),
                    _ => Err(err("unsupported constant unary expression")),
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let a = self.eval_const(lhs)?;
                let b = self.eval_const(rhs)?;
                match (a, b) {
                    (ConstValue::Int(a), ConstValue::Int(b)) => {
                        let v = match op {
                            BinOp::Add => a.wrapping_add(b),
                            BinOp::Sub => a.wrapping_sub(b),
                            BinOp::Mul => a.wrapping_mul(b),
                            BinOp::Div if b != 0 => a.wrapping_div(b),
                            BinOp::Rem if b != 0 => a.wrapping_rem(b),
                            BinOp::BitAnd => a & b,
                            BinOp::BitOr => a | b,
                            BinOp::BitXor => a ^ b,
                            BinOp::Shl => a.wrapping_shl(b as u32),
                            BinOp::Shr => a.wrapping_shr(b as u32),
                            _ => return Err(err("unsupported constant binary expression")),
                        };
                        Ok(ConstValue::Int(v))
                    }
                    _ => Err(err("unsupported constant binary expression")),
                }
            }
            _ => Err(err("expression is not a compile-time constant")),
        }
    }

    pub(crate) fn const_to_node(
        &mut self,
        cv: &ConstValue,
        ty: TypeIndex,
        span: Span,
    ) -> NodeIndex {
        match cv {
            ConstValue::Int(v) => self.fb.emit_const_int(*v, ty, span),
            ConstValue::Float(v) => self.fb.emit(IrOp::ConstFloat(*v), vec![], ty, span),
            ConstValue::Bool(v) => self.fb.emit_const_bool(*v, span),
            ConstValue::Str(s) => {
                let idx = self.module.intern_string(s);
                self.fb
                    .emit(IrOp::ConstString(idx), vec![], TypeIndex::STRING, span)
            }
        }
    }

    // Test / bench runner synthesis.

    /// Build the `main` that drives registered tests (or benches) through
    /// the emitted test runtime. The runner reads no timing value itself:
    /// timing lives inside the runtime functions.
    fn synth_runner_main(&mut self, benches: bool) -> Result<(), CompileError> {
        let span = Span::none();
        let entries = if benches {
            self.module.benches.clone()
        } else {
            self.module.tests.clone()
        };
        self.fb = FuncBuilder::new("main", TypeIndex::I64, true);
        self.cleanups = CleanupStack::new();
        self.scopes = vec![HashMap::new()];
        self.weak_locals.clear();
        self.ret_ty = TypeIndex::I64;
        self.has_sret = false;

        for entry in &entries {
            self.emit_runtime_call("__test_begin", vec![], TypeIndex::VOID, span);
            let idx = self.module.intern_string(&entry.display);
            let name_node = self
                .fb
                .emit(IrOp::ConstString(idx), vec![], TypeIndex::STRING, span);
            self.emit_runtime_call("__test_print_name", vec![name_node], TypeIndex::VOID, span);
            self.emit_runtime_call(&entry.fn_name.clone(), vec![], TypeIndex::VOID, span);

            let failed = self.emit_runtime_call("__test_assert_failed", vec![], TypeIndex::I64, span);
            let zero = self.fb.emit_const_int(0, TypeIndex::I64, span);
            let cond = self.fb.emit(
                IrOp::Binary(crate::ast::BinOp::Ne),
                vec![failed, zero],
                TypeIndex::BOOL,
                span,
            );
            let fail_b = self.fb.new_block();
            let pass_b = self.fb.new_block();
            let cont_b = self.fb.new_block();
            self.fb.set_term(IrTerm::Branch {
                cond,
                then_blk: fail_b,
                else_blk: pass_b,
            });
            self.fb.switch_to(fail_b);
            self.emit_runtime_call("__test_fail", vec![], TypeIndex::VOID, span);
            self.fb.set_term(IrTerm::Jump(cont_b));
            self.fb.switch_to(pass_b);
            self.emit_runtime_call("__test_pass", vec![], TypeIndex::VOID, span);
            self.fb.set_term(IrTerm::Jump(cont_b));
            self.fb.switch_to(cont_b);

            if self.opts.fail_fast && !benches {
                let f = self.emit_runtime_call("__test_failed_count", vec![], TypeIndex::I64, span);
                let zero = self.fb.emit_const_int(0, TypeIndex::I64, span);
                let any = self.fb.emit(
                    IrOp::Binary(crate::ast::BinOp::Ne),
                    vec![f, zero],
                    TypeIndex::BOOL,
                    span,
                );
                let bail = self.fb.new_block();
                let next = self.fb.new_block();
                self.fb.set_term(IrTerm::Branch {
                    cond: any,
                    then_blk: bail,
                    else_blk: next,
                });
                self.fb.switch_to(bail);
                let p = self.emit_runtime_call("__test_passed_count", vec![], TypeIndex::I64, span);
                let f2 = self.emit_runtime_call("__test_failed_count", vec![], TypeIndex::I64, span);
                self.emit_runtime_call("__test_summary", vec![p, f2], TypeIndex::VOID, span);
                let one = self.fb.emit_const_int(1, TypeIndex::I64, span);
                self.fb.set_term(IrTerm::Return(Some(one)));
                self.fb.switch_to(next);
            }
        }

        let p = self.emit_runtime_call("__test_passed_count", vec![], TypeIndex::I64, span);
        let f = self.emit_runtime_call("__test_failed_count", vec![], TypeIndex::I64, span);
        self.emit_runtime_call("__test_summary", vec![p, f], TypeIndex::VOID, span);

        // Exit code: failed-test count, capped.
        let cap = self
            .fb
            .emit_const_int(crate::MAX_TEST_EXIT_CODE, TypeIndex::I64, span);
        let over = self.fb.emit(
            IrOp::Binary(crate::ast::BinOp::Gt),
            vec![f, cap],
            TypeIndex::BOOL,
            span,
        );
        let ret_local = self.fb.add_local("__exit", TypeIndex::I64, 8);
        self.fb.emit_store_local(ret_local, f, span);
        let clamp_b = self.fb.new_block();
        let done_b = self.fb.new_block();
        self.fb.set_term(IrTerm::Branch {
            cond: over,
            then_blk: clamp_b,
            else_blk: done_b,
        });
        self.fb.switch_to(clamp_b);
        let cap2 = self
            .fb
            .emit_const_int(crate::MAX_TEST_EXIT_CODE, TypeIndex::I64, span);
        self.fb.emit_store_local(ret_local, cap2, span);
        self.fb.set_term(IrTerm::Jump(done_b));
        self.fb.switch_to(done_b);
        let result = self.fb.emit_load_local(ret_local, span);
        self.fb.set_term(IrTerm::Return(Some(result)));

        let done = std::mem::replace(
            &mut self.fb,
            FuncBuilder::new("<none>", TypeIndex::VOID, false),
        );
        self.module.funcs.push(done.finish());
        Ok(())
    }

    pub(crate) fn emit_runtime_call(
        &mut self,
        name: &str,
        args: Vec<NodeIndex>,
        ret: TypeIndex,
        span: Span,
    ) -> NodeIndex {
        self.fb.emit(
            IrOp::Call {
                name: name.to_string(),
            },
            args,
            ret,
            span,
        )
    }

    /// Signature lookup; unknown names (runtime functions) get a trivial
    /// borrowed signature.
    pub(crate) fn signature(&self, name: &str) -> Option<FnSig> {
        self.fn_sigs.get(name).cloned()
    }

    pub(crate) fn struct_name(&self, ty: TypeIndex) -> Result<String, CompileError> {
        self.types
            .name_of(ty)
            .map(|s| s.to_string())
            .ok_or_else(|| err("expected a nominal type"))
    }

    pub(crate) fn options(&self) -> &CompileOptions {
        self.opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Decl, StmtKind, Stmt};
    use crate::CompileOptions;

    fn int_expr(v: i64) -> Expr {
        Expr {
            kind: ExprKind::IntLit(v),
            ty: TypeIndex::I64,
            span: Span::none(),
        }
    }

    fn simple_main(ret_val: i64) -> Module {
        Module {
            name: "t".to_string(),
            decls: vec![Decl::Fn(FnDecl {
                name: "main".to_string(),
                params: vec![],
                ret: TypeIndex::I64,
                body: BlockStmt {
                    stmts: vec![Stmt {
                        kind: StmtKind::Return(Some(int_expr(ret_val))),
                        span: Span::none(),
                    }],
                },
                span: Span::none(),
            })],
        }
    }

    #[test]
    fn test_lower_return_42() {
        let mut types = TypeRegistry::new();
        let opts = CompileOptions::default();
        let ir = Lowerer::new(&mut types, &opts)
            .lower(&simple_main(42))
            .unwrap();
        let f = ir.find_func("main").unwrap();
        assert!(f.exported);
        assert!(matches!(
            f.block(f.entry).term,
            Some(IrTerm::Return(Some(_)))
        ));
    }

    #[test]
    fn test_const_folding() {
        let mut types = TypeRegistry::new();
        let opts = CompileOptions::default();
        let lw = Lowerer::new(&mut types, &opts);
        let e = Expr {
            kind: ExprKind::Binary {
                op: crate::ast::BinOp::Add,
                lhs: Box::new(int_expr(40)),
                rhs: Box::new(int_expr(2)),
            },
            ty: TypeIndex::I64,
            span: Span::none(),
        };
        match lw.eval_const(&e).unwrap() {
            ConstValue::Int(v) => assert_eq!(v, 42),
            other => panic!("unexpected constant {:?}", other),
        }
    }

    #[test]
    fn test_test_mode_synthesizes_main() {
        let mut types = TypeRegistry::new();
        let opts = CompileOptions {
            test_mode: true,
            ..CompileOptions::default()
        };
        let module = Module {
            name: "t".to_string(),
            decls: vec![Decl::Test(crate::ast::TestDecl {
                name: "test_answer".to_string(),
                display_name: "answer".to_string(),
                body: BlockStmt { stmts: vec![] },
                span: Span::none(),
            })],
        };
        let ir = Lowerer::new(&mut types, &opts).lower(&module).unwrap();
        assert!(ir.find_func("test_answer").is_some());
        let main = ir.find_func("main").unwrap();
        assert!(main.exported);
        // The runner calls into the test runtime.
        let calls: Vec<_> = main
            .nodes
            .iter()
            .filter_map(|n| match &n.op {
                IrOp::Call { name } => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert!(calls.iter().any(|c| c == "__test_begin"));
        assert!(calls.iter().any(|c| c == "__test_summary"));
    }
}
