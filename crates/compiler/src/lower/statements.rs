//! Statement lowering.
//!
//! Control flow is explicit: every construct builds its blocks and
//! terminators directly. Exits (return, break, continue, scope end) fan
//! out the pending cleanups and defers before the jump.

use super::{err, CleanupKind, Lowerer};
use crate::ast::{BinOp, BlockStmt, Expr, ExprKind, Pattern, Stmt, StmtKind, SwitchArm};
use crate::diag::Span;
use crate::error::CompileError;
use crate::ir::{IrOp, IrTerm, NodeIndex};
use crate::types::{TypeIndex, TypeKind};

impl<'a> Lowerer<'a> {
    /// Lower the statements of a block into the current IR block, without
    /// opening a new scope. Statements after a terminator are dead and
    /// skipped.
    pub(crate) fn lower_stmts(&mut self, b: &BlockStmt) -> Result<(), CompileError> {
        for stmt in &b.stmts {
            if self.fb.is_terminated() {
                break;
            }
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    /// Lower a block in its own lexical scope: cleanups registered inside
    /// are emitted (LIFO) and its defers run when the block exits forward.
    pub(crate) fn lower_scoped_block(
        &mut self,
        b: &BlockStmt,
        span: Span,
    ) -> Result<(), CompileError> {
        let cleanup_depth = self.cleanups.depth();
        let defer_depth = self.defer_depth();
        self.push_scope();
        self.lower_stmts(b)?;
        if !self.fb.is_terminated() {
            self.emit_cleanups_above(cleanup_depth, span);
            self.run_defers_above(defer_depth, false, span)?;
        }
        self.cleanups.truncate(cleanup_depth);
        self.defer_stack.truncate(defer_depth);
        self.pop_scope();
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::Let { name, ty, init, weak } => self.lower_let(name, *ty, init, *weak, span),
            StmtKind::Assign { target, value } => self.lower_assign(target, value, span),
            StmtKind::CompoundAssign { target, op, value } => {
                let old = self.read_lvalue(target, span)?;
                let rhs = self.lower_expr(value)?;
                let node = self.fb.emit(
                    IrOp::Binary(*op),
                    vec![old, rhs.node],
                    target.ty,
                    span,
                );
                self.write_lvalue_raw(target, node, span)
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => self.lower_if(cond, then_body, else_body.as_ref(), span),
            StmtKind::While { label, cond, body } => {
                self.lower_while(label.clone(), cond, body, span)
            }
            StmtKind::For {
                label,
                binding,
                iterable,
                body,
            } => self.lower_for(label.clone(), binding, iterable, body, span),
            StmtKind::Switch { scrutinee, arms } => self.lower_switch(scrutinee, arms, span),
            StmtKind::Return(value) => self.lower_return(value.as_ref(), span),
            StmtKind::Break { label } => {
                let (_, exit, dd, cd) = self
                    .loop_frame(label.as_ref())
                    .ok_or_else(|| err("break outside of a loop"))?;
                self.emit_cleanups_above(cd, span);
                self.run_defers_above(dd, false, span)?;
                self.fb.set_term(IrTerm::Jump(exit));
                Ok(())
            }
            StmtKind::Continue { label } => {
                let (cont, _, dd, cd) = self
                    .loop_frame(label.as_ref())
                    .ok_or_else(|| err("continue outside of a loop"))?;
                self.emit_cleanups_above(cd, span);
                self.run_defers_above(dd, false, span)?;
                self.fb.set_term(IrTerm::Jump(cont));
                Ok(())
            }
            StmtKind::Defer(body) => {
                self.push_defer(body, false);
                Ok(())
            }
            StmtKind::Errdefer(body) => {
                self.push_defer(body, true);
                Ok(())
            }
            StmtKind::Expr(e) => {
                self.lower_expr(e)?;
                Ok(())
            }
            StmtKind::Block(b) => self.lower_scoped_block(b, span),
        }
    }

    fn lower_let(
        &mut self,
        name: &str,
        ty: TypeIndex,
        init: &Expr,
        weak: bool,
        span: Span,
    ) -> Result<(), CompileError> {
        if self.is_aggregate(ty) {
            // Aggregate initializer evaluates to an address; copy it into
            // the new slot.
            let src = self.lower_expr(init)?;
            let size = self.types.size_of(ty);
            let local = self.fb.add_local(name, ty, size);
            let dst = self.fb.emit_local_addr(local, span);
            self.fb.emit(
                IrOp::MemCopy { bytes: size },
                vec![dst, src.node],
                TypeIndex::VOID,
                span,
            );
            self.bind(name, local);
            return Ok(());
        }
        let mv = self.lower_expr(init)?;
        let size = self.types.size_of(ty);
        let local = self.fb.add_local(name, ty, size);
        if weak {
            self.weak_locals.insert(local);
        }
        // A strong binding of a borrowed managed value takes its own +1;
        // weak bindings store without retaining and register no cleanup.
        let node = if self.types.is_managed(ty) && !self.weak_locals.contains(&local) && !mv.is_owned()
        {
            let retained = self.emit_runtime_call("cot_retain", vec![mv.node], ty, span);
            self.cleanups.push(CleanupKind::Release, retained, ty);
            retained
        } else {
            mv.node
        };
        self.fb.emit_store_local(local, node, span);
        self.bind(name, local);
        Ok(())
    }

    /// Assignment dispatch. The shapes and their ARC discipline:
    ///
    /// - simple local: store_local
    /// - field of a local struct: store_local_field
    /// - list/map element: load-old / retain-new / store-new / release-old
    /// - through a pointer: ptr_store, with the same four-step sequence
    ///   when the pointee is ARC-managed
    fn lower_assign(
        &mut self,
        target: &Expr,
        value: &Expr,
        span: Span,
    ) -> Result<(), CompileError> {
        match &target.kind {
            ExprKind::Ident(name) => {
                if let Some(local) = self.lookup_local(name) {
                    if self.is_aggregate(target.ty) {
                        let src = self.lower_expr(value)?;
                        let size = self.types.size_of(target.ty);
                        let dst = if self.byref_params.contains(&local) {
                            self.fb.emit_load_local(local, span)
                        } else {
                            self.fb.emit_local_addr(local, span)
                        };
                        self.fb.emit(
                            IrOp::MemCopy { bytes: size },
                            vec![dst, src.node],
                            TypeIndex::VOID,
                            span,
                        );
                        return Ok(());
                    }
                    let mv = self.lower_expr(value)?;
                    self.fb.emit_store_local(local, mv.node, span);
                    return Ok(());
                }
                // Module-level variable.
                if self.global_types.contains_key(name) {
                    let mv = self.lower_expr(value)?;
                    let addr = self.fb.emit(
                        IrOp::GlobalAddr(name.clone()),
                        vec![],
                        TypeIndex::I64,
                        span,
                    );
                    self.fb.emit(
                        IrOp::PtrStore { offset: 0 },
                        vec![addr, mv.node],
                        TypeIndex::VOID,
                        span,
                    );
                    return Ok(());
                }
                Err(err(format!("assignment to unknown name '{}'", name)))
            }
            ExprKind::Field { base, offset, .. } => {
                // Field of a plain local struct keeps the dedicated op.
                if let ExprKind::Ident(name) = &base.kind {
                    if let Some(local) = self.lookup_local(name) {
                        if !self.types.is_pointer(base.ty) && !self.byref_params.contains(&local) {
                            let mv = self.lower_expr(value)?;
                            self.fb.emit(
                                IrOp::StoreLocalField {
                                    local,
                                    offset: *offset,
                                },
                                vec![mv.node],
                                TypeIndex::VOID,
                                span,
                            );
                            return Ok(());
                        }
                    }
                }
                let base_addr = self.lvalue_base_addr(base, span)?;
                self.store_through_pointer(base_addr, *offset, target.ty, value, span)
            }
            ExprKind::Index { base, index } => self.lower_index_assign(base, index, value, span),
            ExprKind::Deref(inner) => {
                let addr = self.lower_expr(inner)?.node;
                self.store_through_pointer(addr, 0, target.ty, value, span)
            }
            _ => Err(err("invalid assignment target")),
        }
    }

    /// Store through a pointer; managed slots follow the
    /// load-old/retain-new/store-new/release-old discipline so that
    /// self-assignment cannot free the value first.
    fn store_through_pointer(
        &mut self,
        addr: NodeIndex,
        offset: u32,
        slot_ty: TypeIndex,
        value: &Expr,
        span: Span,
    ) -> Result<(), CompileError> {
        if self.is_aggregate(slot_ty) {
            let src = self.lower_expr(value)?;
            let size = self.types.size_of(slot_ty);
            let dst = if offset == 0 {
                addr
            } else {
                let off = self.fb.emit_const_int(offset as i64, TypeIndex::I64, span);
                self.fb
                    .emit(IrOp::Binary(BinOp::Add), vec![addr, off], TypeIndex::I64, span)
            };
            self.fb.emit(
                IrOp::MemCopy { bytes: size },
                vec![dst, src.node],
                TypeIndex::VOID,
                span,
            );
            return Ok(());
        }
        if self.types.is_managed(slot_ty) {
            let old = self
                .fb
                .emit(IrOp::PtrLoad { offset }, vec![addr], slot_ty, span);
            let mv = self.lower_expr(value)?;
            let new = self.owning_store_value(mv, slot_ty, span);
            self.fb.emit(
                IrOp::PtrStore { offset },
                vec![addr, new],
                TypeIndex::VOID,
                span,
            );
            self.emit_runtime_call("cot_release", vec![old], TypeIndex::VOID, span);
            return Ok(());
        }
        let mv = self.lower_expr(value)?;
        self.fb.emit(
            IrOp::PtrStore { offset },
            vec![addr, mv.node],
            TypeIndex::VOID,
            span,
        );
        Ok(())
    }

    /// A value entering an owning slot either forwards its existing +1 or
    /// gets retained.
    pub(crate) fn owning_store_value(
        &mut self,
        mv: super::ManagedValue,
        ty: TypeIndex,
        span: Span,
    ) -> NodeIndex {
        if !self.types.is_managed(ty) {
            return mv.node;
        }
        if mv.is_owned() {
            return mv.forward(&mut self.cleanups);
        }
        self.emit_runtime_call("cot_retain", vec![mv.node], ty, span)
    }

    fn lower_index_assign(
        &mut self,
        base: &Expr,
        index: &Expr,
        value: &Expr,
        span: Span,
    ) -> Result<(), CompileError> {
        match self.types.kind(base.ty).clone() {
            TypeKind::List { elem } => {
                let list = self.lower_expr(base)?.node;
                let idx = self.lower_expr(index)?.node;
                if self.types.is_managed(elem) {
                    let old = self.emit_runtime_call("cot_list_get", vec![list, idx], elem, span);
                    let mv = self.lower_expr(value)?;
                    let new = self.owning_store_value(mv, elem, span);
                    self.emit_runtime_call(
                        "cot_list_set",
                        vec![list, idx, new],
                        TypeIndex::VOID,
                        span,
                    );
                    self.emit_runtime_call("cot_release", vec![old], TypeIndex::VOID, span);
                } else {
                    let mv = self.lower_expr(value)?;
                    self.emit_runtime_call(
                        "cot_list_set",
                        vec![list, idx, mv.node],
                        TypeIndex::VOID,
                        span,
                    );
                }
                Ok(())
            }
            TypeKind::Map { value: vty, .. } => {
                let map = self.lower_expr(base)?.node;
                let key = self.lower_expr(index)?.node;
                if self.types.is_managed(vty) {
                    let old = self.emit_runtime_call("cot_map_get", vec![map, key], vty, span);
                    let mv = self.lower_expr(value)?;
                    let new = self.owning_store_value(mv, vty, span);
                    self.emit_runtime_call(
                        "cot_map_set",
                        vec![map, key, new],
                        TypeIndex::VOID,
                        span,
                    );
                    self.emit_runtime_call("cot_release", vec![old], TypeIndex::VOID, span);
                } else {
                    let mv = self.lower_expr(value)?;
                    self.emit_runtime_call(
                        "cot_map_set",
                        vec![map, key, mv.node],
                        TypeIndex::VOID,
                        span,
                    );
                }
                Ok(())
            }
            TypeKind::String | TypeKind::Slice { .. } => {
                let elem = self.types.elem_of(base.ty).unwrap_or(TypeIndex::U8);
                let elem_size = self.types.size_of(elem).max(1);
                let s = self.lower_expr(base)?.node;
                let ptr = self.fb.emit(IrOp::StringPtr, vec![s], TypeIndex::I64, span);
                let idx = self.lower_expr(index)?.node;
                let addr = self.fb.emit(
                    IrOp::IndexAddr { elem_size },
                    vec![ptr, idx],
                    TypeIndex::I64,
                    span,
                );
                let mv = self.lower_expr(value)?;
                self.fb.emit(
                    IrOp::PtrStore { offset: 0 },
                    vec![addr, mv.node],
                    TypeIndex::VOID,
                    span,
                );
                Ok(())
            }
            TypeKind::Array { elem, .. } => {
                let elem_size = self.types.size_of(elem).max(1);
                let base_addr = self.lvalue_base_addr(base, span)?;
                let idx = self.lower_expr(index)?.node;
                let addr = self.fb.emit(
                    IrOp::IndexAddr { elem_size },
                    vec![base_addr, idx],
                    TypeIndex::I64,
                    span,
                );
                let mv = self.lower_expr(value)?;
                self.fb.emit(
                    IrOp::PtrStore { offset: 0 },
                    vec![addr, mv.node],
                    TypeIndex::VOID,
                    span,
                );
                Ok(())
            }
            _ => Err(err("cannot index-assign into this type")),
        }
    }

    /// Address of an lvalue base used by field/index stores.
    pub(crate) fn lvalue_base_addr(
        &mut self,
        base: &Expr,
        span: Span,
    ) -> Result<NodeIndex, CompileError> {
        if self.types.is_pointer(base.ty) {
            return Ok(self.lower_expr(base)?.node);
        }
        match &base.kind {
            ExprKind::Ident(name) => {
                if let Some(local) = self.lookup_local(name) {
                    if self.byref_params.contains(&local) {
                        Ok(self.fb.emit_load_local(local, span))
                    } else {
                        Ok(self.fb.emit_local_addr(local, span))
                    }
                } else if self.global_types.contains_key(name) {
                    Ok(self
                        .fb
                        .emit(IrOp::GlobalAddr(name.clone()), vec![], TypeIndex::I64, span))
                } else {
                    Err(err(format!("unknown name '{}'", name)))
                }
            }
            ExprKind::Deref(inner) => Ok(self.lower_expr(inner)?.node),
            ExprKind::Field { base: b2, offset, .. } => {
                let inner = self.lvalue_base_addr(b2, span)?;
                let off = self.fb.emit_const_int(*offset as i64, TypeIndex::I64, span);
                Ok(self
                    .fb
                    .emit(IrOp::Binary(BinOp::Add), vec![inner, off], TypeIndex::I64, span))
            }
            // Aggregate-producing expressions already evaluate to addresses.
            _ if self.is_aggregate(base.ty) => Ok(self.lower_expr(base)?.node),
            _ => Err(err("expression has no address")),
        }
    }

    /// Read the current value of an lvalue (compound assignment).
    fn read_lvalue(&mut self, target: &Expr, span: Span) -> Result<NodeIndex, CompileError> {
        match &target.kind {
            ExprKind::Ident(name) => {
                if let Some(local) = self.lookup_local(name) {
                    return Ok(self.fb.emit_load_local(local, span));
                }
                if self.global_types.contains_key(name) {
                    let addr = self.fb.emit(
                        IrOp::GlobalAddr(name.clone()),
                        vec![],
                        TypeIndex::I64,
                        span,
                    );
                    return Ok(self
                        .fb
                        .emit(IrOp::PtrLoad { offset: 0 }, vec![addr], target.ty, span));
                }
                Err(err(format!("unknown name '{}'", name)))
            }
            ExprKind::Field { base, offset, .. } => {
                let addr = self.lvalue_base_addr(base, span)?;
                Ok(self
                    .fb
                    .emit(IrOp::PtrLoad { offset: *offset }, vec![addr], target.ty, span))
            }
            ExprKind::Deref(inner) => {
                let addr = self.lower_expr(inner)?.node;
                Ok(self
                    .fb
                    .emit(IrOp::PtrLoad { offset: 0 }, vec![addr], target.ty, span))
            }
            _ => Err(err("unsupported compound assignment target")),
        }
    }

    /// Store a value through an lvalue without the ARC retain/release
    /// discipline. Used by compound assignment and by the container
    /// handle write-back after a growing push/set.
    pub(crate) fn write_lvalue_raw(
        &mut self,
        target: &Expr,
        node: NodeIndex,
        span: Span,
    ) -> Result<(), CompileError> {
        match &target.kind {
            ExprKind::Ident(name) => {
                if let Some(local) = self.lookup_local(name) {
                    self.fb.emit_store_local(local, node, span);
                    return Ok(());
                }
                if self.global_types.contains_key(name) {
                    let addr = self.fb.emit(
                        IrOp::GlobalAddr(name.clone()),
                        vec![],
                        TypeIndex::I64,
                        span,
                    );
                    self.fb.emit(
                        IrOp::PtrStore { offset: 0 },
                        vec![addr, node],
                        TypeIndex::VOID,
                        span,
                    );
                    return Ok(());
                }
                Err(err(format!("unknown name '{}'", name)))
            }
            ExprKind::Field { base, offset, .. } => {
                let addr = self.lvalue_base_addr(base, span)?;
                self.fb.emit(
                    IrOp::PtrStore { offset: *offset },
                    vec![addr, node],
                    TypeIndex::VOID,
                    span,
                );
                Ok(())
            }
            ExprKind::Deref(inner) => {
                let addr = self.lower_expr(inner)?.node;
                self.fb.emit(
                    IrOp::PtrStore { offset: 0 },
                    vec![addr, node],
                    TypeIndex::VOID,
                    span,
                );
                Ok(())
            }
            ExprKind::Index { base, index } => match self.types.kind(base.ty).clone() {
                TypeKind::List { .. } => {
                    let list = self.lower_expr(base)?.node;
                    let idx = self.lower_expr(index)?.node;
                    self.emit_runtime_call(
                        "cot_list_set",
                        vec![list, idx, node],
                        TypeIndex::VOID,
                        span,
                    );
                    Ok(())
                }
                TypeKind::Map { .. } => {
                    let map = self.lower_expr(base)?.node;
                    let key = self.lower_expr(index)?.node;
                    // Overwriting an existing key never grows the map.
                    self.emit_runtime_call("cot_map_set", vec![map, key, node], base.ty, span);
                    Ok(())
                }
                TypeKind::String | TypeKind::Slice { .. } => {
                    let elem = self.types.elem_of(base.ty).unwrap_or(TypeIndex::U8);
                    let elem_size = self.types.size_of(elem).max(1);
                    let s = self.lower_expr(base)?.node;
                    let ptr = self.fb.emit(IrOp::StringPtr, vec![s], TypeIndex::I64, span);
                    let idx = self.lower_expr(index)?.node;
                    let addr = self.fb.emit(
                        IrOp::IndexAddr { elem_size },
                        vec![ptr, idx],
                        TypeIndex::I64,
                        span,
                    );
                    self.fb.emit(
                        IrOp::PtrStore { offset: 0 },
                        vec![addr, node],
                        TypeIndex::VOID,
                        span,
                    );
                    Ok(())
                }
                TypeKind::Array { elem, .. } => {
                    let elem_size = self.types.size_of(elem).max(1);
                    let base_addr = self.lvalue_base_addr(base, span)?;
                    let idx = self.lower_expr(index)?.node;
                    let addr = self.fb.emit(
                        IrOp::IndexAddr { elem_size },
                        vec![base_addr, idx],
                        TypeIndex::I64,
                        span,
                    );
                    self.fb.emit(
                        IrOp::PtrStore { offset: 0 },
                        vec![addr, node],
                        TypeIndex::VOID,
                        span,
                    );
                    Ok(())
                }
                _ => Err(err("cannot store through this index expression")),
            },
            _ => Err(err("unsupported compound assignment target")),
        }
    }

    fn lower_if(
        &mut self,
        cond: &Expr,
        then_body: &BlockStmt,
        else_body: Option<&BlockStmt>,
        span: Span,
    ) -> Result<(), CompileError> {
        let cond_node = self.lower_expr(cond)?.node;
        let then_b = self.fb.new_block();
        let merge = self.fb.new_block();
        let else_b = if else_body.is_some() {
            self.fb.new_block()
        } else {
            merge
        };
        self.fb.set_term(IrTerm::Branch {
            cond: cond_node,
            then_blk: then_b,
            else_blk: else_b,
        });

        self.fb.switch_to(then_b);
        self.lower_scoped_block(then_body, span)?;
        if !self.fb.is_terminated() {
            self.fb.set_term(IrTerm::Jump(merge));
        }

        if let Some(eb) = else_body {
            self.fb.switch_to(else_b);
            self.lower_scoped_block(eb, span)?;
            if !self.fb.is_terminated() {
                self.fb.set_term(IrTerm::Jump(merge));
            }
        }

        self.fb.switch_to(merge);
        Ok(())
    }

    fn lower_while(
        &mut self,
        label: Option<String>,
        cond: &Expr,
        body: &BlockStmt,
        span: Span,
    ) -> Result<(), CompileError> {
        let header = self.fb.new_block();
        let body_b = self.fb.new_block();
        let exit = self.fb.new_block();
        self.fb.set_term(IrTerm::Jump(header));

        self.fb.switch_to(header);
        let cond_node = self.lower_expr(cond)?.node;
        self.fb.set_term(IrTerm::Branch {
            cond: cond_node,
            then_blk: body_b,
            else_blk: exit,
        });

        self.push_loop(header, exit, label);
        self.fb.switch_to(body_b);
        self.lower_scoped_block(body, span)?;
        if !self.fb.is_terminated() {
            self.fb.set_term(IrTerm::Jump(header));
        }
        self.pop_loop();

        self.fb.switch_to(exit);
        Ok(())
    }

    /// `for item in iter` desugars to an index-increment while loop; the
    /// continue target is the increment block.
    fn lower_for(
        &mut self,
        label: Option<String>,
        binding: &str,
        iterable: &Expr,
        body: &BlockStmt,
        span: Span,
    ) -> Result<(), CompileError> {
        let iter_ty = iterable.ty;
        let (elem_ty, is_list) = match self.types.kind(iter_ty).clone() {
            TypeKind::List { elem } => (elem, true),
            TypeKind::String => (TypeIndex::U8, false),
            TypeKind::Slice { elem } => (elem, false),
            _ => return Err(err("for loops iterate lists, slices, or strings")),
        };

        // Hoist the iterable and its length.
        let iter_mv = self.lower_expr(iterable)?;
        let iter_name = self.fresh_temp("iter");
        let iter_size = self.types.size_of(iter_ty);
        let iter_local = self.fb.add_local(&iter_name, iter_ty, iter_size);
        self.fb.emit_store_local(iter_local, iter_mv.node, span);

        let len = if is_list {
            let it = self.fb.emit_load_local(iter_local, span);
            self.emit_runtime_call("cot_list_len", vec![it], TypeIndex::I64, span)
        } else {
            let it = self.fb.emit_load_local(iter_local, span);
            self.fb.emit(IrOp::StringLen, vec![it], TypeIndex::I64, span)
        };
        let idx_name = self.fresh_temp("idx");
        let idx_local = self.fb.add_local(&idx_name, TypeIndex::I64, 8);
        let zero = self.fb.emit_const_int(0, TypeIndex::I64, span);
        self.fb.emit_store_local(idx_local, zero, span);

        let header = self.fb.new_block();
        let body_b = self.fb.new_block();
        let incr = self.fb.new_block();
        let exit = self.fb.new_block();
        self.fb.set_term(IrTerm::Jump(header));

        self.fb.switch_to(header);
        let i = self.fb.emit_load_local(idx_local, span);
        let cond = self
            .fb
            .emit(IrOp::Binary(BinOp::Lt), vec![i, len], TypeIndex::BOOL, span);
        self.fb.set_term(IrTerm::Branch {
            cond,
            then_blk: body_b,
            else_blk: exit,
        });

        self.push_loop(incr, exit, label);
        self.fb.switch_to(body_b);
        self.push_scope();
        let cleanup_depth = self.cleanups.depth();
        let defer_depth = self.defer_depth();

        let i2 = self.fb.emit_load_local(idx_local, span);
        let elem_node = if is_list {
            let it = self.fb.emit_load_local(iter_local, span);
            self.emit_runtime_call("cot_list_get", vec![it, i2], elem_ty, span)
        } else {
            let it = self.fb.emit_load_local(iter_local, span);
            let ptr = self.fb.emit(IrOp::StringPtr, vec![it], TypeIndex::I64, span);
            let elem_size = self.types.size_of(elem_ty).max(1);
            let addr = self.fb.emit(
                IrOp::IndexAddr { elem_size },
                vec![ptr, i2],
                TypeIndex::I64,
                span,
            );
            self.fb
                .emit(IrOp::PtrLoad { offset: 0 }, vec![addr], elem_ty, span)
        };
        let elem_size = self.types.size_of(elem_ty).max(1);
        let item_local = self.fb.add_local(binding, elem_ty, elem_size);
        self.fb.emit_store_local(item_local, elem_node, span);
        self.bind(binding, item_local);

        self.lower_stmts(body)?;
        if !self.fb.is_terminated() {
            self.emit_cleanups_above(cleanup_depth, span);
            self.run_defers_above(defer_depth, false, span)?;
            self.fb.set_term(IrTerm::Jump(incr));
        }
        self.cleanups.truncate(cleanup_depth);
        self.defer_stack.truncate(defer_depth);
        self.pop_scope();
        self.pop_loop();

        self.fb.switch_to(incr);
        let i3 = self.fb.emit_load_local(idx_local, span);
        let one = self.fb.emit_const_int(1, TypeIndex::I64, span);
        let next = self
            .fb
            .emit(IrOp::Binary(BinOp::Add), vec![i3, one], TypeIndex::I64, span);
        self.fb.emit_store_local(idx_local, next, span);
        self.fb.set_term(IrTerm::Jump(header));

        self.fb.switch_to(exit);
        Ok(())
    }

    /// Switch lowers to a cascade of equality tests. Union scrutinees
    /// compare the tag word; arms that capture a payload bind a local to
    /// the extracted payload. A variant pattern that fails to resolve
    /// jumps to the next arm instead of silently falling through.
    fn lower_switch(
        &mut self,
        scrutinee: &Expr,
        arms: &[SwitchArm],
        span: Span,
    ) -> Result<(), CompileError> {
        let union_ty = match self.types.kind(scrutinee.ty) {
            TypeKind::Union { .. } => Some(scrutinee.ty),
            TypeKind::Pointer { elem } => {
                let elem = *elem;
                match self.types.kind(elem) {
                    TypeKind::Union { .. } => Some(elem),
                    _ => None,
                }
            }
            _ => None,
        };

        // Union values arrive as an address; scalars as the value itself.
        let (tag, payload_base) = if let Some(_u) = union_ty {
            let addr = if self.types.is_pointer(scrutinee.ty) {
                self.lower_expr(scrutinee)?.node
            } else {
                self.lvalue_base_addr(scrutinee, span)?
            };
            let tag = self
                .fb
                .emit(IrOp::PtrLoad { offset: 0 }, vec![addr], TypeIndex::I64, span);
            (tag, Some(addr))
        } else {
            (self.lower_expr(scrutinee)?.node, None)
        };

        let merge = self.fb.new_block();
        for (i, arm) in arms.iter().enumerate() {
            let is_last = i + 1 == arms.len();
            let body_b = self.fb.new_block();
            let next_b = if is_last { merge } else { self.fb.new_block() };

            let mut payload: Option<(TypeIndex, NodeIndex)> = None;
            match &arm.pattern {
                Pattern::Else => {
                    self.fb.set_term(IrTerm::Jump(body_b));
                }
                Pattern::Int(v) => {
                    let c = self.fb.emit_const_int(*v, TypeIndex::I64, span);
                    let cond = self
                        .fb
                        .emit(IrOp::Binary(BinOp::Eq), vec![tag, c], TypeIndex::BOOL, span);
                    self.fb.set_term(IrTerm::Branch {
                        cond,
                        then_blk: body_b,
                        else_blk: next_b,
                    });
                }
                Pattern::EnumVariant { value, .. } => {
                    let c = self.fb.emit_const_int(*value, TypeIndex::I64, span);
                    let cond = self
                        .fb
                        .emit(IrOp::Binary(BinOp::Eq), vec![tag, c], TypeIndex::BOOL, span);
                    self.fb.set_term(IrTerm::Branch {
                        cond,
                        then_blk: body_b,
                        else_blk: next_b,
                    });
                }
                Pattern::UnionVariant { name } => {
                    let resolved =
                        union_ty.and_then(|u| self.types.union_variant(u, name));
                    match resolved {
                        Some((tag_value, payload_ty)) => {
                            let c = self.fb.emit_const_int(tag_value, TypeIndex::I64, span);
                            let cond = self.fb.emit(
                                IrOp::Binary(BinOp::Eq),
                                vec![tag, c],
                                TypeIndex::BOOL,
                                span,
                            );
                            self.fb.set_term(IrTerm::Branch {
                                cond,
                                then_blk: body_b,
                                else_blk: next_b,
                            });
                            if let (Some(pty), Some(base)) = (payload_ty, payload_base) {
                                payload = Some((pty, base));
                            }
                        }
                        None => {
                            // Unresolved variant: jump to the next arm.
                            self.fb.set_term(IrTerm::Jump(next_b));
                        }
                    }
                }
            }

            self.fb.switch_to(body_b);
            self.push_scope();
            let cleanup_depth = self.cleanups.depth();
            let defer_depth = self.defer_depth();
            if let (Some(binding), Some((pty, base))) = (&arm.binding, payload) {
                let node = if self.is_aggregate(pty) {
                    let off = self.fb.emit_const_int(8, TypeIndex::I64, span);
                    self.fb
                        .emit(IrOp::Binary(BinOp::Add), vec![base, off], TypeIndex::I64, span)
                } else {
                    self.fb
                        .emit(IrOp::PtrLoad { offset: 8 }, vec![base], pty, span)
                };
                let (local_ty, size) = if self.is_aggregate(pty) {
                    (TypeIndex::I64, 8)
                } else {
                    (pty, self.types.size_of(pty))
                };
                let local = self.fb.add_local(binding, local_ty, size);
                if self.is_aggregate(pty) {
                    self.byref_params.insert(local);
                }
                self.fb.emit_store_local(local, node, span);
                self.bind(binding, local);
            }
            self.lower_stmts(&arm.body)?;
            if !self.fb.is_terminated() {
                self.emit_cleanups_above(cleanup_depth, span);
                self.run_defers_above(defer_depth, false, span)?;
                self.fb.set_term(IrTerm::Jump(merge));
            }
            self.cleanups.truncate(cleanup_depth);
            self.defer_stack.truncate(defer_depth);
            self.pop_scope();

            if !is_last {
                self.fb.switch_to(next_b);
            }
        }
        self.fb.switch_to(merge);
        Ok(())
    }

    fn lower_return(
        &mut self,
        value: Option<&Expr>,
        span: Span,
    ) -> Result<(), CompileError> {
        let node_opt = match value {
            None => None,
            Some(e) => {
                if self.has_sret {
                    let src = self.lower_expr(e)?.node;
                    let sret_local = self
                        .lookup_local("__sret")
                        .ok_or_else(|| err("missing sret slot"))?;
                    let dst = self.fb.emit_load_local(sret_local, span);
                    let size = self.types.size_of(self.ret_ty);
                    self.fb.emit(
                        IrOp::MemCopy { bytes: size },
                        vec![dst, src],
                        TypeIndex::VOID,
                        span,
                    );
                    Some(dst)
                } else {
                    let mv = self.lower_expr(e)?;
                    let mut node = mv.forward(&mut self.cleanups);
                    // `return payload` in an error-union function wraps in
                    // the ok arm.
                    if matches!(self.types.kind(self.ret_ty), TypeKind::ErrorUnion { .. })
                        && e.ty != self.ret_ty
                    {
                        let zero = self.fb.emit_const_int(0, TypeIndex::I64, span);
                        node = self
                            .fb
                            .emit(IrOp::PairMake, vec![zero, node], self.ret_ty, span);
                    }
                    Some(node)
                }
            }
        };
        self.emit_cleanups_above(0, span);
        self.run_defers_above(0, false, span)?;
        self.fb.set_term(IrTerm::Return(node_opt));
        Ok(())
    }
}
