//! Expression lowering.
//!
//! Expressions evaluate to a [`ManagedValue`]: the IR node plus the
//! cleanup handle for +1 results. Aggregates wider than a pair evaluate
//! to the address of a stack slot; pairs (strings, slices, error unions)
//! and scalars evaluate to value nodes.

use super::{err, CleanupKind, Lowerer, ManagedValue};
use crate::ast::{BinOp, BlockStmt, Expr, ExprKind, FieldInit, GenericInstance, UnOp};
use crate::diag::Span;
use crate::error::CompileError;
use crate::ir::{IrOp, IrTerm, NodeIndex};
use crate::types::{TypeIndex, TypeKind};

impl<'a> Lowerer<'a> {
    pub(crate) fn lower_expr(&mut self, e: &Expr) -> Result<ManagedValue, CompileError> {
        let span = e.span;
        match &e.kind {
            ExprKind::IntLit(v) => Ok(ManagedValue::for_trivial(
                self.fb.emit_const_int(*v, e.ty, span),
            )),
            ExprKind::FloatLit(v) => Ok(ManagedValue::for_trivial(self.fb.emit(
                IrOp::ConstFloat(*v),
                vec![],
                e.ty,
                span,
            ))),
            ExprKind::BoolLit(v) => {
                Ok(ManagedValue::for_trivial(self.fb.emit_const_bool(*v, span)))
            }
            ExprKind::StringLit(s) => {
                let idx = self.module.intern_string(s);
                Ok(ManagedValue::for_trivial(self.fb.emit(
                    IrOp::ConstString(idx),
                    vec![],
                    TypeIndex::STRING,
                    span,
                )))
            }
            ExprKind::NullLit => {
                if self.types.is_pair(e.ty) {
                    let a = self.fb.emit_const_int(0, TypeIndex::I64, span);
                    let b = self.fb.emit_const_int(0, TypeIndex::I64, span);
                    Ok(ManagedValue::for_trivial(self.fb.emit(
                        IrOp::PairMake,
                        vec![a, b],
                        e.ty,
                        span,
                    )))
                } else {
                    Ok(ManagedValue::for_trivial(
                        self.fb.emit_const_int(0, e.ty, span),
                    ))
                }
            }
            ExprKind::Ident(name) => self.lower_ident(name, e.ty, span),
            ExprKind::Binary { op, lhs, rhs } => self.lower_binary(*op, lhs, rhs, e.ty, span),
            ExprKind::Logical { and, lhs, rhs } => self.lower_logical(*and, lhs, rhs, span),
            ExprKind::Unary { op, operand } => {
                let mv = self.lower_expr(operand)?;
                match op {
                    UnOp::BitNot => {
                        let minus_one = self.fb.emit_const_int(-1, e.ty, span);
                        Ok(ManagedValue::for_trivial(self.fb.emit(
                            IrOp::Binary(BinOp::BitXor),
                            vec![mv.node, minus_one],
                            e.ty,
                            span,
                        )))
                    }
                    _ => Ok(ManagedValue::for_trivial(self.fb.emit(
                        IrOp::Unary(*op),
                        vec![mv.node],
                        e.ty,
                        span,
                    ))),
                }
            }
            ExprKind::Call {
                name,
                args,
                instance,
            } => self.lower_call(name, args, instance.as_deref(), e.ty, span),
            ExprKind::MethodCall {
                recv,
                recv_type,
                method,
                args,
            } => self.lower_method_call(recv, recv_type, method, args, e.ty, span),
            ExprKind::Builtin { name, args } => self.lower_builtin(name, args, e.ty, span),
            ExprKind::Field { base, offset, .. } => self.lower_field_read(base, *offset, e.ty, span),
            ExprKind::Index { base, index } => self.lower_index_read(base, index, e.ty, span),
            ExprKind::New { ty, fields } => self.lower_new(*ty, fields, e.ty, span),
            ExprKind::StructLit { ty, fields } => self.lower_struct_lit(*ty, fields, span),
            ExprKind::UnionLit {
                ty,
                variant,
                payload,
            } => self.lower_union_lit(*ty, variant, payload.as_deref(), span),
            ExprKind::EnumLit { value, .. } => Ok(ManagedValue::for_trivial(
                self.fb.emit_const_int(*value, e.ty, span),
            )),
            ExprKind::ListLit { elem, items } => self.lower_list_lit(*elem, items, e.ty, span),
            ExprKind::Try(inner) => self.lower_try(inner, e.ty, span),
            ExprKind::Catch {
                expr,
                binding,
                handler,
            } => self.lower_catch(expr, binding.as_deref(), handler, e.ty, span),
            ExprKind::ErrorValue { tag, .. } => {
                if matches!(self.types.kind(e.ty), TypeKind::ErrorUnion { .. }) {
                    let t = self.fb.emit_const_int(*tag, TypeIndex::I64, span);
                    let z = self.fb.emit_const_int(0, TypeIndex::I64, span);
                    Ok(ManagedValue::for_trivial(self.fb.emit(
                        IrOp::PairMake,
                        vec![t, z],
                        e.ty,
                        span,
                    )))
                } else {
                    Ok(ManagedValue::for_trivial(
                        self.fb.emit_const_int(*tag, e.ty, span),
                    ))
                }
            }
            ExprKind::Cast(inner) => {
                let mv = self.lower_expr(inner)?;
                Ok(ManagedValue::for_trivial(self.fb.emit(
                    IrOp::Cast,
                    vec![mv.node],
                    e.ty,
                    span,
                )))
            }
            ExprKind::Deref(inner) => {
                let mv = self.lower_expr(inner)?;
                if self.is_aggregate(e.ty) {
                    // Dereferencing to an aggregate keeps the address.
                    Ok(ManagedValue::for_trivial(mv.node))
                } else {
                    Ok(ManagedValue::for_trivial(self.fb.emit(
                        IrOp::PtrLoad { offset: 0 },
                        vec![mv.node],
                        e.ty,
                        span,
                    )))
                }
            }
        }
    }

    fn lower_ident(
        &mut self,
        name: &str,
        ty: TypeIndex,
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        if let Some(local) = self.lookup_local(name) {
            if self.is_aggregate(ty) {
                let node = if self.byref_params.contains(&local) {
                    self.fb.emit_load_local(local, span)
                } else {
                    self.fb.emit_local_addr(local, span)
                };
                return Ok(ManagedValue::for_trivial(node));
            }
            return Ok(ManagedValue::for_trivial(
                self.fb.emit_load_local(local, span),
            ));
        }
        if let Some(cv) = self.consts.get(name).cloned() {
            let node = self.const_to_node(&cv, ty, span);
            return Ok(ManagedValue::for_trivial(node));
        }
        if self.global_types.contains_key(name) {
            let addr = self
                .fb
                .emit(IrOp::GlobalAddr(name.to_string()), vec![], TypeIndex::I64, span);
            if self.is_aggregate(ty) {
                return Ok(ManagedValue::for_trivial(addr));
            }
            return Ok(ManagedValue::for_trivial(self.fb.emit(
                IrOp::PtrLoad { offset: 0 },
                vec![addr],
                ty,
                span,
            )));
        }
        Err(err(format!("unknown name '{}'", name)))
    }

    fn lower_binary(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        result_ty: TypeIndex,
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        if lhs.ty == TypeIndex::STRING || self.types.is_slice_like(lhs.ty) {
            match op {
                BinOp::Concat => {
                    let a = self.lower_expr(lhs)?;
                    let b = self.lower_expr(rhs)?;
                    return Ok(ManagedValue::for_trivial(self.fb.emit(
                        IrOp::StringConcat,
                        vec![a.node, b.node],
                        TypeIndex::STRING,
                        span,
                    )));
                }
                BinOp::Eq | BinOp::Ne => {
                    let a = self.lower_expr(lhs)?;
                    let b = self.lower_expr(rhs)?;
                    let ap = self.fb.emit(IrOp::StringPtr, vec![a.node], TypeIndex::I64, span);
                    let al = self.fb.emit(IrOp::StringLen, vec![a.node], TypeIndex::I64, span);
                    let bp = self.fb.emit(IrOp::StringPtr, vec![b.node], TypeIndex::I64, span);
                    let bl = self.fb.emit(IrOp::StringLen, vec![b.node], TypeIndex::I64, span);
                    let eq = self.emit_runtime_call(
                        "cot_string_eq",
                        vec![ap, al, bp, bl],
                        TypeIndex::I64,
                        span,
                    );
                    let want = self
                        .fb
                        .emit_const_int(if op == BinOp::Eq { 1 } else { 0 }, TypeIndex::I64, span);
                    return Ok(ManagedValue::for_trivial(self.fb.emit(
                        IrOp::Binary(BinOp::Eq),
                        vec![eq, want],
                        TypeIndex::BOOL,
                        span,
                    )));
                }
                _ => return Err(err("unsupported string operator")),
            }
        }
        let a = self.lower_expr(lhs)?;
        let b = self.lower_expr(rhs)?;
        Ok(ManagedValue::for_trivial(self.fb.emit(
            IrOp::Binary(op),
            vec![a.node, b.node],
            result_ty,
            span,
        )))
    }

    /// Short-circuit `and`/`or` become branch-based control flow, not a
    /// single binary op.
    fn lower_logical(
        &mut self,
        and: bool,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        let tmp_name = self.fresh_temp("log");
        let tmp = self.fb.add_local(&tmp_name, TypeIndex::BOOL, 1);
        let a = self.lower_expr(lhs)?;
        self.fb.emit_store_local(tmp, a.node, span);
        let rhs_b = self.fb.new_block();
        let merge = self.fb.new_block();
        if and {
            self.fb.set_term(IrTerm::Branch {
                cond: a.node,
                then_blk: rhs_b,
                else_blk: merge,
            });
        } else {
            self.fb.set_term(IrTerm::Branch {
                cond: a.node,
                then_blk: merge,
                else_blk: rhs_b,
            });
        }
        self.fb.switch_to(rhs_b);
        let b = self.lower_expr(rhs)?;
        self.fb.emit_store_local(tmp, b.node, span);
        self.fb.set_term(IrTerm::Jump(merge));
        self.fb.switch_to(merge);
        Ok(ManagedValue::for_trivial(
            self.fb.emit_load_local(tmp, span),
        ))
    }

    fn lower_call(
        &mut self,
        name: &str,
        args: &[Expr],
        instance: Option<&GenericInstance>,
        result_ty: TypeIndex,
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        let name = if let Some(inst) = instance {
            self.queue_generic(&inst.key, &inst.decl);
            inst.decl.name.clone()
        } else {
            name.to_string()
        };
        let sig = self.signature(&name);
        let mut arg_nodes = Vec::with_capacity(args.len() + 1);

        // Aggregate returns go through a hidden caller-owned slot.
        if sig.as_ref().is_some_and(|s| s.sret) {
            let tmp_name = self.fresh_temp("ret");
            let size = self.types.size_of(result_ty);
            let tmp = self.fb.add_local(&tmp_name, result_ty, size);
            let addr = self.fb.emit_local_addr(tmp, span);
            arg_nodes.push(addr);
        }

        for (i, arg) in args.iter().enumerate() {
            let owned_param = sig
                .as_ref()
                .and_then(|s| s.params.get(i))
                .map(|&(_, owned)| owned)
                .unwrap_or(false);
            let mv = self.lower_expr(arg)?;
            let node = if owned_param && self.types.is_managed(arg.ty) {
                self.owning_store_value(mv, arg.ty, span)
            } else {
                mv.node
            };
            arg_nodes.push(node);
        }

        let call = self.fb.emit_call(&name, arg_nodes, result_ty, span);
        if self.types.is_managed(result_ty) && sig.is_some() {
            let handle = self.cleanups.push(CleanupKind::Release, call, result_ty);
            return Ok(ManagedValue::for_owned(call, handle));
        }
        Ok(ManagedValue::for_trivial(call))
    }

    fn lower_method_call(
        &mut self,
        recv: &Expr,
        recv_type: &str,
        method: &str,
        args: &[Expr],
        result_ty: TypeIndex,
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        match self.types.kind(recv.ty).clone() {
            TypeKind::List { elem } => {
                return self.lower_list_method(recv, elem, method, args, result_ty, span)
            }
            TypeKind::Map { value, .. } => {
                return self.lower_map_method(recv, value, method, args, result_ty, span)
            }
            _ => {}
        }
        // User method: `Type_method` with the receiver prepended.
        let fn_name = format!("{}_{}", recv_type, method);
        let sig = self.signature(&fn_name);
        let recv_mv = self.lower_expr(recv)?;
        let mut arg_nodes = vec![recv_mv.node];
        for (i, arg) in args.iter().enumerate() {
            let owned_param = sig
                .as_ref()
                .and_then(|s| s.params.get(i + 1))
                .map(|&(_, owned)| owned)
                .unwrap_or(false);
            let mv = self.lower_expr(arg)?;
            let node = if owned_param && self.types.is_managed(arg.ty) {
                self.owning_store_value(mv, arg.ty, span)
            } else {
                mv.node
            };
            arg_nodes.push(node);
        }
        let call = self.fb.emit_call(&fn_name, arg_nodes, result_ty, span);
        if self.types.is_managed(result_ty) && sig.is_some() {
            let handle = self.cleanups.push(CleanupKind::Release, call, result_ty);
            return Ok(ManagedValue::for_owned(call, handle));
        }
        Ok(ManagedValue::for_trivial(call))
    }

    /// Growing list/map operations return a possibly relocated handle;
    /// store it back through whatever location the receiver names
    /// (local, field, element, pointer). Temporary receivers have no
    /// slot to update.
    fn write_back_handle(
        &mut self,
        recv: &Expr,
        handle: NodeIndex,
        span: Span,
    ) -> Result<(), CompileError> {
        match &recv.kind {
            ExprKind::Ident(_)
            | ExprKind::Field { .. }
            | ExprKind::Index { .. }
            | ExprKind::Deref(_) => self.write_lvalue_raw(recv, handle, span),
            _ => Ok(()),
        }
    }

    fn lower_list_method(
        &mut self,
        recv: &Expr,
        elem: TypeIndex,
        method: &str,
        args: &[Expr],
        result_ty: TypeIndex,
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        let list = self.lower_expr(recv)?.node;
        match method {
            "len" => Ok(ManagedValue::for_trivial(self.emit_runtime_call(
                "cot_list_len",
                vec![list],
                TypeIndex::I64,
                span,
            ))),
            "get" => {
                let idx = self.lower_expr(&args[0])?.node;
                Ok(ManagedValue::for_trivial(self.emit_runtime_call(
                    "cot_list_get",
                    vec![list, idx],
                    result_ty,
                    span,
                )))
            }
            "set" => {
                let idx = self.lower_expr(&args[0])?.node;
                let mv = self.lower_expr(&args[1])?;
                let node = self.owning_store_value(mv, elem, span);
                Ok(ManagedValue::for_trivial(self.emit_runtime_call(
                    "cot_list_set",
                    vec![list, idx, node],
                    TypeIndex::VOID,
                    span,
                )))
            }
            "push" => {
                let mv = self.lower_expr(&args[0])?;
                let node = self.owning_store_value(mv, elem, span);
                let new_list =
                    self.emit_runtime_call("cot_list_push", vec![list, node], recv.ty, span);
                // Growth may move the list; write the handle back.
                self.write_back_handle(recv, new_list, span)?;
                Ok(ManagedValue::for_trivial(new_list))
            }
            _ => Err(err(format!("unknown list method '{}'", method))),
        }
    }

    fn lower_map_method(
        &mut self,
        recv: &Expr,
        value_ty: TypeIndex,
        method: &str,
        args: &[Expr],
        result_ty: TypeIndex,
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        let map = self.lower_expr(recv)?.node;
        match method {
            "get" => {
                let key = self.lower_expr(&args[0])?.node;
                Ok(ManagedValue::for_trivial(self.emit_runtime_call(
                    "cot_map_get",
                    vec![map, key],
                    result_ty,
                    span,
                )))
            }
            "set" => {
                let key = self.lower_expr(&args[0])?.node;
                let mv = self.lower_expr(&args[1])?;
                let node = self.owning_store_value(mv, value_ty, span);
                let new_map =
                    self.emit_runtime_call("cot_map_set", vec![map, key, node], recv.ty, span);
                // A fresh key may grow the map; write the handle back.
                self.write_back_handle(recv, new_map, span)?;
                Ok(ManagedValue::for_trivial(new_map))
            }
            "len" => Ok(ManagedValue::for_trivial(self.emit_runtime_call(
                "cot_map_len",
                vec![map],
                TypeIndex::I64,
                span,
            ))),
            _ => Err(err(format!("unknown map method '{}'", method))),
        }
    }

    fn lower_field_read(
        &mut self,
        base: &Expr,
        offset: u32,
        field_ty: TypeIndex,
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        let addr = self.lvalue_base_addr(base, span)?;
        if self.is_aggregate(field_ty) {
            let off = self.fb.emit_const_int(offset as i64, TypeIndex::I64, span);
            return Ok(ManagedValue::for_trivial(self.fb.emit(
                IrOp::Binary(BinOp::Add),
                vec![addr, off],
                TypeIndex::I64,
                span,
            )));
        }
        Ok(ManagedValue::for_trivial(self.fb.emit(
            IrOp::PtrLoad { offset },
            vec![addr],
            field_ty,
            span,
        )))
    }

    fn lower_index_read(
        &mut self,
        base: &Expr,
        index: &Expr,
        result_ty: TypeIndex,
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        match self.types.kind(base.ty).clone() {
            TypeKind::List { .. } => {
                let list = self.lower_expr(base)?.node;
                let idx = self.lower_expr(index)?.node;
                Ok(ManagedValue::for_trivial(self.emit_runtime_call(
                    "cot_list_get",
                    vec![list, idx],
                    result_ty,
                    span,
                )))
            }
            TypeKind::Map { .. } => {
                let map = self.lower_expr(base)?.node;
                let key = self.lower_expr(index)?.node;
                Ok(ManagedValue::for_trivial(self.emit_runtime_call(
                    "cot_map_get",
                    vec![map, key],
                    result_ty,
                    span,
                )))
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
                Ok(ManagedValue::for_trivial(self.fb.emit(
                    IrOp::PtrLoad { offset: 0 },
                    vec![addr],
                    result_ty,
                    span,
                )))
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
                if self.is_aggregate(result_ty) {
                    return Ok(ManagedValue::for_trivial(addr));
                }
                Ok(ManagedValue::for_trivial(self.fb.emit(
                    IrOp::PtrLoad { offset: 0 },
                    vec![addr],
                    result_ty,
                    span,
                )))
            }
            _ => Err(err("cannot index this type")),
        }
    }

    /// `new Foo { ... }`: allocate through `cot_alloc` with the type's
    /// metadata, initialize fields, and register a release cleanup. The
    /// cleanup is dormant during field initialization.
    fn lower_new(
        &mut self,
        struct_ty: TypeIndex,
        fields: &[FieldInit],
        ptr_ty: TypeIndex,
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        let name = self.struct_name(struct_ty)?;
        self.module.register_metadata(&name);
        let meta = self.fb.emit(
            IrOp::TypeMetadata { type_name: name },
            vec![],
            TypeIndex::I64,
            span,
        );
        let size = self.types.size_of(struct_ty);
        let size_node = self.fb.emit_const_int(size as i64, TypeIndex::I64, span);
        let obj = self.emit_runtime_call("cot_alloc", vec![meta, size_node], ptr_ty, span);

        let tmp_name = self.fresh_temp("new");
        let tmp = self.fb.add_local(&tmp_name, ptr_ty, 8);
        self.fb.emit_store_local(tmp, obj, span);

        let handle = self
            .cleanups
            .push_dormant(CleanupKind::Release, obj, ptr_ty);
        for field in fields {
            let field_ty = field.value.ty;
            if self.is_aggregate(field_ty) {
                let src = self.lower_expr(&field.value)?.node;
                let off = self
                    .fb
                    .emit_const_int(field.offset as i64, TypeIndex::I64, span);
                let dst = self
                    .fb
                    .emit(IrOp::Binary(BinOp::Add), vec![obj, off], TypeIndex::I64, span);
                let bytes = self.types.size_of(field_ty);
                self.fb.emit(
                    IrOp::MemCopy { bytes },
                    vec![dst, src],
                    TypeIndex::VOID,
                    span,
                );
            } else {
                let mv = self.lower_expr(&field.value)?;
                let node = if self.types.is_managed(field_ty) {
                    self.owning_store_value(mv, field_ty, span)
                } else {
                    mv.node
                };
                self.fb.emit(
                    IrOp::PtrStore {
                        offset: field.offset,
                    },
                    vec![obj, node],
                    TypeIndex::VOID,
                    span,
                );
            }
        }
        self.cleanups.activate(handle);
        Ok(ManagedValue::for_owned(obj, handle))
    }

    fn lower_struct_lit(
        &mut self,
        ty: TypeIndex,
        fields: &[FieldInit],
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        let tmp_name = self.fresh_temp("lit");
        let size = self.types.size_of(ty);
        let tmp = self.fb.add_local(&tmp_name, ty, size);
        for field in fields {
            let field_ty = field.value.ty;
            if self.is_aggregate(field_ty) {
                let src = self.lower_expr(&field.value)?.node;
                let base = self.fb.emit_local_addr(tmp, span);
                let off = self
                    .fb
                    .emit_const_int(field.offset as i64, TypeIndex::I64, span);
                let dst = self
                    .fb
                    .emit(IrOp::Binary(BinOp::Add), vec![base, off], TypeIndex::I64, span);
                let bytes = self.types.size_of(field_ty);
                self.fb.emit(
                    IrOp::MemCopy { bytes },
                    vec![dst, src],
                    TypeIndex::VOID,
                    span,
                );
            } else {
                let mv = self.lower_expr(&field.value)?;
                self.fb.emit(
                    IrOp::StoreLocalField {
                        local: tmp,
                        offset: field.offset,
                    },
                    vec![mv.node],
                    TypeIndex::VOID,
                    span,
                );
            }
        }
        Ok(ManagedValue::for_trivial(
            self.fb.emit_local_addr(tmp, span),
        ))
    }

    fn lower_union_lit(
        &mut self,
        ty: TypeIndex,
        variant: &str,
        payload: Option<&Expr>,
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        let (tag, _payload_ty) = self
            .types
            .union_variant(ty, variant)
            .ok_or_else(|| err(format!("unknown union variant '{}'", variant)))?;
        let tmp_name = self.fresh_temp("union");
        let size = self.types.size_of(ty);
        let tmp = self.fb.add_local(&tmp_name, ty, size);
        let tag_node = self.fb.emit_const_int(tag, TypeIndex::I64, span);
        self.fb.emit(
            IrOp::StoreLocalField {
                local: tmp,
                offset: 0,
            },
            vec![tag_node],
            TypeIndex::VOID,
            span,
        );
        if let Some(p) = payload {
            if self.is_aggregate(p.ty) {
                let src = self.lower_expr(p)?.node;
                let base = self.fb.emit_local_addr(tmp, span);
                let off = self.fb.emit_const_int(8, TypeIndex::I64, span);
                let dst = self
                    .fb
                    .emit(IrOp::Binary(BinOp::Add), vec![base, off], TypeIndex::I64, span);
                let bytes = self.types.size_of(p.ty);
                self.fb.emit(
                    IrOp::MemCopy { bytes },
                    vec![dst, src],
                    TypeIndex::VOID,
                    span,
                );
            } else {
                let mv = self.lower_expr(p)?;
                self.fb.emit(
                    IrOp::StoreLocalField {
                        local: tmp,
                        offset: 8,
                    },
                    vec![mv.node],
                    TypeIndex::VOID,
                    span,
                );
            }
        }
        Ok(ManagedValue::for_trivial(
            self.fb.emit_local_addr(tmp, span),
        ))
    }

    fn lower_list_lit(
        &mut self,
        elem: TypeIndex,
        items: &[Expr],
        list_ty: TypeIndex,
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        if self.types.size_of(elem) > 8 {
            return Err(err("list elements must fit in 8 bytes"));
        }
        let cap = self
            .fb
            .emit_const_int(items.len().max(1) as i64, TypeIndex::I64, span);
        let mut list = self.emit_runtime_call("cot_list_new", vec![cap], list_ty, span);
        for item in items {
            let mv = self.lower_expr(item)?;
            let node = self.owning_store_value(mv, elem, span);
            list = self.emit_runtime_call("cot_list_push", vec![list, node], list_ty, span);
        }
        let handle = self.cleanups.push(CleanupKind::Release, list, list_ty);
        Ok(ManagedValue::for_owned(list, handle))
    }

    /// `try expr`: branch on the error tag; the error arm runs errdefer
    /// bodies and propagates through the enclosing error-union return.
    fn lower_try(
        &mut self,
        inner: &Expr,
        payload_ty: TypeIndex,
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        if !matches!(self.types.kind(self.ret_ty), TypeKind::ErrorUnion { .. }) {
            return Err(err("try used in a function that does not return an error union"));
        }
        let eu = self.lower_expr(inner)?.node;
        let tag = self.fb.emit(IrOp::PairFirst, vec![eu], TypeIndex::I64, span);
        let zero = self.fb.emit_const_int(0, TypeIndex::I64, span);
        let is_ok = self
            .fb
            .emit(IrOp::Binary(BinOp::Eq), vec![tag, zero], TypeIndex::BOOL, span);
        let ok_b = self.fb.new_block();
        let err_b = self.fb.new_block();
        self.fb.set_term(IrTerm::Branch {
            cond: is_ok,
            then_blk: ok_b,
            else_blk: err_b,
        });

        self.fb.switch_to(err_b);
        self.emit_cleanups_above(0, span);
        self.run_defers_above(0, true, span)?;
        let z = self.fb.emit_const_int(0, TypeIndex::I64, span);
        let propagated = self
            .fb
            .emit(IrOp::PairMake, vec![tag, z], self.ret_ty, span);
        self.fb.set_term(IrTerm::Return(Some(propagated)));

        self.fb.switch_to(ok_b);
        Ok(ManagedValue::for_trivial(self.fb.emit(
            IrOp::PairSecond,
            vec![eu],
            payload_ty,
            span,
        )))
    }

    /// `expr catch |e| { ... }`: the handler sees the error tag and either
    /// diverts control or falls through to a zero fallback.
    fn lower_catch(
        &mut self,
        inner: &Expr,
        binding: Option<&str>,
        handler: &BlockStmt,
        payload_ty: TypeIndex,
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        let eu = self.lower_expr(inner)?.node;
        let tag = self.fb.emit(IrOp::PairFirst, vec![eu], TypeIndex::I64, span);
        let zero = self.fb.emit_const_int(0, TypeIndex::I64, span);
        let is_ok = self
            .fb
            .emit(IrOp::Binary(BinOp::Eq), vec![tag, zero], TypeIndex::BOOL, span);

        let result_name = self.fresh_temp("catch");
        let size = self.types.size_of(payload_ty).max(1);
        let result = self.fb.add_local(&result_name, payload_ty, size);

        let ok_b = self.fb.new_block();
        let err_b = self.fb.new_block();
        let merge = self.fb.new_block();
        self.fb.set_term(IrTerm::Branch {
            cond: is_ok,
            then_blk: ok_b,
            else_blk: err_b,
        });

        self.fb.switch_to(ok_b);
        let payload = self
            .fb
            .emit(IrOp::PairSecond, vec![eu], payload_ty, span);
        self.fb.emit_store_local(result, payload, span);
        self.fb.set_term(IrTerm::Jump(merge));

        self.fb.switch_to(err_b);
        self.push_scope();
        if let Some(name) = binding {
            let e_local = self.fb.add_local(name, TypeIndex::I64, 8);
            self.fb.emit_store_local(e_local, tag, span);
            self.bind(name, e_local);
        }
        self.lower_stmts(handler)?;
        if !self.fb.is_terminated() {
            let fallback = self.zero_value(payload_ty, span)?;
            self.fb.emit_store_local(result, fallback, span);
            self.fb.set_term(IrTerm::Jump(merge));
        }
        self.pop_scope();

        self.fb.switch_to(merge);
        Ok(ManagedValue::for_trivial(
            self.fb.emit_load_local(result, span),
        ))
    }
}
