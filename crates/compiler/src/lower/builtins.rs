//! Builtin call lowering.
//!
//! Dispatch is grouped by category: assertions, memory/pointer
//! introspection, ARC, length, math, conversions, and I/O. Assertion
//! operands narrower than 64 bits are widened before both the comparison
//! and the fail-value stores; comparing sub-64-bit values directly on the
//! Wasm stack yields wrong results.

use super::{err, CleanupKind, Lowerer, ManagedValue};
use crate::ast::{BinOp, Expr};
use crate::diag::Span;
use crate::error::CompileError;
use crate::ir::{IrOp, IrTerm, NodeIndex};
use crate::types::{TypeIndex, TypeKind};

impl<'a> Lowerer<'a> {
    pub(crate) fn lower_builtin(
        &mut self,
        name: &str,
        args: &[Expr],
        result_ty: TypeIndex,
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        match name {
            // Assertions
            "assertEq" => self.lower_assert_eq(args, span),
            "assert" => self.lower_assert(args, span),
            "panic" => {
                let node = self.fb.emit_const_int(0, TypeIndex::I64, span);
                self.fb.set_term(IrTerm::Trap);
                Ok(ManagedValue::for_trivial(node))
            }

            // Lengths
            "len" => self.lower_len(&args[0], span),

            // Memory / pointer introspection
            "sizeOf" => Ok(ManagedValue::for_trivial(self.fb.emit_const_int(
                self.types.size_of(args[0].ty) as i64,
                TypeIndex::I64,
                span,
            ))),
            "alignOf" => Ok(ManagedValue::for_trivial(self.fb.emit_const_int(
                self.types.align_of(args[0].ty) as i64,
                TypeIndex::I64,
                span,
            ))),
            "intToPtr" | "ptrToInt" | "intCast" | "truncate" | "floatToInt" | "intToFloat" => {
                let mv = self.lower_expr(&args[0])?;
                Ok(ManagedValue::for_trivial(self.fb.emit(
                    IrOp::Cast,
                    vec![mv.node],
                    result_ty,
                    span,
                )))
            }

            // ARC
            "arcRetain" => {
                let mv = self.lower_expr(&args[0])?;
                let node =
                    self.emit_runtime_call("cot_retain", vec![mv.node], result_ty, span);
                let handle = self.cleanups.push(CleanupKind::Release, node, result_ty);
                Ok(ManagedValue::for_owned(node, handle))
            }
            "arcRelease" => {
                let mv = self.lower_expr(&args[0])?;
                self.emit_runtime_call("cot_release", vec![mv.node], TypeIndex::VOID, span);
                Ok(ManagedValue::for_trivial(
                    self.fb.emit_const_int(0, TypeIndex::I64, span),
                ))
            }

            // Math
            "min" | "max" => self.lower_min_max(name == "min", args, result_ty, span),
            "abs" => {
                let mv = self.lower_expr(&args[0])?;
                let zero = self.fb.emit_const_int(0, result_ty, span);
                let neg = self.fb.emit(
                    IrOp::Unary(crate::ast::UnOp::Neg),
                    vec![mv.node],
                    result_ty,
                    span,
                );
                self.select_value(
                    |lw, s| {
                        let c = lw.fb.emit(
                            IrOp::Binary(BinOp::Lt),
                            vec![mv.node, zero],
                            TypeIndex::BOOL,
                            s,
                        );
                        c
                    },
                    neg,
                    mv.node,
                    result_ty,
                    span,
                )
            }

            // I/O (requires host imports)
            "print" | "println" => {
                if !self.options().host_io() {
                    return Err(err(
                        "@print requires host I/O (test mode or the native target)",
                    ));
                }
                let mv = self.lower_expr(&args[0])?;
                let ptr = self
                    .fb
                    .emit(IrOp::StringPtr, vec![mv.node], TypeIndex::I64, span);
                let len = self
                    .fb
                    .emit(IrOp::StringLen, vec![mv.node], TypeIndex::I64, span);
                self.emit_runtime_call("cot_write", vec![ptr, len], TypeIndex::VOID, span);
                if name == "println" {
                    let idx = self.module.intern_string("\n");
                    let nl = self
                        .fb
                        .emit(IrOp::ConstString(idx), vec![], TypeIndex::STRING, span);
                    let nptr = self.fb.emit(IrOp::StringPtr, vec![nl], TypeIndex::I64, span);
                    let nlen = self.fb.emit(IrOp::StringLen, vec![nl], TypeIndex::I64, span);
                    self.emit_runtime_call("cot_write", vec![nptr, nlen], TypeIndex::VOID, span);
                }
                Ok(ManagedValue::for_trivial(
                    self.fb.emit_const_int(0, TypeIndex::I64, span),
                ))
            }

            _ => Err(err(format!("unknown builtin '@{}'", name))),
        }
    }

    fn lower_len(&mut self, arg: &Expr, span: Span) -> Result<ManagedValue, CompileError> {
        match self.types.kind(arg.ty).clone() {
            TypeKind::String => {
                let mv = self.lower_expr(arg)?;
                Ok(ManagedValue::for_trivial(self.fb.emit(
                    IrOp::StringLen,
                    vec![mv.node],
                    TypeIndex::I64,
                    span,
                )))
            }
            TypeKind::Slice { .. } => {
                let mv = self.lower_expr(arg)?;
                Ok(ManagedValue::for_trivial(self.fb.emit(
                    IrOp::SliceLen,
                    vec![mv.node],
                    TypeIndex::I64,
                    span,
                )))
            }
            TypeKind::List { .. } => {
                let mv = self.lower_expr(arg)?;
                Ok(ManagedValue::for_trivial(self.emit_runtime_call(
                    "cot_list_len",
                    vec![mv.node],
                    TypeIndex::I64,
                    span,
                )))
            }
            TypeKind::Array { len, .. } => Ok(ManagedValue::for_trivial(
                self.fb.emit_const_int(len as i64, TypeIndex::I64, span),
            )),
            _ => Err(err("@len expects a string, slice, list, or array")),
        }
    }

    /// Widen a sub-64-bit operand to 64 bits, honoring signedness. Floats
    /// and full-width integers pass through.
    pub(crate) fn widen_to_64(
        &mut self,
        node: NodeIndex,
        ty: TypeIndex,
        span: Span,
    ) -> NodeIndex {
        if self.types.is_float(ty) || self.types.size_of(ty) >= 8 {
            return node;
        }
        let target = if self.types.is_signed(ty) {
            TypeIndex::I64
        } else {
            TypeIndex::U64
        };
        self.fb.emit(IrOp::Cast, vec![node], target, span)
    }

    /// `@assertEq(a, b)`: compare after widening both operands to 64 bits
    /// and hand the failing pair to the test runtime for display.
    fn lower_assert_eq(&mut self, args: &[Expr], span: Span) -> Result<ManagedValue, CompileError> {
        if args.len() != 2 {
            return Err(err("@assertEq expects two arguments"));
        }
        let (a, b) = (&args[0], &args[1]);
        let fail_b = self.fb.new_block();
        let cont_b = self.fb.new_block();

        if self.types.is_slice_like(a.ty) {
            let am = self.lower_expr(a)?;
            let bm = self.lower_expr(b)?;
            let ap = self.fb.emit(IrOp::StringPtr, vec![am.node], TypeIndex::I64, span);
            let al = self.fb.emit(IrOp::StringLen, vec![am.node], TypeIndex::I64, span);
            let bp = self.fb.emit(IrOp::StringPtr, vec![bm.node], TypeIndex::I64, span);
            let bl = self.fb.emit(IrOp::StringLen, vec![bm.node], TypeIndex::I64, span);
            let eq =
                self.emit_runtime_call("cot_string_eq", vec![ap, al, bp, bl], TypeIndex::I64, span);
            let zero = self.fb.emit_const_int(0, TypeIndex::I64, span);
            let failed = self
                .fb
                .emit(IrOp::Binary(BinOp::Eq), vec![eq, zero], TypeIndex::BOOL, span);
            self.fb.set_term(IrTerm::Branch {
                cond: failed,
                then_blk: fail_b,
                else_blk: cont_b,
            });
            self.fb.switch_to(fail_b);
            let one = self.fb.emit_const_int(1, TypeIndex::I64, span);
            self.emit_runtime_call(
                "__test_store_fail_values",
                vec![ap, bp, one, al, bl],
                TypeIndex::VOID,
                span,
            );
            self.fb.set_term(IrTerm::Jump(cont_b));
        } else {
            let am = self.lower_expr(a)?;
            let bm = self.lower_expr(b)?;
            let a64 = self.widen_to_64(am.node, a.ty, span);
            let b64 = self.widen_to_64(bm.node, b.ty, span);
            let failed = self
                .fb
                .emit(IrOp::Binary(BinOp::Ne), vec![a64, b64], TypeIndex::BOOL, span);
            self.fb.set_term(IrTerm::Branch {
                cond: failed,
                then_blk: fail_b,
                else_blk: cont_b,
            });
            self.fb.switch_to(fail_b);
            let zero1 = self.fb.emit_const_int(0, TypeIndex::I64, span);
            let zero2 = self.fb.emit_const_int(0, TypeIndex::I64, span);
            let zero3 = self.fb.emit_const_int(0, TypeIndex::I64, span);
            self.emit_runtime_call(
                "__test_store_fail_values",
                vec![a64, b64, zero1, zero2, zero3],
                TypeIndex::VOID,
                span,
            );
            self.fb.set_term(IrTerm::Jump(cont_b));
        }

        self.fb.switch_to(cont_b);
        Ok(ManagedValue::for_trivial(
            self.fb.emit_const_int(0, TypeIndex::I64, span),
        ))
    }

    fn lower_assert(&mut self, args: &[Expr], span: Span) -> Result<ManagedValue, CompileError> {
        let cond = self.lower_expr(&args[0])?;
        let fail_b = self.fb.new_block();
        let cont_b = self.fb.new_block();
        self.fb.set_term(IrTerm::Branch {
            cond: cond.node,
            then_blk: cont_b,
            else_blk: fail_b,
        });
        self.fb.switch_to(fail_b);
        let one = self.fb.emit_const_int(1, TypeIndex::I64, span);
        let zero1 = self.fb.emit_const_int(0, TypeIndex::I64, span);
        let zero2 = self.fb.emit_const_int(0, TypeIndex::I64, span);
        let zero3 = self.fb.emit_const_int(0, TypeIndex::I64, span);
        self.emit_runtime_call(
            "__test_store_fail_values",
            vec![one, zero1, zero2, zero3, zero3],
            TypeIndex::VOID,
            span,
        );
        self.fb.set_term(IrTerm::Jump(cont_b));
        self.fb.switch_to(cont_b);
        Ok(ManagedValue::for_trivial(
            self.fb.emit_const_int(0, TypeIndex::I64, span),
        ))
    }

    fn lower_min_max(
        &mut self,
        is_min: bool,
        args: &[Expr],
        result_ty: TypeIndex,
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        let a = self.lower_expr(&args[0])?.node;
        let b = self.lower_expr(&args[1])?.node;
        let cmp = if is_min { BinOp::Lt } else { BinOp::Gt };
        self.select_value(
            |lw, s| lw.fb.emit(IrOp::Binary(cmp), vec![a, b], TypeIndex::BOOL, s),
            a,
            b,
            result_ty,
            span,
        )
    }

    /// Branchy select: `cond ? then_val : else_val` through a temp local.
    fn select_value(
        &mut self,
        cond_fn: impl FnOnce(&mut Self, Span) -> NodeIndex,
        then_val: NodeIndex,
        else_val: NodeIndex,
        ty: TypeIndex,
        span: Span,
    ) -> Result<ManagedValue, CompileError> {
        let tmp_name = self.fresh_temp("sel");
        let size = self.types.size_of(ty).max(1);
        let tmp = self.fb.add_local(&tmp_name, ty, size);
        let cond = cond_fn(self, span);
        let then_b = self.fb.new_block();
        let else_b = self.fb.new_block();
        let merge = self.fb.new_block();
        self.fb.set_term(IrTerm::Branch {
            cond,
            then_blk: then_b,
            else_blk: else_b,
        });
        self.fb.switch_to(then_b);
        self.fb.emit_store_local(tmp, then_val, span);
        self.fb.set_term(IrTerm::Jump(merge));
        self.fb.switch_to(else_b);
        self.fb.emit_store_local(tmp, else_val, span);
        self.fb.set_term(IrTerm::Jump(merge));
        self.fb.switch_to(merge);
        Ok(ManagedValue::for_trivial(
            self.fb.emit_load_local(tmp, span),
        ))
    }
}
