//! Generic -> Wasm op lowering.
//!
//! Maps every generic arithmetic, comparison, conversion, load and store
//! op to its sized Wasm counterpart, picking signed or unsigned variants
//! by operand type. Pointer-scaled arithmetic (`add_ptr`, `off_ptr`,
//! address ops) passes through unchanged to codegen, which resolves it
//! against the frame and data layout.

use super::{Aux, Func, Op, ValueId};
use crate::error::SsaError;
use crate::types::{TypeIndex, TypeRegistry};

pub fn lower_wasm(f: &mut Func, types: &TypeRegistry) -> Result<(), SsaError> {
    let n = f.values.len();
    for i in 0..n {
        let id = ValueId(i as u32);
        let v = f.val(id);
        let op = v.op;
        let ty = v.ty;
        match op {
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Rem
            | Op::And | Op::Or | Op::Xor | Op::Shl | Op::Shr => {
                let is_float = types.is_float(ty);
                let signed = types.is_signed(ty);
                let new_op = match (op, is_float) {
                    (Op::Add, false) => Op::WasmI64Add,
                    (Op::Sub, false) => Op::WasmI64Sub,
                    (Op::Mul, false) => Op::WasmI64Mul,
                    (Op::Div, false) => {
                        if signed {
                            Op::WasmI64DivS
                        } else {
                            Op::WasmI64DivU
                        }
                    }
                    (Op::Rem, false) => {
                        if signed {
                            Op::WasmI64RemS
                        } else {
                            Op::WasmI64RemU
                        }
                    }
                    (Op::And, false) => Op::WasmI64And,
                    (Op::Or, false) => Op::WasmI64Or,
                    (Op::Xor, false) => Op::WasmI64Xor,
                    (Op::Shl, false) => Op::WasmI64Shl,
                    (Op::Shr, false) => {
                        if signed {
                            Op::WasmI64ShrS
                        } else {
                            Op::WasmI64ShrU
                        }
                    }
                    (Op::Add, true) => Op::WasmF64Add,
                    (Op::Sub, true) => Op::WasmF64Sub,
                    (Op::Mul, true) => Op::WasmF64Mul,
                    (Op::Div, true) => Op::WasmF64Div,
                    _ => {
                        return Err(SsaError::Verify {
                            func: f.name.clone(),
                            message: format!("no wasm lowering for {:?} on this type", op),
                        })
                    }
                };
                f.val_mut(id).op = new_op;
            }
            Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let arg_ty = f.val(f.val(id).args[0]).ty;
                let is_float = types.is_float(arg_ty);
                let signed = types.is_signed(arg_ty);
                let new_op = match (op, is_float, signed) {
                    (Op::Eq, false, _) => Op::WasmI64Eq,
                    (Op::Ne, false, _) => Op::WasmI64Ne,
                    (Op::Lt, false, true) => Op::WasmI64LtS,
                    (Op::Lt, false, false) => Op::WasmI64LtU,
                    (Op::Le, false, true) => Op::WasmI64LeS,
                    (Op::Le, false, false) => Op::WasmI64LeU,
                    (Op::Gt, false, true) => Op::WasmI64GtS,
                    (Op::Gt, false, false) => Op::WasmI64GtU,
                    (Op::Ge, false, true) => Op::WasmI64GeS,
                    (Op::Ge, false, false) => Op::WasmI64GeU,
                    (Op::Eq, true, _) => Op::WasmF64Eq,
                    (Op::Ne, true, _) => Op::WasmF64Ne,
                    (Op::Lt, true, _) => Op::WasmF64Lt,
                    (Op::Le, true, _) => Op::WasmF64Le,
                    (Op::Gt, true, _) => Op::WasmF64Gt,
                    (Op::Ge, true, _) => Op::WasmF64Ge,
                    _ => unreachable!(),
                };
                f.val_mut(id).op = new_op;
            }
            Op::Neg => {
                if types.is_float(ty) {
                    f.val_mut(id).op = Op::WasmF64Neg;
                } else {
                    let x = f.val(id).args[0];
                    let pos = f.val(id).pos;
                    let zero = f.const_i64(ty, 0, pos);
                    f.reset_value(id, Op::WasmI64Sub, ty, Aux::None, 0, vec![zero, x]);
                }
            }
            Op::Not => {
                f.val_mut(id).op = Op::WasmI64Eqz;
            }
            Op::SignExt => {
                let new_op = match f.val(id).aux_int {
                    8 => Op::WasmI64Extend8S,
                    16 => Op::WasmI64Extend16S,
                    32 => Op::WasmI64Extend32S,
                    _ => Op::Copy,
                };
                f.val_mut(id).op = new_op;
            }
            Op::ZeroExt | Op::Trunc => {
                let bits = f.val(id).aux_int;
                if bits >= 64 {
                    f.val_mut(id).op = Op::Copy;
                } else {
                    let mask = (1i64 << bits).wrapping_sub(1);
                    let x = f.val(id).args[0];
                    let pos = f.val(id).pos;
                    let vty = f.val(id).ty;
                    let mask_v = f.const_i64(TypeIndex::I64, mask, pos);
                    f.reset_value(id, Op::WasmI64And, vty, Aux::None, 0, vec![x, mask_v]);
                }
            }
            Op::IToF => f.val_mut(id).op = Op::WasmF64ConvertI64S,
            Op::FToI => f.val_mut(id).op = Op::WasmI64TruncF64S,
            Op::Load => {
                let new_op = if types.is_float(ty) {
                    Op::WasmF64Load
                } else {
                    match (types.size_of(ty), types.is_signed(ty)) {
                        (1, true) => Op::WasmI64Load8S,
                        (1, false) => Op::WasmI64Load8U,
                        (2, true) => Op::WasmI64Load16S,
                        (2, false) => Op::WasmI64Load16U,
                        (4, true) => Op::WasmI64Load32S,
                        (4, false) => Op::WasmI64Load32U,
                        _ => Op::WasmI64Load,
                    }
                };
                f.val_mut(id).op = new_op;
            }
            Op::Store => {
                let stored_ty = f.val(f.val(id).args[1]).ty;
                let new_op = if types.is_float(stored_ty) {
                    Op::WasmF64Store
                } else {
                    match types.size_of(stored_ty) {
                        1 => Op::WasmI64Store8,
                        2 => Op::WasmI64Store16,
                        4 => Op::WasmI64Store32,
                        _ => Op::WasmI64Store,
                    }
                };
                f.val_mut(id).op = new_op;
            }
            // Everything else passes through to codegen.
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Span;

    #[test]
    fn test_add_lowering_by_type() {
        let types = TypeRegistry::new();
        let mut f = Func::new("t", TypeIndex::I64, false);
        let a = f.const_i64(TypeIndex::I64, 1, Span::none());
        let b = f.const_i64(TypeIndex::I64, 2, Span::none());
        let add = f.new_value(
            f.entry,
            Op::Add,
            TypeIndex::I64,
            Aux::None,
            0,
            vec![a, b],
            Span::none(),
        );
        let fa = f.new_value(
            f.entry,
            Op::ConstF64,
            TypeIndex::F64,
            Aux::F64(1.5),
            0,
            vec![],
            Span::none(),
        );
        let fadd = f.new_value(
            f.entry,
            Op::Add,
            TypeIndex::F64,
            Aux::None,
            0,
            vec![fa, fa],
            Span::none(),
        );
        lower_wasm(&mut f, &types).unwrap();
        assert_eq!(f.val(add).op, Op::WasmI64Add);
        assert_eq!(f.val(fadd).op, Op::WasmF64Add);
    }

    #[test]
    fn test_unsigned_division() {
        let types = TypeRegistry::new();
        let mut f = Func::new("t", TypeIndex::I64, false);
        let a = f.const_i64(TypeIndex::U64, 10, Span::none());
        let div = f.new_value(
            f.entry,
            Op::Div,
            TypeIndex::U64,
            Aux::None,
            0,
            vec![a, a],
            Span::none(),
        );
        lower_wasm(&mut f, &types).unwrap();
        assert_eq!(f.val(div).op, Op::WasmI64DivU);
    }

    #[test]
    fn test_comparison_signedness_follows_operands() {
        let types = TypeRegistry::new();
        let mut f = Func::new("t", TypeIndex::I64, false);
        let u = f.const_i64(TypeIndex::U32, 3, Span::none());
        let lt = f.new_value(
            f.entry,
            Op::Lt,
            TypeIndex::BOOL,
            Aux::None,
            0,
            vec![u, u],
            Span::none(),
        );
        lower_wasm(&mut f, &types).unwrap();
        assert_eq!(f.val(lt).op, Op::WasmI64LtU);
    }

    #[test]
    fn test_small_load_store_sizing() {
        let types = TypeRegistry::new();
        let mut f = Func::new("t", TypeIndex::I64, false);
        let addr = f.const_i64(TypeIndex::I64, 32, Span::none());
        let byte = f.const_i64(TypeIndex::U8, 7, Span::none());
        let ld = f.new_value(
            f.entry,
            Op::Load,
            TypeIndex::U8,
            Aux::None,
            0,
            vec![addr],
            Span::none(),
        );
        let st = f.new_value(
            f.entry,
            Op::Store,
            TypeIndex::SSA_MEM,
            Aux::None,
            0,
            vec![addr, byte],
            Span::none(),
        );
        lower_wasm(&mut f, &types).unwrap();
        assert_eq!(f.val(ld).op, Op::WasmI64Load8U);
        assert_eq!(f.val(st).op, Op::WasmI64Store8);
    }

    #[test]
    fn test_zero_ext_becomes_mask() {
        let types = TypeRegistry::new();
        let mut f = Func::new("t", TypeIndex::I64, false);
        let x = f.const_i64(TypeIndex::U8, 0xFF, Span::none());
        let ext = f.new_value(
            f.entry,
            Op::ZeroExt,
            TypeIndex::U64,
            Aux::None,
            8,
            vec![x],
            Span::none(),
        );
        lower_wasm(&mut f, &types).unwrap();
        assert_eq!(f.val(ext).op, Op::WasmI64And);
        let mask = f.val(f.val(ext).args[1]);
        assert_eq!(mask.aux_int, 0xFF);
    }
}
