//! Fixpoint rewrite passes.
//!
//! Each pass mutates values in place and reruns until nothing changes,
//! bounded by [`REWRITE_LIMIT`] iterations; exceeding the bound is a
//! compiler bug reported as `IterationLimit`.

use super::{Aux, Func, Op, ValueId};
use crate::error::SsaError;
use crate::types::{TypeIndex, TypeRegistry};

pub const REWRITE_LIMIT: usize = 100;

/// Generic rewrites. Today that is the `const_string` split into
/// `string_make(literal ptr, length)`; algebraic simplifications slot in
/// here later.
pub fn rewrite_generic(f: &mut Func, strings: &[String]) -> Result<(), SsaError> {
    for _ in 0..REWRITE_LIMIT {
        let mut changed = false;
        let n = f.values.len();
        for i in 0..n {
            let id = ValueId(i as u32);
            if f.val(id).op != Op::ConstString {
                continue;
            }
            let idx = f.val(id).aux_int;
            let len = strings
                .get(idx as usize)
                .map(|s| s.len() as i64)
                .unwrap_or(0);
            let block = f.val(id).block;
            let pos = f.val(id).pos;
            let ptr = f.new_value(
                block,
                Op::ConstStringPtr,
                TypeIndex::I64,
                Aux::None,
                idx,
                vec![],
                pos,
            );
            let len_v = f.const_i64(TypeIndex::I64, len, pos);
            f.reset_value(
                id,
                Op::StringMake,
                TypeIndex::STRING,
                Aux::None,
                0,
                vec![ptr, len_v],
            );
            changed = true;
        }
        if !changed {
            return Ok(());
        }
    }
    Err(SsaError::IterationLimit {
        pass: "rewritegeneric",
        func: f.name.clone(),
    })
}

/// Pair decomposition rewrites: unwrap length/pointer extraction over
/// make ops and whole-pair loads, and expand `string_concat` into the
/// runtime call plus a rebuilt pair. `string_len` over a `slice_make` is
/// accepted because STRING is internally a slice.
pub fn rewrite_dec(f: &mut Func, types: &TypeRegistry) -> Result<(), SsaError> {
    for _ in 0..REWRITE_LIMIT {
        let mut changed = false;
        let n = f.values.len();
        for i in 0..n {
            let id = ValueId(i as u32);
            match f.val(id).op {
                Op::StringLen | Op::SliceLen => {
                    if rewrite_extract(f, types, id, 1) {
                        changed = true;
                    }
                }
                Op::StringPtr | Op::SlicePtr => {
                    if rewrite_extract(f, types, id, 0) {
                        changed = true;
                    }
                }
                Op::StringConcat => {
                    if rewrite_concat(f, types, id) {
                        changed = true;
                    }
                }
                _ => {}
            }
        }
        if !changed {
            return Ok(());
        }
    }
    Err(SsaError::IterationLimit {
        pass: "rewritedec",
        func: f.name.clone(),
    })
}

/// Rewrite `*_ptr` / `*_len` of a pair value. `component` selects offset
/// 0 (ptr) or 8 (len).
fn rewrite_extract(f: &mut Func, types: &TypeRegistry, id: ValueId, component: usize) -> bool {
    let src = f.follow_copy(f.val(id).args[0]);
    let src_op = f.val(src).op;
    let ty = f.val(id).ty;
    if src_op.is_make() {
        let arg = f.val(src).args[component];
        f.reset_value(id, Op::Copy, ty, Aux::None, 0, vec![arg]);
        return true;
    }
    if src_op == Op::Load && types.is_pair(f.val(src).ty) {
        let addr = f.val(src).args[0];
        let block = f.val(id).block;
        let pos = f.val(id).pos;
        let at = if component == 0 {
            addr
        } else {
            f.new_value(block, Op::AddPtr, TypeIndex::I64, Aux::None, 8, vec![addr], pos)
        };
        f.reset_value(id, Op::Load, TypeIndex::I64, Aux::None, 0, vec![at]);
        return true;
    }
    false
}

/// Extract the (ptr, len) components of a pair-producing value, if its
/// shape is already decomposable.
fn extract_pair(
    f: &mut Func,
    types: &TypeRegistry,
    v: ValueId,
) -> Option<(ValueId, ValueId)> {
    let v = f.follow_copy(v);
    let op = f.val(v).op;
    if op.is_make() {
        return Some((f.val(v).args[0], f.val(v).args[1]));
    }
    if op == Op::Load && types.is_pair(f.val(v).ty) {
        let addr = f.val(v).args[0];
        let block = f.val(v).block;
        let pos = f.val(v).pos;
        let lo = f.new_value(block, Op::Load, TypeIndex::I64, Aux::None, 0, vec![addr], pos);
        let at = f.new_value(block, Op::AddPtr, TypeIndex::I64, Aux::None, 8, vec![addr], pos);
        let hi = f.new_value(block, Op::Load, TypeIndex::I64, Aux::None, 0, vec![at], pos);
        return Some((lo, hi));
    }
    None
}

/// `string_concat(s1, s2)` becomes a call to `cot_string_concat` with
/// both pairs spread, rebuilt as `string_make(call, l1 + l2)`.
fn rewrite_concat(f: &mut Func, types: &TypeRegistry, id: ValueId) -> bool {
    let s1 = f.val(id).args[0];
    let s2 = f.val(id).args[1];
    let (p1, l1) = match extract_pair(f, types, s1) {
        Some(x) => x,
        None => return false,
    };
    let (p2, l2) = match extract_pair(f, types, s2) {
        Some(x) => x,
        None => return false,
    };
    let block = f.val(id).block;
    let pos = f.val(id).pos;
    let call = f.new_value(
        block,
        Op::StaticCall,
        TypeIndex::I64,
        Aux::Sym("cot_string_concat".to_string()),
        0,
        vec![p1, l1, p2, l2],
        pos,
    );
    let sum = f.new_value(
        block,
        Op::Add,
        TypeIndex::I64,
        Aux::None,
        0,
        vec![l1, l2],
        pos,
    );
    f.reset_value(
        id,
        Op::StringMake,
        TypeIndex::STRING,
        Aux::None,
        0,
        vec![call, sum],
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Span;
    use crate::ssa::BlockKind;

    fn func_with_string_make(len_value: i64) -> (Func, ValueId, ValueId) {
        let mut f = Func::new("t", TypeIndex::I64, false);
        let entry = f.entry;
        f.blk_mut(entry).kind = BlockKind::Ret;
        let p = f.const_i64(TypeIndex::I64, 1000, Span::none());
        let l = f.const_i64(TypeIndex::I64, len_value, Span::none());
        let mk = f.new_value(
            entry,
            Op::StringMake,
            TypeIndex::STRING,
            Aux::None,
            0,
            vec![p, l],
            Span::none(),
        );
        (f, mk, l)
    }

    #[test]
    fn test_string_len_of_make_becomes_copy() {
        let (mut f, mk, l) = func_with_string_make(5);
        let len = f.new_value(
            f.entry,
            Op::StringLen,
            TypeIndex::I64,
            Aux::None,
            0,
            vec![mk],
            Span::none(),
        );
        rewrite_dec(&mut f, &TypeRegistry::new()).unwrap();
        assert_eq!(f.val(len).op, Op::Copy);
        assert_eq!(f.val(len).args[0], l);
    }

    #[test]
    fn test_string_len_of_slice_make_also_rewrites() {
        // STRING is a slice: either make op must be accepted.
        let mut f = Func::new("t", TypeIndex::I64, false);
        let p = f.const_i64(TypeIndex::I64, 0, Span::none());
        let l = f.const_i64(TypeIndex::I64, 7, Span::none());
        let mk = f.new_value(
            f.entry,
            Op::SliceMake,
            TypeIndex::STRING,
            Aux::None,
            0,
            vec![p, l],
            Span::none(),
        );
        let len = f.new_value(
            f.entry,
            Op::StringLen,
            TypeIndex::I64,
            Aux::None,
            0,
            vec![mk],
            Span::none(),
        );
        rewrite_dec(&mut f, &TypeRegistry::new()).unwrap();
        assert_eq!(f.val(len).op, Op::Copy);
        assert_eq!(f.val(len).args[0], l);
    }

    #[test]
    fn test_len_follows_copy_chains() {
        let (mut f, mk, l) = func_with_string_make(9);
        let c1 = f.new_value(
            f.entry,
            Op::Copy,
            TypeIndex::STRING,
            Aux::None,
            0,
            vec![mk],
            Span::none(),
        );
        let len = f.new_value(
            f.entry,
            Op::StringLen,
            TypeIndex::I64,
            Aux::None,
            0,
            vec![c1],
            Span::none(),
        );
        rewrite_dec(&mut f, &TypeRegistry::new()).unwrap();
        assert_eq!(f.val(len).op, Op::Copy);
        assert_eq!(f.val(len).args[0], l);
    }

    #[test]
    fn test_const_string_splits() {
        let mut f = Func::new("t", TypeIndex::I64, false);
        let cs = f.new_value(
            f.entry,
            Op::ConstString,
            TypeIndex::STRING,
            Aux::None,
            0,
            vec![],
            Span::none(),
        );
        let strings = vec!["hello".to_string()];
        rewrite_generic(&mut f, &strings).unwrap();
        let v = f.val(cs);
        assert_eq!(v.op, Op::StringMake);
        assert_eq!(f.val(v.args[0]).op, Op::ConstStringPtr);
        assert_eq!(f.val(v.args[1]).aux_int, 5);
    }

    #[test]
    fn test_concat_becomes_runtime_call() {
        let (mut f, mk1, _) = func_with_string_make(3);
        let p2 = f.const_i64(TypeIndex::I64, 2000, Span::none());
        let l2 = f.const_i64(TypeIndex::I64, 4, Span::none());
        let mk2 = f.new_value(
            f.entry,
            Op::StringMake,
            TypeIndex::STRING,
            Aux::None,
            0,
            vec![p2, l2],
            Span::none(),
        );
        let cat = f.new_value(
            f.entry,
            Op::StringConcat,
            TypeIndex::STRING,
            Aux::None,
            0,
            vec![mk1, mk2],
            Span::none(),
        );
        rewrite_dec(&mut f, &TypeRegistry::new()).unwrap();
        let v = f.val(cat);
        assert_eq!(v.op, Op::StringMake);
        let call = f.val(v.args[0]);
        assert_eq!(call.op, Op::StaticCall);
        assert_eq!(call.aux, Aux::Sym("cot_string_concat".to_string()));
        assert_eq!(call.args.len(), 4);
        let sum = f.val(v.args[1]);
        assert_eq!(sum.op, Op::Add);
    }

    #[test]
    fn test_rewrite_dec_is_idempotent() {
        let (mut f, mk, _) = func_with_string_make(5);
        let len = f.new_value(
            f.entry,
            Op::StringLen,
            TypeIndex::I64,
            Aux::None,
            0,
            vec![mk],
            Span::none(),
        );
        rewrite_dec(&mut f, &TypeRegistry::new()).unwrap();
        let snapshot: Vec<(Op, Vec<ValueId>)> = f
            .values
            .iter()
            .map(|v| (v.op, v.args.clone()))
            .collect();
        rewrite_dec(&mut f, &TypeRegistry::new()).unwrap();
        let after: Vec<(Op, Vec<ValueId>)> = f
            .values
            .iter()
            .map(|v| (v.op, v.args.clone()))
            .collect();
        assert_eq!(snapshot, after);
        let _ = len;
    }
}
