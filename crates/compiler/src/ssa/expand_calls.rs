//! Call ABI expansion.
//!
//! After the decomposition passes, calls still carry pair-typed
//! arguments and results. This pass spreads pair arguments into two
//! scalar slots, turns pair results into a two-result call with
//! `select_n` extractions rebuilt into a make op, and checks that no
//! value wider than [`super::MAX_SSA_SIZE`] survives. Aggregates wider
//! than a pair already travel as opaque pointers to caller-owned slots.

use super::{Aux, Func, Op, ValueId, MAX_SSA_SIZE};
use crate::error::SsaError;
use crate::types::{TypeIndex, TypeRegistry};

pub fn expand_calls(f: &mut Func, types: &TypeRegistry) -> Result<(), SsaError> {
    expand_args(f, types)?;
    expand_results(f, types);
    check_widths(f, types)
}

/// Spread pair-typed call arguments into their two components.
fn expand_args(f: &mut Func, types: &TypeRegistry) -> Result<(), SsaError> {
    let n = f.values.len();
    for i in 0..n {
        let id = ValueId(i as u32);
        if f.val(id).op != Op::StaticCall {
            continue;
        }
        let args = f.val(id).args.clone();
        let mut new_args = Vec::with_capacity(args.len());
        let mut changed = false;
        for a in args {
            let aa = f.follow_copy(a);
            if types.is_pair(f.val(aa).ty) {
                if !f.val(aa).op.is_make() {
                    return Err(SsaError::Verify {
                        func: f.name.clone(),
                        message: format!("call argument v{} is an unexpanded pair", aa.0),
                    });
                }
                new_args.push(f.val(aa).args[0]);
                new_args.push(f.val(aa).args[1]);
                changed = true;
            } else {
                new_args.push(a);
            }
        }
        if changed {
            let op = f.val(id).op;
            let ty = f.val(id).ty;
            let aux = f.val(id).aux.clone();
            let aux_int = f.val(id).aux_int;
            f.reset_value(id, op, ty, aux, aux_int, new_args);
        }
    }
    Ok(())
}

/// Pair-returning calls become two-result calls: the pair is rebuilt
/// from `select_n 0` and `select_n 1` and all other uses are redirected
/// to the rebuilt make.
fn expand_results(f: &mut Func, types: &TypeRegistry) {
    let n = f.values.len();
    for i in 0..n {
        let id = ValueId(i as u32);
        if f.val(id).op != Op::StaticCall || !types.is_pair(f.val(id).ty) {
            continue;
        }
        let pair_ty = f.val(id).ty;
        let block = f.val(id).block;
        let span = f.val(id).pos;
        let pos_in_block = f
            .blk(block)
            .values
            .iter()
            .position(|&v| v == id)
            .expect("call value is in its block");

        let sel0 = f.new_value(
            block,
            Op::SelectN,
            TypeIndex::I64,
            Aux::None,
            0,
            vec![id],
            span,
        );
        move_to(f, block, pos_in_block + 1, sel0);
        let sel1 = f.new_value(
            block,
            Op::SelectN,
            TypeIndex::I64,
            Aux::None,
            1,
            vec![id],
            span,
        );
        move_to(f, block, pos_in_block + 2, sel1);
        let make_op = if pair_ty == TypeIndex::STRING {
            Op::StringMake
        } else {
            Op::SliceMake
        };
        let mk = f.new_value(
            block,
            make_op,
            pair_ty,
            Aux::None,
            0,
            vec![sel0, sel1],
            span,
        );
        move_to(f, block, pos_in_block + 3, mk);

        // Redirect every other use of the call to the rebuilt pair.
        let total = f.values.len();
        for wi in 0..total {
            let wid = ValueId(wi as u32);
            if wid == sel0 || wid == sel1 || f.val(wid).op == Op::Invalid {
                continue;
            }
            let mut hits = Vec::new();
            for (k, &a) in f.val(wid).args.iter().enumerate() {
                if a == id {
                    hits.push(k);
                }
            }
            for k in hits {
                f.val_mut(wid).args[k] = mk;
                f.val_mut(id).uses -= 1;
                f.val_mut(mk).uses += 1;
            }
        }
        for bi in 0..f.blocks.len() {
            let controls = f.blocks[bi].controls.clone();
            for (k, c) in controls.iter().enumerate() {
                if *c == id {
                    f.blocks[bi].controls[k] = mk;
                    f.val_mut(id).uses -= 1;
                    f.val_mut(mk).uses += 1;
                }
            }
        }

        // The call now yields two raw result slots.
        let v = f.val_mut(id);
        v.ty = TypeIndex::TUPLE;
        v.aux_int = 2;
    }
}

fn move_to(f: &mut Func, block: super::BlockId, pos: usize, v: ValueId) {
    let values = &mut f.blk_mut(block).values;
    debug_assert_eq!(values.last().copied(), Some(v));
    values.pop();
    let pos = pos.min(values.len());
    values.insert(pos, v);
}

/// Invariant 5: nothing wider than MAX_SSA_SIZE remains.
fn check_widths(f: &Func, types: &TypeRegistry) -> Result<(), SsaError> {
    for v in &f.values {
        if v.op == Op::Invalid || v.ty == TypeIndex::TUPLE {
            continue;
        }
        if types.size_of(v.ty) > MAX_SSA_SIZE {
            return Err(SsaError::Verify {
                func: f.name.clone(),
                message: format!(
                    "v{} survived expansion with a {}-byte type",
                    v.id.0,
                    types.size_of(v.ty)
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Span;
    use crate::ssa::BlockKind;

    #[test]
    fn test_pair_argument_spreads() {
        let types = TypeRegistry::new();
        let mut f = Func::new("t", TypeIndex::I64, false);
        let p = f.const_i64(TypeIndex::I64, 100, Span::none());
        let l = f.const_i64(TypeIndex::I64, 5, Span::none());
        let mk = f.new_value(
            f.entry,
            Op::StringMake,
            TypeIndex::STRING,
            Aux::None,
            0,
            vec![p, l],
            Span::none(),
        );
        let call = f.new_value(
            f.entry,
            Op::StaticCall,
            TypeIndex::VOID,
            Aux::Sym("__test_print_name".to_string()),
            0,
            vec![mk],
            Span::none(),
        );
        expand_calls(&mut f, &types).unwrap();
        let v = f.val(call);
        assert_eq!(v.args.len(), 2);
        assert_eq!(v.args[0], p);
        assert_eq!(v.args[1], l);
    }

    #[test]
    fn test_pair_result_becomes_selects() {
        let types = TypeRegistry::new();
        let mut f = Func::new("t", TypeIndex::I64, false);
        f.blk_mut(f.entry).kind = BlockKind::Ret;
        let call = f.new_value(
            f.entry,
            Op::StaticCall,
            TypeIndex::STRING,
            Aux::Sym("make_name".to_string()),
            0,
            vec![],
            Span::none(),
        );
        let len = f.new_value(
            f.entry,
            Op::StringLen,
            TypeIndex::I64,
            Aux::None,
            0,
            vec![call],
            Span::none(),
        );
        expand_calls(&mut f, &types).unwrap();
        assert_eq!(f.val(call).ty, TypeIndex::TUPLE);
        assert_eq!(f.val(call).aux_int, 2);
        // The extraction now reads the rebuilt pair, not the raw call.
        let src = f.val(len).args[0];
        assert!(f.val(src).op.is_make());
        assert_eq!(f.val(f.val(src).args[0]).op, Op::SelectN);
        f.verify(&types).unwrap();
    }

    #[test]
    fn test_width_check_rejects_wide_values() {
        let mut types = TypeRegistry::new();
        let wide = types.make_struct(
            "Big",
            vec![
                ("a".to_string(), TypeIndex::I64),
                ("b".to_string(), TypeIndex::I64),
                ("c".to_string(), TypeIndex::I64),
            ],
        );
        let mut f = Func::new("t", TypeIndex::I64, false);
        f.new_value(
            f.entry,
            Op::Load,
            wide,
            Aux::None,
            0,
            vec![],
            Span::none(),
        );
        assert!(expand_calls(&mut f, &types).is_err());
    }
}
