//! Composite decomposition.
//!
//! Splits every remaining pair-typed memory operation into its 8-byte
//! component operations: loads become two loads joined by a make op,
//! stores of a make become two stores, pair-typed Args become two Args,
//! and stray const_strings split like rewritegeneric. Runs a bounded
//! fixpoint per block; afterwards no SSA value is wider than
//! [`super::MAX_SSA_SIZE`].

use super::{Aux, BlockId, Func, Op, ValueId};
use crate::error::SsaError;
use crate::types::{TypeIndex, TypeRegistry};

pub const DECOMPOSE_LIMIT: usize = 10;

pub fn decompose(f: &mut Func, types: &TypeRegistry, strings: &[String]) -> Result<(), SsaError> {
    for bi in 0..f.blocks.len() {
        let block = BlockId(bi as u32);
        if f.blk(block).dead {
            continue;
        }
        let mut iterations = 0;
        loop {
            if iterations >= DECOMPOSE_LIMIT {
                return Err(SsaError::IterationLimit {
                    pass: "decompose",
                    func: f.name.clone(),
                });
            }
            iterations += 1;
            if !decompose_block(f, types, strings, block) {
                break;
            }
        }
    }
    Ok(())
}

/// Move the most recently created value (at the end of the block list)
/// to `pos`, preserving memory-operation ordering for the scheduler.
fn place_at(f: &mut Func, block: BlockId, pos: usize, v: ValueId) {
    let values = &mut f.blk_mut(block).values;
    debug_assert_eq!(values.last().copied(), Some(v));
    values.pop();
    values.insert(pos, v);
}

fn decompose_block(
    f: &mut Func,
    types: &TypeRegistry,
    strings: &[String],
    block: BlockId,
) -> bool {
    let mut changed = false;
    let mut pos = 0;
    while pos < f.blk(block).values.len() {
        let id = f.blk(block).values[pos];
        let op = f.val(id).op;
        let ty = f.val(id).ty;
        match op {
            // Load<pair> addr  =>  make(Load addr, Load (addr+8))
            Op::Load if types.is_pair(ty) => {
                let addr = f.val(id).args[0];
                let span = f.val(id).pos;
                let lo = f.new_value(
                    block,
                    Op::Load,
                    TypeIndex::I64,
                    Aux::None,
                    0,
                    vec![addr],
                    span,
                );
                place_at(f, block, pos, lo);
                let at = f.new_value(
                    block,
                    Op::AddPtr,
                    TypeIndex::I64,
                    Aux::None,
                    8,
                    vec![addr],
                    span,
                );
                place_at(f, block, pos + 1, at);
                let hi = f.new_value(
                    block,
                    Op::Load,
                    TypeIndex::I64,
                    Aux::None,
                    0,
                    vec![at],
                    span,
                );
                place_at(f, block, pos + 2, hi);
                let make_op = if ty == TypeIndex::STRING {
                    Op::StringMake
                } else {
                    Op::SliceMake
                };
                f.reset_value(id, make_op, ty, Aux::None, 0, vec![lo, hi]);
                changed = true;
                pos += 4;
            }
            // Store addr, make(p, l)  =>  two 8-byte stores
            Op::Store if types.is_pair(f.val(f.val(id).args[1]).ty) => {
                let addr = f.val(id).args[0];
                let stored = f.follow_copy(f.val(id).args[1]);
                if !f.val(stored).op.is_make() {
                    pos += 1;
                    continue;
                }
                let span = f.val(id).pos;
                let p = f.val(stored).args[0];
                let l = f.val(stored).args[1];
                f.reset_value(
                    id,
                    Op::Store,
                    TypeIndex::SSA_MEM,
                    Aux::None,
                    0,
                    vec![addr, p],
                );
                let at = f.new_value(
                    block,
                    Op::AddPtr,
                    TypeIndex::I64,
                    Aux::None,
                    8,
                    vec![addr],
                    span,
                );
                place_at(f, block, pos + 1, at);
                let st2 = f.new_value(
                    block,
                    Op::Store,
                    TypeIndex::SSA_MEM,
                    Aux::None,
                    0,
                    vec![at, l],
                    span,
                );
                place_at(f, block, pos + 2, st2);
                changed = true;
                pos += 3;
            }
            // Arg<pair> slot k  =>  make(Arg k, Arg k+1)
            Op::Arg if types.is_pair(ty) => {
                let slot = f.val(id).aux_int;
                let span = f.val(id).pos;
                let a0 = f.new_value(
                    block,
                    Op::Arg,
                    TypeIndex::I64,
                    Aux::None,
                    slot,
                    vec![],
                    span,
                );
                place_at(f, block, pos, a0);
                let a1 = f.new_value(
                    block,
                    Op::Arg,
                    TypeIndex::I64,
                    Aux::None,
                    slot + 1,
                    vec![],
                    span,
                );
                place_at(f, block, pos + 1, a1);
                let make_op = if ty == TypeIndex::STRING {
                    Op::StringMake
                } else {
                    Op::SliceMake
                };
                f.reset_value(id, make_op, ty, Aux::None, 0, vec![a0, a1]);
                changed = true;
                pos += 3;
            }
            // Stray literal: split like rewritegeneric.
            Op::ConstString => {
                let idx = f.val(id).aux_int;
                let span = f.val(id).pos;
                let len = strings
                    .get(idx as usize)
                    .map(|s| s.len() as i64)
                    .unwrap_or(0);
                let ptr = f.new_value(
                    block,
                    Op::ConstStringPtr,
                    TypeIndex::I64,
                    Aux::None,
                    idx,
                    vec![],
                    span,
                );
                place_at(f, block, pos, ptr);
                let len_v = f.const_i64(TypeIndex::I64, len, span);
                f.reset_value(
                    id,
                    Op::StringMake,
                    TypeIndex::STRING,
                    Aux::None,
                    0,
                    vec![ptr, len_v],
                );
                changed = true;
                pos += 2;
            }
            _ => pos += 1,
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Span;

    #[test]
    fn test_load_string_decomposes() {
        let types = TypeRegistry::new();
        let mut f = Func::new("t", TypeIndex::I64, false);
        let addr = f.const_i64(TypeIndex::I64, 64, Span::none());
        let ld = f.new_value(
            f.entry,
            Op::Load,
            TypeIndex::STRING,
            Aux::None,
            0,
            vec![addr],
            Span::none(),
        );
        decompose(&mut f, &types, &[]).unwrap();
        let v = f.val(ld);
        assert_eq!(v.op, Op::StringMake);
        assert_eq!(f.val(v.args[0]).op, Op::Load);
        assert_eq!(f.val(v.args[1]).op, Op::Load);
        // Second load goes through addr + 8.
        let hi_addr = f.val(v.args[1]).args[0];
        assert_eq!(f.val(hi_addr).op, Op::AddPtr);
        assert_eq!(f.val(hi_addr).aux_int, 8);
        f.verify_sizes(&types).unwrap();
    }

    #[test]
    fn test_store_string_splits_in_place() {
        let types = TypeRegistry::new();
        let mut f = Func::new("t", TypeIndex::I64, false);
        let addr = f.const_i64(TypeIndex::I64, 64, Span::none());
        let p = f.const_i64(TypeIndex::I64, 8, Span::none());
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
        let st = f.new_value(
            f.entry,
            Op::Store,
            TypeIndex::SSA_MEM,
            Aux::None,
            0,
            vec![addr, mk],
            Span::none(),
        );
        decompose(&mut f, &types, &[]).unwrap();
        assert_eq!(f.val(st).op, Op::Store);
        assert_eq!(f.val(st).args[1], p, "first store writes the pointer half");
        let stores: Vec<_> = f
            .values
            .iter()
            .filter(|v| v.op == Op::Store)
            .collect();
        assert_eq!(stores.len(), 2);
    }

    #[test]
    fn test_pair_arg_splits_into_two_slots() {
        let types = TypeRegistry::new();
        let mut f = Func::new("t", TypeIndex::I64, false);
        let arg = f.new_value(
            f.entry,
            Op::Arg,
            TypeIndex::STRING,
            Aux::None,
            3,
            vec![],
            Span::none(),
        );
        decompose(&mut f, &types, &[]).unwrap();
        let v = f.val(arg);
        assert_eq!(v.op, Op::StringMake);
        assert_eq!(f.val(v.args[0]).aux_int, 3);
        assert_eq!(f.val(v.args[1]).aux_int, 4);
    }

    #[test]
    fn test_decompose_idempotent() {
        let types = TypeRegistry::new();
        let mut f = Func::new("t", TypeIndex::I64, false);
        let addr = f.const_i64(TypeIndex::I64, 64, Span::none());
        f.new_value(
            f.entry,
            Op::Load,
            TypeIndex::STRING,
            Aux::None,
            0,
            vec![addr],
            Span::none(),
        );
        decompose(&mut f, &types, &[]).unwrap();
        let snapshot: Vec<(Op, Vec<ValueId>)> =
            f.values.iter().map(|v| (v.op, v.args.clone())).collect();
        decompose(&mut f, &types, &[]).unwrap();
        let after: Vec<(Op, Vec<ValueId>)> =
            f.values.iter().map(|v| (v.op, v.args.clone())).collect();
        assert_eq!(snapshot, after, "decompose twice == decompose once");
    }
}
