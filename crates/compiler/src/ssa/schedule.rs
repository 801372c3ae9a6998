//! Per-block priority-based topological scheduling.
//!
//! Priorities (lower runs earlier): phi 0, arg 1, select 2, memory store
//! 3, default 4, control 5. Dependency edges run from each argument to
//! its user; memory ordering adds store-chain edges and orders every
//! memory op against the barriers (stores, moves, calls) around it. Ties
//! break on original position. Anything left unscheduled is a bug
//! reported as `ScheduleIncomplete`.

use super::{Func, Op, ValueId};
use crate::debug::{self, Phase};
use crate::error::SsaError;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

const PRI_PHI: u8 = 0;
const PRI_ARG: u8 = 1;
const PRI_SELECT: u8 = 2;
const PRI_STORE: u8 = 3;
const PRI_DEFAULT: u8 = 4;
const PRI_CONTROL: u8 = 5;

pub fn schedule(f: &mut Func) -> Result<(), SsaError> {
    debug::trace_heading(&f.name, "schedule");
    for bi in 0..f.blocks.len() {
        if f.blocks[bi].dead {
            continue;
        }
        schedule_block(f, bi)?;
    }
    if debug::enabled(Phase::Schedule) {
        eprintln!("[schedule] fn {}: {} blocks ordered", f.name, f.blocks.len());
    }
    Ok(())
}

fn priority(f: &Func, block_idx: usize, v: ValueId) -> u8 {
    if f.blocks[block_idx].controls.contains(&v) {
        return PRI_CONTROL;
    }
    let op = f.val(v).op;
    match op {
        Op::Phi => PRI_PHI,
        Op::Arg => PRI_ARG,
        Op::SelectN => PRI_SELECT,
        _ if op.is_store() || op == Op::Move => PRI_STORE,
        _ => PRI_DEFAULT,
    }
}

fn schedule_block(f: &mut Func, block_idx: usize) -> Result<(), SsaError> {
    let ids = f.blocks[block_idx].values.clone();
    if ids.len() <= 1 {
        return Ok(());
    }
    let mut pos_of: HashMap<ValueId, usize> = HashMap::with_capacity(ids.len());
    for (i, &v) in ids.iter().enumerate() {
        pos_of.insert(v, i);
    }

    let mut out_edges: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    let mut indeg: Vec<usize> = vec![0; ids.len()];

    // Value dependencies: an argument precedes its user. Phi arguments
    // come from predecessors (or the phi itself) and are skipped so phis
    // stay schedulable first.
    for (i, &v) in ids.iter().enumerate() {
        if f.val(v).op == Op::Phi {
            continue;
        }
        for &a in &f.val(v).args {
            if let Some(&j) = pos_of.get(&a) {
                if j != i {
                    out_edges[j].push(i);
                    indeg[i] += 1;
                }
            }
        }
    }

    // Memory ordering: barriers (stores, moves, calls) are totally
    // ordered; loads order against the barriers on both sides.
    let mut since_barrier: Vec<usize> = Vec::new();
    let mut last_barrier: Option<usize> = None;
    for (i, &v) in ids.iter().enumerate() {
        let op = f.val(v).op;
        if !op.is_mem_op() {
            continue;
        }
        if op.is_barrier() {
            for &m in &since_barrier {
                out_edges[m].push(i);
                indeg[i] += 1;
            }
            since_barrier.clear();
            if let Some(lb) = last_barrier {
                out_edges[lb].push(i);
                indeg[i] += 1;
            }
            last_barrier = Some(i);
        } else {
            if let Some(lb) = last_barrier {
                out_edges[lb].push(i);
                indeg[i] += 1;
            }
            since_barrier.push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<(u8, usize, u32)>> = BinaryHeap::new();
    for (i, &v) in ids.iter().enumerate() {
        if indeg[i] == 0 {
            ready.push(Reverse((priority(f, block_idx, v), i, v.0)));
        }
    }

    let mut order: Vec<ValueId> = Vec::with_capacity(ids.len());
    while let Some(Reverse((_, i, _))) = ready.pop() {
        let v = ids[i];
        order.push(v);
        for &j in &out_edges[i] {
            indeg[j] -= 1;
            if indeg[j] == 0 {
                ready.push(Reverse((priority(f, block_idx, ids[j]), j, ids[j].0)));
            }
        }
    }

    if order.len() != ids.len() {
        let scheduled: HashMap<ValueId, ()> = order.iter().map(|&v| (v, ())).collect();
        let unscheduled: Vec<u32> = ids
            .iter()
            .filter(|v| !scheduled.contains_key(v))
            .map(|v| v.0)
            .collect();
        return Err(SsaError::ScheduleIncomplete {
            func: f.name.clone(),
            block: block_idx as u32,
            unscheduled,
        });
    }

    f.blocks[block_idx].values = order;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Span;
    use crate::ssa::{Aux, BlockKind};
    use crate::types::TypeIndex;

    #[test]
    fn test_args_scheduled_before_users() {
        let mut f = Func::new("t", TypeIndex::I64, false);
        f.blk_mut(f.entry).kind = BlockKind::Ret;
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
        f.set_control(f.entry, add);
        // Scramble the order.
        f.blk_mut(f.entry).values = vec![add, b, a];
        schedule(&mut f).unwrap();
        let order = &f.blk(f.entry).values;
        let pos = |v: ValueId| order.iter().position(|&x| x == v).unwrap();
        assert!(pos(a) < pos(add));
        assert!(pos(b) < pos(add));
        assert_eq!(*order.last().unwrap(), add, "control is scheduled last");
    }

    #[test]
    fn test_store_load_order_preserved() {
        // store x; load x  -- the load must not move above the store.
        let mut f = Func::new("t", TypeIndex::I64, false);
        let addr = f.const_i64(TypeIndex::I64, 16, Span::none());
        let one = f.const_i64(TypeIndex::I64, 1, Span::none());
        let st = f.new_value(
            f.entry,
            Op::Store,
            TypeIndex::SSA_MEM,
            Aux::None,
            0,
            vec![addr, one],
            Span::none(),
        );
        let ld = f.new_value(
            f.entry,
            Op::Load,
            TypeIndex::I64,
            Aux::None,
            0,
            vec![addr],
            Span::none(),
        );
        schedule(&mut f).unwrap();
        let order = &f.blk(f.entry).values;
        let pos = |v: ValueId| order.iter().position(|&x| x == v).unwrap();
        assert!(pos(st) < pos(ld));
    }

    #[test]
    fn test_load_before_following_store() {
        // load x; store x  -- anti-dependence must also hold.
        let mut f = Func::new("t", TypeIndex::I64, false);
        let addr = f.const_i64(TypeIndex::I64, 16, Span::none());
        let ld = f.new_value(
            f.entry,
            Op::Load,
            TypeIndex::I64,
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
            vec![addr, ld],
            Span::none(),
        );
        let ld2 = f.new_value(
            f.entry,
            Op::Load,
            TypeIndex::I64,
            Aux::None,
            0,
            vec![addr],
            Span::none(),
        );
        schedule(&mut f).unwrap();
        let order = &f.blk(f.entry).values;
        let pos = |v: ValueId| order.iter().position(|&x| x == v).unwrap();
        assert!(pos(ld) < pos(st));
        assert!(pos(st) < pos(ld2));
    }

    #[test]
    fn test_phis_first() {
        let mut f = Func::new("t", TypeIndex::I64, false);
        let c = f.const_i64(TypeIndex::I64, 0, Span::none());
        let phi = f.new_value(
            f.entry,
            Op::Phi,
            TypeIndex::I64,
            Aux::None,
            0,
            vec![c],
            Span::none(),
        );
        let use_phi = f.new_value(
            f.entry,
            Op::Add,
            TypeIndex::I64,
            Aux::None,
            0,
            vec![phi, c],
            Span::none(),
        );
        f.blk_mut(f.entry).values = vec![use_phi, c, phi];
        schedule(&mut f).unwrap();
        assert_eq!(f.blk(f.entry).values[0], phi);
    }
}
