//! IR -> SSA construction.
//!
//! Classical construction with local value numbering per block and
//! forward references for phis: reads of a variable not yet defined in a
//! block synthesize a `FwdRef`; after all blocks are converted, a
//! resolver walks each block's out-definitions and replaces every fwd_ref
//! with a copy (all predecessors agree) or a phi (they do not).
//!
//! Scalar, never-address-taken locals become SSA variables. Everything
//! else lives in the stack frame: pair-typed locals load as two 8-byte
//! loads joined by `slice_make` (STRING is internally a slice), and
//! aggregates are manipulated through addresses.

use super::{Aux, BlockId, BlockKind, Func, Op, ValueId};
use crate::ast::{BinOp, UnOp};
use crate::debug::{self, Phase};
use crate::diag::Span;
use crate::error::SsaError;
use crate::ir::{IrFunc, IrOp, IrTerm, LocalId, NodeIndex};
use crate::types::{align_up, TypeIndex, TypeRegistry};
use std::collections::HashMap;

pub fn build(ir: &IrFunc, types: &TypeRegistry) -> Result<Func, SsaError> {
    debug::trace_heading(&ir.name, "ssa");
    let mut b = SsaBuilder::new(ir, types);
    b.run()?;
    if debug::enabled(Phase::Ssa) {
        eprintln!(
            "[ssa] fn {}: {} blocks, {} values, frame {} bytes",
            b.f.name,
            b.f.blocks.len(),
            b.f.live_value_count(),
            b.f.frame_size
        );
    }
    Ok(b.f)
}

struct SsaBuilder<'a> {
    ir: &'a IrFunc,
    types: &'a TypeRegistry,
    f: Func,
    /// IR block index -> SSA block.
    block_map: Vec<BlockId>,
    /// IR node -> produced SSA value.
    node_val: HashMap<NodeIndex, ValueId>,
    /// Formal parameter values by parameter index.
    param_vals: Vec<ValueId>,
    /// Current block's variable definitions.
    cur_vars: HashMap<LocalId, ValueId>,
    /// Out-definitions per converted block.
    defvars: HashMap<BlockId, HashMap<LocalId, ValueId>>,
    /// Pending forward references: (block, local, fwd_ref value).
    fwd_list: Vec<(BlockId, LocalId, ValueId)>,
    fwd_cache: HashMap<(BlockId, LocalId), ValueId>,
    /// Frame offset per memory-resident local.
    local_offsets: Vec<Option<u32>>,
    ssa_able: Vec<bool>,
    cur: BlockId,
}

impl<'a> SsaBuilder<'a> {
    fn new(ir: &'a IrFunc, types: &'a TypeRegistry) -> SsaBuilder<'a> {
        let f = Func::new(&ir.name, ir.ret, ir.exported);
        SsaBuilder {
            ir,
            types,
            f,
            block_map: Vec::new(),
            node_val: HashMap::new(),
            param_vals: Vec::new(),
            cur_vars: HashMap::new(),
            defvars: HashMap::new(),
            fwd_list: Vec::new(),
            fwd_cache: HashMap::new(),
            local_offsets: Vec::new(),
            ssa_able: Vec::new(),
            cur: BlockId(0),
        }
    }

    fn missing(&self, what: impl Into<String>) -> SsaError {
        SsaError::MissingValue {
            func: self.f.name.clone(),
            what: what.into(),
        }
    }

    fn run(&mut self) -> Result<(), SsaError> {
        self.classify_locals();
        self.f.ret_pair = self.types.is_pair(self.ir.ret);

        // One SSA block per IR block; index 0 is the entry both sides.
        self.block_map.push(self.f.entry);
        for _ in 1..self.ir.blocks.len() {
            let b = self.f.add_block(BlockKind::Plain);
            self.block_map.push(b);
        }

        self.build_params();

        for (i, ir_block) in self.ir.blocks.iter().enumerate() {
            self.cur = self.block_map[i];
            self.cur_vars.clear();
            for &node in &ir_block.nodes {
                self.convert_node(node)?;
            }
            let out = std::mem::take(&mut self.cur_vars);
            self.defvars.insert(self.cur, out);
            self.convert_term(ir_block.term.as_ref())?;
        }

        self.insert_phis()?;
        self.reorder_phis();
        Ok(())
    }

    /// Decide which locals become SSA variables and assign frame offsets
    /// to the rest.
    fn classify_locals(&mut self) {
        let mut frame = 0u32;
        for local in &self.ir.locals {
            let scalar = self.types.is_scalar(local.ty) && local.size <= 8;
            let ssa = scalar && !local.addr_taken;
            self.ssa_able.push(ssa);
            if ssa {
                self.local_offsets.push(None);
            } else {
                frame = align_up(frame, 8);
                self.local_offsets.push(Some(frame));
                frame += align_up(local.size.max(8), 8);
            }
        }
        self.f.frame_size = align_up(frame, 16);
    }

    /// The three-phase parameter ABI: pair-typed parameters occupy two
    /// consecutive argument slots joined by a make op.
    fn build_params(&mut self) {
        let entry = self.f.entry;
        let mut slot = 0i64;
        for i in 0..self.ir.param_count as usize {
            let ty = self.ir.locals[i].ty;
            if self.types.is_pair(ty) {
                let a0 = self.f.new_value(
                    entry,
                    Op::Arg,
                    TypeIndex::I64,
                    Aux::None,
                    slot,
                    vec![],
                    Span::none(),
                );
                let a1 = self.f.new_value(
                    entry,
                    Op::Arg,
                    TypeIndex::I64,
                    Aux::None,
                    slot + 1,
                    vec![],
                    Span::none(),
                );
                let make_op = if ty == TypeIndex::STRING {
                    Op::StringMake
                } else {
                    Op::SliceMake
                };
                let mk = self
                    .f
                    .new_value(entry, make_op, ty, Aux::None, 0, vec![a0, a1], Span::none());
                self.f.params.push(a0);
                self.f.params.push(a1);
                self.param_vals.push(mk);
                slot += 2;
            } else {
                let arg =
                    self.f
                        .new_value(entry, Op::Arg, ty, Aux::None, slot, vec![], Span::none());
                self.f.params.push(arg);
                self.param_vals.push(arg);
                slot += 1;
            }
        }
    }

    fn value_of(&self, node: NodeIndex) -> Result<ValueId, SsaError> {
        self.node_val
            .get(&node)
            .copied()
            .ok_or_else(|| self.missing(format!("node {}", node.0)))
    }

    /// Current SSA value of a variable, synthesizing a fwd_ref when the
    /// block has not defined it yet.
    fn variable(&mut self, local: LocalId, ty: TypeIndex) -> ValueId {
        if let Some(&v) = self.cur_vars.get(&local) {
            return v;
        }
        if let Some(&v) = self.fwd_cache.get(&(self.cur, local)) {
            self.cur_vars.insert(local, v);
            return v;
        }
        let v = self.f.new_value(
            self.cur,
            Op::FwdRef,
            ty,
            Aux::None,
            local.0 as i64,
            vec![],
            Span::none(),
        );
        self.fwd_cache.insert((self.cur, local), v);
        self.fwd_list.push((self.cur, local, v));
        self.cur_vars.insert(local, v);
        v
    }

    fn local_addr(&mut self, local: LocalId, pos: Span) -> ValueId {
        let offset = self.local_offsets[local.0 as usize]
            .expect("address of an SSA-promoted local");
        self.f.new_value(
            self.cur,
            Op::LocalAddr,
            TypeIndex::I64,
            Aux::None,
            offset as i64,
            vec![],
            pos,
        )
    }

    fn add_ptr(&mut self, addr: ValueId, offset: i64, pos: Span) -> ValueId {
        if offset == 0 {
            return addr;
        }
        self.f.new_value(
            self.cur,
            Op::AddPtr,
            TypeIndex::I64,
            Aux::None,
            offset,
            vec![addr],
            pos,
        )
    }

    /// Load a value of `ty` from `addr`. Pair-typed loads from locals
    /// decompose immediately into two 8-byte loads joined by slice_make.
    fn emit_load_decomposed(&mut self, addr: ValueId, ty: TypeIndex, pos: Span) -> ValueId {
        let lo = self.f.new_value(
            self.cur,
            Op::Load,
            TypeIndex::I64,
            Aux::None,
            0,
            vec![addr],
            pos,
        );
        let hi_addr = self.add_ptr(addr, 8, pos);
        let hi = self.f.new_value(
            self.cur,
            Op::Load,
            TypeIndex::I64,
            Aux::None,
            0,
            vec![hi_addr],
            pos,
        );
        // STRING is internally a slice; emit slice_make and let the
        // decomposition passes accept either spelling.
        self.f
            .new_value(self.cur, Op::SliceMake, ty, Aux::None, 0, vec![lo, hi], pos)
    }

    fn emit_store(&mut self, addr: ValueId, value: ValueId, pos: Span) -> ValueId {
        self.f.new_value(
            self.cur,
            Op::Store,
            TypeIndex::SSA_MEM,
            Aux::None,
            0,
            vec![addr, value],
            pos,
        )
    }

    fn convert_node(&mut self, node: NodeIndex) -> Result<(), SsaError> {
        let n = self.ir.node(node);
        let pos = n.span;
        let ty = n.ty;
        let v = match &n.op {
            IrOp::ConstInt(x) => Some(self.f.const_i64(ty, *x, pos)),
            IrOp::ConstBool(x) => Some(self.f.const_i64(TypeIndex::BOOL, *x as i64, pos)),
            IrOp::ConstFloat(x) => Some(self.f.new_value(
                self.cur,
                Op::ConstF64,
                ty,
                Aux::F64(*x),
                0,
                vec![],
                pos,
            )),
            IrOp::ConstString(idx) => Some(self.f.new_value(
                self.cur,
                Op::ConstString,
                TypeIndex::STRING,
                Aux::None,
                *idx as i64,
                vec![],
                pos,
            )),
            IrOp::Param(i) => Some(
                *self
                    .param_vals
                    .get(*i as usize)
                    .ok_or_else(|| self.missing(format!("parameter {}", i)))?,
            ),
            IrOp::Binary(op) => {
                let a = self.value_of(n.args[0])?;
                let b = self.value_of(n.args[1])?;
                let ssa_op = binop_to_ssa(*op).ok_or_else(|| self.missing("binary op"))?;
                Some(
                    self.f
                        .new_value(self.cur, ssa_op, ty, Aux::None, 0, vec![a, b], pos),
                )
            }
            IrOp::Unary(op) => {
                let a = self.value_of(n.args[0])?;
                match op {
                    UnOp::Neg => {
                        Some(self.f.new_value(self.cur, Op::Neg, ty, Aux::None, 0, vec![a], pos))
                    }
                    UnOp::Not => {
                        Some(self.f.new_value(self.cur, Op::Not, ty, Aux::None, 0, vec![a], pos))
                    }
                    UnOp::BitNot => {
                        let m1 = self.f.const_i64(ty, -1, pos);
                        Some(self.f.new_value(
                            self.cur,
                            Op::Xor,
                            ty,
                            Aux::None,
                            0,
                            vec![a, m1],
                            pos,
                        ))
                    }
                }
            }
            IrOp::LoadLocal(l) => {
                let lty = self.ir.local(*l).ty;
                if self.ssa_able[l.0 as usize] {
                    Some(self.variable(*l, lty))
                } else if self.types.is_pair(lty) {
                    let addr = self.local_addr(*l, pos);
                    Some(self.emit_load_decomposed(addr, lty, pos))
                } else {
                    let addr = self.local_addr(*l, pos);
                    Some(self.f.new_value(
                        self.cur,
                        Op::Load,
                        lty,
                        Aux::None,
                        0,
                        vec![addr],
                        pos,
                    ))
                }
            }
            IrOp::StoreLocal(l) => {
                let val = self.value_of(n.args[0])?;
                if self.ssa_able[l.0 as usize] {
                    self.cur_vars.insert(*l, val);
                    None
                } else {
                    let addr = self.local_addr(*l, pos);
                    Some(self.emit_store(addr, val, pos))
                }
            }
            IrOp::LoadLocalField { local, offset } => {
                let addr = self.local_addr(*local, pos);
                let at = self.add_ptr(addr, *offset as i64, pos);
                if self.types.is_pair(ty) {
                    Some(self.emit_load_decomposed(at, ty, pos))
                } else {
                    Some(
                        self.f
                            .new_value(self.cur, Op::Load, ty, Aux::None, 0, vec![at], pos),
                    )
                }
            }
            IrOp::StoreLocalField { local, offset } => {
                let val = self.value_of(n.args[0])?;
                let addr = self.local_addr(*local, pos);
                let at = self.add_ptr(addr, *offset as i64, pos);
                Some(self.emit_store(at, val, pos))
            }
            IrOp::LocalAddr(l) => Some(self.local_addr(*l, pos)),
            IrOp::GlobalAddr(name) => Some(self.f.new_value(
                self.cur,
                Op::GlobalAddr,
                TypeIndex::I64,
                Aux::Sym(name.clone()),
                0,
                vec![],
                pos,
            )),
            IrOp::PtrLoad { offset } => {
                let base = self.value_of(n.args[0])?;
                let at = self.add_ptr(base, *offset as i64, pos);
                // Whole-pair loads stay intact here; the decompose pass
                // splits them.
                Some(
                    self.f
                        .new_value(self.cur, Op::Load, ty, Aux::None, 0, vec![at], pos),
                )
            }
            IrOp::PtrStore { offset } => {
                let base = self.value_of(n.args[0])?;
                let val = self.value_of(n.args[1])?;
                let at = self.add_ptr(base, *offset as i64, pos);
                Some(self.emit_store(at, val, pos))
            }
            IrOp::IndexAddr { elem_size } => {
                let base = self.value_of(n.args[0])?;
                let idx = self.value_of(n.args[1])?;
                Some(self.f.new_value(
                    self.cur,
                    Op::OffPtr,
                    TypeIndex::I64,
                    Aux::None,
                    *elem_size as i64,
                    vec![base, idx],
                    pos,
                ))
            }
            IrOp::Call { name } => {
                let mut args = Vec::with_capacity(n.args.len());
                for &a in &n.args {
                    args.push(self.value_of(a)?);
                }
                // Aggregate results travel as opaque pointers.
                let call_ty = if self.types.size_of(ty) > super::MAX_SSA_SIZE {
                    TypeIndex::I64
                } else {
                    ty
                };
                Some(self.f.new_value(
                    self.cur,
                    Op::StaticCall,
                    call_ty,
                    Aux::Sym(name.clone()),
                    0,
                    args,
                    pos,
                ))
            }
            IrOp::TypeMetadata { type_name } => Some(self.f.new_value(
                self.cur,
                Op::MetadataAddr,
                TypeIndex::I64,
                Aux::Sym(type_name.clone()),
                0,
                vec![],
                pos,
            )),
            IrOp::StringConcat => {
                let a = self.value_of(n.args[0])?;
                let b = self.value_of(n.args[1])?;
                Some(self.f.new_value(
                    self.cur,
                    Op::StringConcat,
                    TypeIndex::STRING,
                    Aux::None,
                    0,
                    vec![a, b],
                    pos,
                ))
            }
            IrOp::StringPtr | IrOp::PairFirst => {
                let a = self.value_of(n.args[0])?;
                let op = if matches!(n.op, IrOp::StringPtr) {
                    Op::StringPtr
                } else {
                    Op::SlicePtr
                };
                Some(
                    self.f
                        .new_value(self.cur, op, TypeIndex::I64, Aux::None, 0, vec![a], pos),
                )
            }
            IrOp::StringLen | IrOp::SliceLen | IrOp::PairSecond => {
                let a = self.value_of(n.args[0])?;
                let op = match n.op {
                    IrOp::StringLen => Op::StringLen,
                    IrOp::SliceLen => Op::SliceLen,
                    _ => Op::SliceLen,
                };
                Some(
                    self.f
                        .new_value(self.cur, op, ty, Aux::None, 0, vec![a], pos),
                )
            }
            IrOp::PairMake => {
                let a = self.value_of(n.args[0])?;
                let b = self.value_of(n.args[1])?;
                Some(
                    self.f
                        .new_value(self.cur, Op::SliceMake, ty, Aux::None, 0, vec![a, b], pos),
                )
            }
            IrOp::MemCopy { bytes } => {
                let dst = self.value_of(n.args[0])?;
                let src = self.value_of(n.args[1])?;
                Some(self.f.new_value(
                    self.cur,
                    Op::Move,
                    TypeIndex::SSA_MEM,
                    Aux::None,
                    *bytes as i64,
                    vec![dst, src],
                    pos,
                ))
            }
            IrOp::Cast => {
                let a = self.value_of(n.args[0])?;
                let from = self.ir.node(n.args[0]).ty;
                Some(self.convert_cast(a, from, ty, pos))
            }
        };
        if let Some(v) = v {
            self.node_val.insert(node, v);
        }
        Ok(())
    }

    fn convert_cast(
        &mut self,
        a: ValueId,
        from: TypeIndex,
        to: TypeIndex,
        pos: Span,
    ) -> ValueId {
        let from_float = self.types.is_float(from);
        let to_float = self.types.is_float(to);
        if from_float && to_float {
            return self
                .f
                .new_value(self.cur, Op::Copy, to, Aux::None, 0, vec![a], pos);
        }
        if from_float {
            return self
                .f
                .new_value(self.cur, Op::FToI, to, Aux::None, 0, vec![a], pos);
        }
        if to_float {
            return self
                .f
                .new_value(self.cur, Op::IToF, to, Aux::None, 0, vec![a], pos);
        }
        let from_bits = (self.types.size_of(from).max(1) * 8) as i64;
        let to_bits = (self.types.size_of(to).max(1) * 8) as i64;
        if to_bits > from_bits {
            let op = if self.types.is_signed(from) {
                Op::SignExt
            } else {
                Op::ZeroExt
            };
            self.f
                .new_value(self.cur, op, to, Aux::None, from_bits, vec![a], pos)
        } else if to_bits < from_bits {
            self.f
                .new_value(self.cur, Op::Trunc, to, Aux::None, to_bits, vec![a], pos)
        } else {
            self.f
                .new_value(self.cur, Op::Copy, to, Aux::None, 0, vec![a], pos)
        }
    }

    fn convert_term(&mut self, term: Option<&IrTerm>) -> Result<(), SsaError> {
        let cur = self.cur;
        match term {
            Some(IrTerm::Jump(t)) => {
                self.f.blk_mut(cur).kind = BlockKind::Plain;
                let target = self.block_map[t.0 as usize];
                self.f.add_edge(cur, target);
            }
            Some(IrTerm::Branch {
                cond,
                then_blk,
                else_blk,
            }) => {
                let c = self.value_of(*cond)?;
                self.f.blk_mut(cur).kind = BlockKind::If;
                self.f.set_control(cur, c);
                let t = self.block_map[then_blk.0 as usize];
                let e = self.block_map[else_blk.0 as usize];
                self.f.add_edge(cur, t);
                self.f.add_edge(cur, e);
            }
            Some(IrTerm::Return(opt)) => {
                self.f.blk_mut(cur).kind = BlockKind::Ret;
                if let Some(node) = opt {
                    let v = self.value_of(*node)?;
                    self.f.set_control(cur, v);
                }
            }
            Some(IrTerm::Trap) | None => {
                self.f.blk_mut(cur).kind = BlockKind::Exit;
            }
        }
        Ok(())
    }

    /// Resolve forward references: a fwd_ref whose predecessors agree
    /// becomes a copy; otherwise it becomes a phi with one argument per
    /// predecessor.
    fn insert_phis(&mut self) -> Result<(), SsaError> {
        let mut i = 0;
        while i < self.fwd_list.len() {
            let (block, local, v) = self.fwd_list[i];
            i += 1;
            let preds: Vec<BlockId> = self
                .f
                .blk(block)
                .preds
                .iter()
                .map(|e| e.block)
                .collect();
            let ty = self.f.val(v).ty;
            if preds.is_empty() {
                // Unreachable or uninitialized read: a zero value.
                if self.types.is_float(ty) {
                    self.f
                        .reset_value(v, Op::ConstF64, ty, Aux::F64(0.0), 0, vec![]);
                } else {
                    self.f.reset_value(v, Op::ConstI64, ty, Aux::None, 0, vec![]);
                }
                continue;
            }
            let mut args = Vec::with_capacity(preds.len());
            for p in &preds {
                args.push(self.lookup_var_outgoing(*p, local, ty));
            }
            let mut unique: Option<ValueId> = None;
            let mut mixed = false;
            for &a in &args {
                if a == v {
                    continue;
                }
                match unique {
                    None => unique = Some(a),
                    Some(u) if u == a => {}
                    Some(_) => {
                        mixed = true;
                        break;
                    }
                }
            }
            match (mixed, unique) {
                (false, Some(w)) => {
                    self.f.reset_value(v, Op::Copy, ty, Aux::None, 0, vec![w]);
                }
                _ => {
                    self.f.reset_value(v, Op::Phi, ty, Aux::None, 0, args);
                }
            }
        }
        Ok(())
    }

    /// The value of `local` on exit from `b`, walking single-predecessor
    /// chains and synthesizing fwd_refs at joins.
    fn lookup_var_outgoing(&mut self, mut b: BlockId, local: LocalId, ty: TypeIndex) -> ValueId {
        loop {
            if let Some(&v) = self.defvars.get(&b).and_then(|m| m.get(&local)) {
                return v;
            }
            if let Some(&v) = self.fwd_cache.get(&(b, local)) {
                return v;
            }
            let preds = &self.f.blk(b).preds;
            if preds.len() == 1 {
                b = preds[0].block;
                continue;
            }
            let v = self.f.new_value(
                b,
                Op::FwdRef,
                ty,
                Aux::None,
                local.0 as i64,
                vec![],
                Span::none(),
            );
            self.fwd_cache.insert((b, local), v);
            self.defvars.entry(b).or_default().insert(local, v);
            self.fwd_list.push((b, local, v));
            return v;
        }
    }

    /// Move phis to the front of each block's value list.
    fn reorder_phis(&mut self) {
        for b in 0..self.f.blocks.len() {
            let ids = self.f.blocks[b].values.clone();
            let (phis, rest): (Vec<ValueId>, Vec<ValueId>) = ids
                .into_iter()
                .partition(|&v| self.f.val(v).op == Op::Phi);
            if !phis.is_empty() {
                let mut ordered = phis;
                ordered.extend(rest);
                self.f.blocks[b].values = ordered;
            }
        }
    }
}

fn binop_to_ssa(op: BinOp) -> Option<Op> {
    Some(match op {
        BinOp::Add => Op::Add,
        BinOp::Sub => Op::Sub,
        BinOp::Mul => Op::Mul,
        BinOp::Div => Op::Div,
        BinOp::Rem => Op::Rem,
        BinOp::BitAnd => Op::And,
        BinOp::BitOr => Op::Or,
        BinOp::BitXor => Op::Xor,
        BinOp::Shl => Op::Shl,
        BinOp::Shr => Op::Shr,
        BinOp::Eq => Op::Eq,
        BinOp::Ne => Op::Ne,
        BinOp::Lt => Op::Lt,
        BinOp::Le => Op::Le,
        BinOp::Gt => Op::Gt,
        BinOp::Ge => Op::Ge,
        BinOp::Concat => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::FuncBuilder;
    use crate::types::TypeRegistry;

    #[test]
    fn test_build_return_const() {
        let types = TypeRegistry::new();
        let mut fb = FuncBuilder::new("main", TypeIndex::I64, true);
        let v = fb.emit_const_int(42, TypeIndex::I64, Span::none());
        fb.set_term(IrTerm::Return(Some(v)));
        let ir = fb.finish();
        let f = build(&ir, &types).unwrap();
        f.verify(&types).unwrap();
        let entry = f.blk(f.entry);
        assert_eq!(entry.kind, BlockKind::Ret);
        assert_eq!(entry.controls.len(), 1);
        let ret = f.val(entry.controls[0]);
        assert_eq!(ret.op, Op::ConstI64);
        assert_eq!(ret.aux_int, 42);
    }

    #[test]
    fn test_ssa_var_threading_no_phi() {
        // x = 1; x = x + 1; return x  -- straight line, no phis.
        let types = TypeRegistry::new();
        let mut fb = FuncBuilder::new("f", TypeIndex::I64, false);
        let x = fb.add_local("x", TypeIndex::I64, 8);
        let one = fb.emit_const_int(1, TypeIndex::I64, Span::none());
        fb.emit_store_local(x, one, Span::none());
        let load = fb.emit_load_local(x, Span::none());
        let one2 = fb.emit_const_int(1, TypeIndex::I64, Span::none());
        let sum = fb.emit(
            IrOp::Binary(BinOp::Add),
            vec![load, one2],
            TypeIndex::I64,
            Span::none(),
        );
        fb.emit_store_local(x, sum, Span::none());
        let out = fb.emit_load_local(x, Span::none());
        fb.set_term(IrTerm::Return(Some(out)));
        let ir = fb.finish();
        let f = build(&ir, &types).unwrap();
        f.verify(&types).unwrap();
        assert!(
            !f.values.iter().any(|v| v.op == Op::Phi),
            "straight-line code must not produce phis"
        );
        assert!(
            !f.values.iter().any(|v| v.op == Op::Load),
            "SSA-promoted local must not hit memory"
        );
    }

    #[test]
    fn test_phi_at_merge() {
        // if c { x = 1 } else { x = 2 }; return x
        let types = TypeRegistry::new();
        let mut fb = FuncBuilder::new("f", TypeIndex::I64, false);
        let x = fb.add_local("x", TypeIndex::I64, 8);
        let c = fb.emit_const_bool(true, Span::none());
        let then_b = fb.new_block();
        let else_b = fb.new_block();
        let merge = fb.new_block();
        fb.set_term(IrTerm::Branch {
            cond: c,
            then_blk: then_b,
            else_blk: else_b,
        });
        fb.switch_to(then_b);
        let one = fb.emit_const_int(1, TypeIndex::I64, Span::none());
        fb.emit_store_local(x, one, Span::none());
        fb.set_term(IrTerm::Jump(merge));
        fb.switch_to(else_b);
        let two = fb.emit_const_int(2, TypeIndex::I64, Span::none());
        fb.emit_store_local(x, two, Span::none());
        fb.set_term(IrTerm::Jump(merge));
        fb.switch_to(merge);
        let out = fb.emit_load_local(x, Span::none());
        fb.set_term(IrTerm::Return(Some(out)));
        let ir = fb.finish();
        let f = build(&ir, &types).unwrap();
        f.verify(&types).unwrap();
        let phis: Vec<_> = f.values.iter().filter(|v| v.op == Op::Phi).collect();
        assert_eq!(phis.len(), 1);
        assert_eq!(phis[0].args.len(), 2);
        // Phis sit at the front of their block.
        let pb = f.blk(phis[0].block);
        assert_eq!(pb.values[0], phis[0].id);
    }

    #[test]
    fn test_string_local_load_uses_slice_make() {
        let types = TypeRegistry::new();
        let mut fb = FuncBuilder::new("f", TypeIndex::I64, false);
        let s = fb.add_local("s", TypeIndex::STRING, 16);
        let lit = fb.emit(IrOp::ConstString(0), vec![], TypeIndex::STRING, Span::none());
        fb.emit_store_local(s, lit, Span::none());
        let loaded = fb.emit_load_local(s, Span::none());
        let len = fb.emit(IrOp::StringLen, vec![loaded], TypeIndex::I64, Span::none());
        fb.set_term(IrTerm::Return(Some(len)));
        let ir = fb.finish();
        let f = build(&ir, &types).unwrap();
        // Compound load decomposes to slice_make, not string_make.
        assert!(f.values.iter().any(|v| v.op == Op::SliceMake));
        assert!(!f.values.iter().any(|v| v.op == Op::StringMake));
    }

    #[test]
    fn test_loop_back_edge_phi() {
        // i = 0; while i < 3 { i = i + 1 }; return i
        let types = TypeRegistry::new();
        let mut fb = FuncBuilder::new("f", TypeIndex::I64, false);
        let i = fb.add_local("i", TypeIndex::I64, 8);
        let zero = fb.emit_const_int(0, TypeIndex::I64, Span::none());
        fb.emit_store_local(i, zero, Span::none());
        let header = fb.new_block();
        let body = fb.new_block();
        let exit = fb.new_block();
        fb.set_term(IrTerm::Jump(header));
        fb.switch_to(header);
        let iv = fb.emit_load_local(i, Span::none());
        let three = fb.emit_const_int(3, TypeIndex::I64, Span::none());
        let cond = fb.emit(
            IrOp::Binary(BinOp::Lt),
            vec![iv, three],
            TypeIndex::BOOL,
            Span::none(),
        );
        fb.set_term(IrTerm::Branch {
            cond,
            then_blk: body,
            else_blk: exit,
        });
        fb.switch_to(body);
        let iv2 = fb.emit_load_local(i, Span::none());
        let one = fb.emit_const_int(1, TypeIndex::I64, Span::none());
        let next = fb.emit(
            IrOp::Binary(BinOp::Add),
            vec![iv2, one],
            TypeIndex::I64,
            Span::none(),
        );
        fb.emit_store_local(i, next, Span::none());
        fb.set_term(IrTerm::Jump(header));
        fb.switch_to(exit);
        let out = fb.emit_load_local(i, Span::none());
        fb.set_term(IrTerm::Return(Some(out)));
        let ir = fb.finish();
        let f = build(&ir, &types).unwrap();
        f.verify(&types).unwrap();
        let phis: Vec<_> = f.values.iter().filter(|v| v.op == Op::Phi).collect();
        assert_eq!(phis.len(), 1, "loop variable needs exactly one phi");
        assert_eq!(phis[0].args.len(), 2);
    }
}
