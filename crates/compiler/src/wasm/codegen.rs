//! SSA -> Wasm bytecode.
//!
//! Wasm has no arbitrary jumps, so structure is reconstructed from the
//! CFG: a loop header (the target of a back edge) opens a `loop` wrapped
//! in a `block` whose end is the loop exit; two-way blocks open an
//! `if`/`else` whose join is the block's immediate postdominator; back
//! edges and breaks become `br` with the relative depth of the matching
//! frame. Conditions are narrowed with `i32.wrap_i64`.
//!
//! Every computed value is materialized into a Wasm local; operands are
//! re-emitted inline for constants and read back with `local.get`
//! otherwise. Phi moves run as parallel copies: all sources are pushed
//! before any destination is written, so swapped phis cannot clobber
//! each other.

use super::encode::{opcode, valtype, WasmWriter};
use crate::error::CompileError;
use crate::ssa::layout::loop_headers;
use crate::ssa::{Aux, BlockId, BlockKind, Func, Op, ValueId};
use crate::types::{TypeIndex, TypeRegistry};
use std::collections::{HashMap, HashSet};

use super::GLOBAL_SP;

/// Everything codegen needs from the linker's layout decisions.
pub struct CodegenCtx<'a> {
    pub types: &'a TypeRegistry,
    pub func_index: &'a HashMap<String, u32>,
    pub string_offsets: &'a [u32],
    pub metadata_offsets: &'a HashMap<String, u32>,
    pub global_offsets: &'a HashMap<String, u32>,
}

/// One open structured frame; its position gives `br` depths.
enum Frame {
    Block { target: BlockId },
    Loop { header: BlockId },
    If,
}

pub struct FnCodegen<'a> {
    f: &'a Func,
    ctx: &'a CodegenCtx<'a>,
    code: WasmWriter,
    /// Value types of locals beyond the parameters (fp is the first).
    locals: Vec<u8>,
    value_local: HashMap<ValueId, u32>,
    param_count: u32,
    fp_local: u32,
    frames: Vec<Frame>,
    headers: HashSet<BlockId>,
    ipdom: Vec<Option<BlockId>>,
}

fn cg_err(f: &Func, msg: impl Into<String>) -> CompileError {
    CompileError::Codegen(format!("{}: {}", f.name, msg.into()))
}

/// Emit one function body; returns (locals, body bytes without the
/// final END).
pub fn emit_func(
    f: &Func,
    ctx: &CodegenCtx,
) -> Result<(Vec<u8>, Vec<u8>), CompileError> {
    crate::debug::trace_heading(&f.name, "codegen");
    let param_count = f.params.len() as u32;
    let mut cg = FnCodegen {
        f,
        ctx,
        code: WasmWriter::new(),
        locals: vec![valtype::I64], // fp
        value_local: HashMap::new(),
        param_count,
        fp_local: param_count,
        frames: Vec::new(),
        headers: loop_headers(f),
        ipdom: ipostdoms(f),
    };
    cg.prologue();
    cg.emit_seq(f.entry, None)?;
    if crate::debug::enabled(crate::debug::Phase::Codegen) {
        eprintln!(
            "[codegen] fn {}: {} bytes, {} locals",
            f.name,
            cg.code.bytes.len(),
            cg.locals.len()
        );
    }
    Ok((cg.locals, cg.code.bytes))
}

impl<'a> FnCodegen<'a> {
    fn prologue(&mut self) {
        if self.f.frame_size == 0 {
            return;
        }
        self.code.byte(opcode::GLOBAL_GET);
        self.code.u32v(GLOBAL_SP);
        self.code.byte(opcode::I64_CONST);
        self.code.i64v(self.f.frame_size as i64);
        self.code.byte(opcode::I64_SUB);
        self.code.byte(opcode::GLOBAL_SET);
        self.code.u32v(GLOBAL_SP);
        self.code.byte(opcode::GLOBAL_GET);
        self.code.u32v(GLOBAL_SP);
        self.code.byte(opcode::LOCAL_SET);
        self.code.u32v(self.fp_local);
    }

    fn epilogue(&mut self) {
        if self.f.frame_size == 0 {
            return;
        }
        self.code.byte(opcode::LOCAL_GET);
        self.code.u32v(self.fp_local);
        self.code.byte(opcode::I64_CONST);
        self.code.i64v(self.f.frame_size as i64);
        self.code.byte(opcode::I64_ADD);
        self.code.byte(opcode::GLOBAL_SET);
        self.code.u32v(GLOBAL_SP);
    }

    fn ensure_local(&mut self, v: ValueId) -> u32 {
        if let Some(&l) = self.value_local.get(&v) {
            return l;
        }
        let vt = if self.ctx.types.is_float(self.f.val(v).ty) {
            valtype::F64
        } else {
            valtype::I64
        };
        let idx = self.param_count + self.locals.len() as u32;
        self.locals.push(vt);
        self.value_local.insert(v, idx);
        idx
    }

    fn set_local(&mut self, v: ValueId) {
        let l = self.ensure_local(v);
        self.code.byte(opcode::LOCAL_SET);
        self.code.u32v(l);
    }

    /// Push a value onto the operand stack. Constants re-emit inline;
    /// parameters come from their argument slot; anything else from its
    /// materialized local.
    fn operand(&mut self, v: ValueId) -> Result<(), CompileError> {
        let val = self.f.val(v);
        match val.op {
            Op::ConstI64 => {
                self.code.byte(opcode::I64_CONST);
                self.code.i64v(val.aux_int);
            }
            Op::ConstF64 => {
                self.code.byte(opcode::F64_CONST);
                let x = match val.aux {
                    Aux::F64(x) => x,
                    _ => 0.0,
                };
                self.code.f64(x);
            }
            Op::ConstStringPtr => {
                let off = *self
                    .ctx
                    .string_offsets
                    .get(val.aux_int as usize)
                    .ok_or_else(|| cg_err(self.f, "string literal index out of range"))?;
                self.code.byte(opcode::I64_CONST);
                self.code.i64v(off as i64);
            }
            Op::Arg => {
                self.code.byte(opcode::LOCAL_GET);
                self.code.u32v(val.aux_int as u32);
            }
            _ => {
                let l = *self.value_local.get(&v).ok_or_else(|| {
                    cg_err(self.f, format!("v{} used before it was materialized", v.0))
                })?;
                self.code.byte(opcode::LOCAL_GET);
                self.code.u32v(l);
            }
        }
        Ok(())
    }

    /// Push the address operand and narrow to the i32 address space.
    fn address_operand(&mut self, v: ValueId) -> Result<(), CompileError> {
        self.operand(v)?;
        self.code.byte(opcode::I32_WRAP_I64);
        Ok(())
    }

    fn br_depth_to(&self, target: BlockId) -> Option<u32> {
        for (i, frame) in self.frames.iter().enumerate().rev() {
            let hit = match frame {
                Frame::Loop { header } => *header == target,
                Frame::Block { target: t } => *t == target,
                Frame::If => false,
            };
            if hit {
                return Some((self.frames.len() - 1 - i) as u32);
            }
        }
        None
    }

    /// Parallel phi moves along the edge `pred -> succ`: push every
    /// source, then pop into the phi locals in reverse.
    fn phi_moves(&mut self, pred: BlockId, succ: BlockId) -> Result<(), CompileError> {
        let sb = self.f.blk(succ);
        let pred_idx = match sb.preds.iter().position(|e| e.block == pred) {
            Some(i) => i,
            None => return Ok(()),
        };
        let phis: Vec<ValueId> = sb
            .values
            .iter()
            .copied()
            .filter(|&v| self.f.val(v).op == Op::Phi)
            .collect();
        if phis.is_empty() {
            return Ok(());
        }
        for &phi in &phis {
            let arg = self.f.val(phi).args[pred_idx];
            let arg = self.f.follow_copy(arg);
            self.operand(arg)?;
        }
        for &phi in phis.iter().rev() {
            self.set_local(phi);
        }
        Ok(())
    }

    /// Emit blocks starting at `b` until control reaches `stop`.
    fn emit_seq(&mut self, b: BlockId, stop: Option<BlockId>) -> Result<(), CompileError> {
        let mut cur = Some(b);
        while let Some(b) = cur {
            if Some(b) == stop {
                return Ok(());
            }
            if self.headers.contains(&b) && !self.loop_open(b) {
                cur = Some(self.emit_loop(b)?);
                continue;
            }
            let kind = self.f.blk(b).kind;
            match kind {
                BlockKind::Plain => {
                    self.emit_block_values(b)?;
                    let succ = self.f.blk(b).succs[0].block;
                    self.phi_moves(b, succ)?;
                    if let Some(depth) = self.br_depth_to(succ) {
                        self.code.byte(opcode::BR);
                        self.code.u32v(depth);
                        return Ok(());
                    }
                    if Some(succ) == stop {
                        return Ok(());
                    }
                    cur = Some(succ);
                }
                BlockKind::If => {
                    self.emit_block_values(b)?;
                    let cont = self.ipdom[b.0 as usize];
                    let arm_stop = cont.or(stop);
                    let then_b = self.f.blk(b).succs[0].block;
                    let else_b = self.f.blk(b).succs[1].block;
                    let cond = self.f.blk(b).controls[0];
                    self.operand(cond)?;
                    self.code.byte(opcode::I32_WRAP_I64);
                    self.code.byte(opcode::IF);
                    self.code.byte(opcode::BLOCKTYPE_EMPTY);
                    self.frames.push(Frame::If);
                    self.phi_moves(b, then_b)?;
                    self.emit_arm(then_b, arm_stop)?;
                    self.code.byte(opcode::ELSE);
                    self.phi_moves(b, else_b)?;
                    self.emit_arm(else_b, arm_stop)?;
                    self.frames.pop();
                    self.code.byte(opcode::END);
                    match cont {
                        Some(m) => cur = Some(m),
                        None => {
                            if stop.is_none() {
                                self.code.byte(opcode::UNREACHABLE);
                            }
                            return Ok(());
                        }
                    }
                }
                BlockKind::Ret => {
                    self.emit_block_values(b)?;
                    self.epilogue();
                    if let Some(&c) = self.f.blk(b).controls.first() {
                        let c = self.f.follow_copy(c);
                        if self.f.val(c).op.is_make() {
                            let lo = self.f.val(c).args[0];
                            let hi = self.f.val(c).args[1];
                            self.operand(lo)?;
                            self.operand(hi)?;
                        } else {
                            self.operand(c)?;
                        }
                    }
                    self.code.byte(opcode::RETURN);
                    return Ok(());
                }
                BlockKind::Exit => {
                    self.emit_block_values(b)?;
                    self.code.byte(opcode::UNREACHABLE);
                    return Ok(());
                }
                BlockKind::First => {
                    return Err(cg_err(self.f, "first block reached wasm codegen"));
                }
                BlockKind::JumpTable => {
                    // The data model carries jump tables, but switches
                    // lower to equality cascades on this path.
                    return Err(cg_err(self.f, "jump_table blocks are not supported"));
                }
            }
        }
        Ok(())
    }

    /// One arm of an `if`: nothing to do when the arm is the join.
    fn emit_arm(&mut self, arm: BlockId, stop: Option<BlockId>) -> Result<(), CompileError> {
        if Some(arm) == stop {
            return Ok(());
        }
        self.emit_seq(arm, stop)
    }

    fn loop_open(&self, b: BlockId) -> bool {
        self.frames
            .iter()
            .any(|f| matches!(f, Frame::Loop { header } if *header == b))
    }

    /// A loop header opens `block { loop { ... } }`: the `block` ends at
    /// the loop exit (the header's postdominator) so breaks have a br
    /// target, the `loop` start is the back-edge br target, and the
    /// header itself is emitted by its own kind inside the frames.
    fn emit_loop(&mut self, header: BlockId) -> Result<BlockId, CompileError> {
        let exit = self.ipdom[header.0 as usize].ok_or_else(|| {
            cg_err(self.f, format!("loop at b{} has no structured exit", header.0))
        })?;

        self.frames.push(Frame::Block { target: exit });
        self.code.byte(opcode::BLOCK);
        self.code.byte(opcode::BLOCKTYPE_EMPTY);
        self.frames.push(Frame::Loop { header });
        self.code.byte(opcode::LOOP);
        self.code.byte(opcode::BLOCKTYPE_EMPTY);

        self.emit_seq(header, Some(exit))?;

        self.frames.pop();
        self.code.byte(opcode::END); // loop
        self.frames.pop();
        self.code.byte(opcode::END); // block
        Ok(exit)
    }

    fn emit_block_values(&mut self, b: BlockId) -> Result<(), CompileError> {
        let ids = self.f.blk(b).values.clone();
        for v in ids {
            self.emit_value(v)?;
        }
        Ok(())
    }

    fn emit_value(&mut self, v: ValueId) -> Result<(), CompileError> {
        let val = self.f.val(v);
        let op = val.op;
        match op {
            // No code: constants inline at use, phis live in locals set
            // by predecessors, makes are virtual pairs.
            Op::ConstI64 | Op::ConstF64 | Op::ConstStringPtr | Op::Arg | Op::Phi => Ok(()),
            Op::StringMake | Op::SliceMake | Op::SelectN => Ok(()),
            Op::Invalid | Op::ConstString | Op::FwdRef => {
                Err(cg_err(self.f, format!("v{}: {:?} survived the pass suite", v.0, op)))
            }
            Op::Copy => {
                let src = val.args[0];
                if self.ctx.types.is_pair(val.ty) {
                    // Pair copies are virtual; consumers follow them.
                    return Ok(());
                }
                self.operand(src)?;
                self.set_local(v);
                Ok(())
            }
            // Extraction over a rebuilt pair (post-expand calls).
            Op::StringPtr | Op::SlicePtr | Op::StringLen | Op::SliceLen => {
                let src = self.f.follow_copy(val.args[0]);
                if !self.f.val(src).op.is_make() {
                    return Err(cg_err(
                        self.f,
                        format!("v{}: extraction from a non-make pair", v.0),
                    ));
                }
                let comp = if matches!(op, Op::StringPtr | Op::SlicePtr) {
                    0
                } else {
                    1
                };
                let arg = self.f.val(src).args[comp];
                self.operand(arg)?;
                self.set_local(v);
                Ok(())
            }
            Op::LocalAddr => {
                self.code.byte(opcode::LOCAL_GET);
                self.code.u32v(self.fp_local);
                self.code.byte(opcode::I64_CONST);
                self.code.i64v(val.aux_int);
                self.code.byte(opcode::I64_ADD);
                self.set_local(v);
                Ok(())
            }
            Op::GlobalAddr => {
                let name = match &val.aux {
                    Aux::Sym(s) => s.clone(),
                    _ => return Err(cg_err(self.f, "global_addr without a symbol")),
                };
                let off = *self
                    .ctx
                    .global_offsets
                    .get(&name)
                    .ok_or_else(|| cg_err(self.f, format!("unknown global '{}'", name)))?;
                self.code.byte(opcode::I64_CONST);
                self.code.i64v(off as i64);
                self.set_local(v);
                Ok(())
            }
            Op::MetadataAddr => {
                let name = match &val.aux {
                    Aux::Sym(s) => s.clone(),
                    _ => return Err(cg_err(self.f, "metadata_addr without a symbol")),
                };
                let off = *self
                    .ctx
                    .metadata_offsets
                    .get(&name)
                    .ok_or_else(|| cg_err(self.f, format!("no metadata for type '{}'", name)))?;
                self.code.byte(opcode::I64_CONST);
                self.code.i64v(off as i64);
                self.set_local(v);
                Ok(())
            }
            Op::AddPtr => {
                self.operand(val.args[0])?;
                self.code.byte(opcode::I64_CONST);
                self.code.i64v(val.aux_int);
                self.code.byte(opcode::I64_ADD);
                self.set_local(v);
                Ok(())
            }
            Op::OffPtr => {
                self.operand(val.args[0])?;
                self.operand(val.args[1])?;
                self.code.byte(opcode::I64_CONST);
                self.code.i64v(val.aux_int);
                self.code.byte(opcode::I64_MUL);
                self.code.byte(opcode::I64_ADD);
                self.set_local(v);
                Ok(())
            }
            Op::Move => {
                self.address_operand(val.args[0])?;
                self.address_operand(val.args[1])?;
                self.code.byte(opcode::I32_CONST);
                self.code.i32v(val.aux_int as i32);
                self.code.byte(opcode::MISC_PREFIX);
                self.code.u32v(opcode::MEMORY_COPY);
                self.code.byte(0x00);
                self.code.byte(0x00);
                Ok(())
            }
            Op::StaticCall => self.emit_call(v),
            _ if op.is_load() => {
                self.address_operand(val.args[0])?;
                let (opc, is_f64) = load_opcode(op);
                self.code.byte(opc);
                self.code.memarg(0, 0);
                let _ = is_f64;
                self.set_local(v);
                Ok(())
            }
            _ if op.is_store() => {
                self.address_operand(val.args[0])?;
                self.operand(val.args[1])?;
                self.code.byte(store_opcode(op));
                self.code.memarg(0, 0);
                Ok(())
            }
            _ => {
                // Arithmetic / comparison / conversion ops.
                for &a in &val.args {
                    self.operand(a)?;
                }
                let opc = simple_opcode(op)
                    .ok_or_else(|| cg_err(self.f, format!("v{}: unhandled op {:?}", v.0, op)))?;
                self.code.byte(opc);
                if op.pushes_i32() {
                    self.code.byte(opcode::I64_EXTEND_I32_U);
                }
                self.set_local(v);
                Ok(())
            }
        }
    }

    fn emit_call(&mut self, v: ValueId) -> Result<(), CompileError> {
        let val = self.f.val(v);
        let name = match &val.aux {
            Aux::Sym(s) => s.clone(),
            _ => return Err(cg_err(self.f, "call without a callee symbol")),
        };
        let idx = *self
            .ctx
            .func_index
            .get(&name)
            .ok_or_else(|| cg_err(self.f, format!("call to unknown function '{}'", name)))?;
        let args = val.args.clone();
        for a in args {
            self.operand(a)?;
        }
        self.code.byte(opcode::CALL);
        self.code.u32v(idx);

        if val.ty == TypeIndex::TUPLE {
            // Two raw result slots; pop into the select locals, second
            // result first.
            let sels = self.select_users(v);
            match sels.1 {
                Some(s1) => self.set_local(s1),
                None => self.code.byte(opcode::DROP),
            }
            match sels.0 {
                Some(s0) => self.set_local(s0),
                None => self.code.byte(opcode::DROP),
            }
        } else if val.ty != TypeIndex::VOID {
            self.set_local(v);
        }
        Ok(())
    }

    fn select_users(&self, call: ValueId) -> (Option<ValueId>, Option<ValueId>) {
        let mut s0 = None;
        let mut s1 = None;
        for w in &self.f.values {
            if w.op == Op::SelectN && w.args.first() == Some(&call) {
                if w.aux_int == 0 {
                    s0 = Some(w.id);
                } else {
                    s1 = Some(w.id);
                }
            }
        }
        (s0, s1)
    }
}

fn load_opcode(op: Op) -> (u8, bool) {
    match op {
        Op::WasmI64Load8S => (opcode::I64_LOAD8_S, false),
        Op::WasmI64Load8U => (opcode::I64_LOAD8_U, false),
        Op::WasmI64Load16S => (opcode::I64_LOAD16_S, false),
        Op::WasmI64Load16U => (opcode::I64_LOAD16_U, false),
        Op::WasmI64Load32S => (opcode::I64_LOAD32_S, false),
        Op::WasmI64Load32U => (opcode::I64_LOAD32_U, false),
        Op::WasmF64Load => (opcode::F64_LOAD, true),
        _ => (opcode::I64_LOAD, false),
    }
}

fn store_opcode(op: Op) -> u8 {
    match op {
        Op::WasmI64Store8 => opcode::I64_STORE8,
        Op::WasmI64Store16 => opcode::I64_STORE16,
        Op::WasmI64Store32 => opcode::I64_STORE32,
        Op::WasmF64Store => opcode::F64_STORE,
        _ => opcode::I64_STORE,
    }
}

fn simple_opcode(op: Op) -> Option<u8> {
    Some(match op {
        Op::WasmI64Add => opcode::I64_ADD,
        Op::WasmI64Sub => opcode::I64_SUB,
        Op::WasmI64Mul => opcode::I64_MUL,
        Op::WasmI64DivS => opcode::I64_DIV_S,
        Op::WasmI64DivU => opcode::I64_DIV_U,
        Op::WasmI64RemS => opcode::I64_REM_S,
        Op::WasmI64RemU => opcode::I64_REM_U,
        Op::WasmI64And => opcode::I64_AND,
        Op::WasmI64Or => opcode::I64_OR,
        Op::WasmI64Xor => opcode::I64_XOR,
        Op::WasmI64Shl => opcode::I64_SHL,
        Op::WasmI64ShrS => opcode::I64_SHR_S,
        Op::WasmI64ShrU => opcode::I64_SHR_U,
        Op::WasmI64Eq => opcode::I64_EQ,
        Op::WasmI64Ne => opcode::I64_NE,
        Op::WasmI64LtS => opcode::I64_LT_S,
        Op::WasmI64LtU => opcode::I64_LT_U,
        Op::WasmI64LeS => opcode::I64_LE_S,
        Op::WasmI64LeU => opcode::I64_LE_U,
        Op::WasmI64GtS => opcode::I64_GT_S,
        Op::WasmI64GtU => opcode::I64_GT_U,
        Op::WasmI64GeS => opcode::I64_GE_S,
        Op::WasmI64GeU => opcode::I64_GE_U,
        Op::WasmI64Eqz => opcode::I64_EQZ,
        Op::WasmI64Extend8S => opcode::I64_EXTEND8_S,
        Op::WasmI64Extend16S => opcode::I64_EXTEND16_S,
        Op::WasmI64Extend32S => opcode::I64_EXTEND32_S,
        Op::WasmF64Add => opcode::F64_ADD,
        Op::WasmF64Sub => opcode::F64_SUB,
        Op::WasmF64Mul => opcode::F64_MUL,
        Op::WasmF64Div => opcode::F64_DIV,
        Op::WasmF64Neg => opcode::F64_NEG,
        Op::WasmF64Eq => opcode::F64_EQ,
        Op::WasmF64Ne => opcode::F64_NE,
        Op::WasmF64Lt => opcode::F64_LT,
        Op::WasmF64Le => opcode::F64_LE,
        Op::WasmF64Gt => opcode::F64_GT,
        Op::WasmF64Ge => opcode::F64_GE,
        Op::WasmF64ConvertI64S => opcode::F64_CONVERT_I64_S,
        Op::WasmI64TruncF64S => opcode::I64_TRUNC_F64_S,
        _ => return None,
    })
}

/// Immediate postdominators via the reverse CFG with a virtual exit
/// joining every Ret/Exit block. `None` means control only reconverges
/// at function exit.
pub fn ipostdoms(f: &Func) -> Vec<Option<BlockId>> {
    let n = f.blocks.len();
    let virt = n;
    let exits: Vec<usize> = f
        .blocks
        .iter()
        .filter(|b| !b.dead && matches!(b.kind, BlockKind::Ret | BlockKind::Exit))
        .map(|b| b.id.0 as usize)
        .collect();

    // DFS over the reverse CFG from the virtual exit.
    let mut visited = vec![false; n + 1];
    let mut post: Vec<usize> = Vec::new();
    let mut stack: Vec<(usize, usize)> = vec![(virt, 0)];
    visited[virt] = true;
    while let Some(&(node, i)) = stack.last() {
        let next = if node == virt {
            exits.get(i).copied()
        } else {
            f.blocks[node].preds.get(i).map(|e| e.block.0 as usize)
        };
        match next {
            Some(nx) => {
                stack.last_mut().expect("stack is non-empty").1 += 1;
                if !visited[nx] {
                    visited[nx] = true;
                    stack.push((nx, 0));
                }
            }
            None => {
                post.push(node);
                stack.pop();
            }
        }
    }
    let rpo: Vec<usize> = post.iter().rev().copied().collect();
    let mut order = vec![usize::MAX; n + 1];
    for (i, &b) in rpo.iter().enumerate() {
        order[b] = i;
    }

    let mut idom: Vec<Option<usize>> = vec![None; n + 1];
    idom[virt] = Some(virt);
    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo.iter() {
            if b == virt {
                continue;
            }
            // Predecessors in the reverse graph are CFG successors, plus
            // the virtual exit for terminating blocks.
            let mut new_idom: Option<usize> = None;
            let mut consider = |p: usize, idom: &[Option<usize>], order: &[usize]| {
                if order[p] == usize::MAX || idom[p].is_none() {
                    return;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(cur) => intersect(p, cur, idom, order),
                });
            };
            for e in &f.blocks[b].succs {
                consider(e.block.0 as usize, &idom, &order);
            }
            if matches!(f.blocks[b].kind, BlockKind::Ret | BlockKind::Exit) {
                consider(virt, &idom, &order);
            }
            if let Some(ni) = new_idom {
                if idom[b] != Some(ni) {
                    idom[b] = Some(ni);
                    changed = true;
                }
            }
        }
    }

    (0..n)
        .map(|b| match idom[b] {
            Some(d) if d != virt && d != b => Some(BlockId(d as u32)),
            _ => None,
        })
        .collect()
}

fn intersect(mut a: usize, mut b: usize, idom: &[Option<usize>], order: &[usize]) -> usize {
    while a != b {
        while order[a] > order[b] {
            a = idom[a].expect("intersect walks defined idoms");
        }
        while order[b] > order[a] {
            b = idom[b].expect("intersect walks defined idoms");
        }
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::BlockKind;

    #[test]
    fn test_ipostdom_diamond() {
        let mut f = Func::new("t", TypeIndex::I64, false);
        let c = f.entry;
        f.blk_mut(c).kind = BlockKind::If;
        let t = f.add_block(BlockKind::Plain);
        let e = f.add_block(BlockKind::Plain);
        let m = f.add_block(BlockKind::Ret);
        f.add_edge(c, t);
        f.add_edge(c, e);
        f.add_edge(t, m);
        f.add_edge(e, m);
        let pd = ipostdoms(&f);
        assert_eq!(pd[c.0 as usize], Some(m));
        assert_eq!(pd[t.0 as usize], Some(m));
        assert_eq!(pd[m.0 as usize], None);
    }

    #[test]
    fn test_ipostdom_while_loop() {
        // entry -> header; header -> body | exit; body -> header
        let mut f = Func::new("t", TypeIndex::I64, false);
        let header = f.add_block(BlockKind::If);
        let body = f.add_block(BlockKind::Plain);
        let exit = f.add_block(BlockKind::Ret);
        f.add_edge(f.entry, header);
        f.add_edge(header, body);
        f.add_edge(header, exit);
        f.add_edge(body, header);
        let pd = ipostdoms(&f);
        assert_eq!(pd[header.0 as usize], Some(exit));
        assert_eq!(pd[f.entry.0 as usize], Some(header));
    }

    #[test]
    fn test_ipostdom_arm_returns() {
        // cond -> (ret | cont); no common postdominator short of exit.
        let mut f = Func::new("t", TypeIndex::I64, false);
        let c = f.entry;
        f.blk_mut(c).kind = BlockKind::If;
        let r = f.add_block(BlockKind::Ret);
        let cont = f.add_block(BlockKind::Ret);
        f.add_edge(c, r);
        f.add_edge(c, cont);
        let pd = ipostdoms(&f);
        assert_eq!(pd[c.0 as usize], None);
    }
}
