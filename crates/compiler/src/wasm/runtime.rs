//! ARC and collection runtime, emitted as raw bytecode into every
//! module.
//!
//! Heap objects carry a 12-byte header `[u32 metadata_ptr, i64 refcount]`
//! in front of the user data; `cot_alloc` returns base + 12 and
//! `cot_retain`/`cot_release` null-check and immortal-check before
//! touching the count. `cot_release` dispatches the destructor through
//! `call_indirect` when the count reaches zero. Strings produced by
//! `cot_string_concat` are raw bump-allocated bytes with no header and
//! are never released.
//!
//! Lists are `[i64 len, i64 cap, elems...]`; maps are linear-probed
//! (key, value) pair lists with the same header. Growth reallocates and
//! returns the new handle, which callers write back.

use super::encode::{opcode, WasmWriter};
use super::GLOBAL_HP;
use crate::lower::arc::{HEAP_HEADER_SIZE, IMMORTAL_REFCOUNT, REFCOUNT_OFFSET};

/// Tiny assembler over the raw instruction encoding.
pub struct Asm {
    pub w: WasmWriter,
}

impl Asm {
    pub fn new() -> Asm {
        Asm {
            w: WasmWriter::new(),
        }
    }

    pub fn op(&mut self, opc: u8) -> &mut Self {
        self.w.byte(opc);
        self
    }

    pub fn local_get(&mut self, i: u32) -> &mut Self {
        self.w.byte(opcode::LOCAL_GET);
        self.w.u32v(i);
        self
    }

    pub fn local_set(&mut self, i: u32) -> &mut Self {
        self.w.byte(opcode::LOCAL_SET);
        self.w.u32v(i);
        self
    }

    pub fn global_get(&mut self, i: u32) -> &mut Self {
        self.w.byte(opcode::GLOBAL_GET);
        self.w.u32v(i);
        self
    }

    pub fn global_set(&mut self, i: u32) -> &mut Self {
        self.w.byte(opcode::GLOBAL_SET);
        self.w.u32v(i);
        self
    }

    pub fn i64_const(&mut self, v: i64) -> &mut Self {
        self.w.byte(opcode::I64_CONST);
        self.w.i64v(v);
        self
    }

    pub fn i32_const(&mut self, v: i32) -> &mut Self {
        self.w.byte(opcode::I32_CONST);
        self.w.i32v(v);
        self
    }

    pub fn wrap(&mut self) -> &mut Self {
        self.w.byte(opcode::I32_WRAP_I64);
        self
    }

    /// i64 load; the address must already be wrapped to i32.
    pub fn load64(&mut self, offset: u32) -> &mut Self {
        self.w.byte(opcode::I64_LOAD);
        self.w.memarg(0, offset);
        self
    }

    pub fn load32u(&mut self, offset: u32) -> &mut Self {
        self.w.byte(opcode::I64_LOAD32_U);
        self.w.memarg(0, offset);
        self
    }

    pub fn load8u(&mut self, offset: u32) -> &mut Self {
        self.w.byte(opcode::I64_LOAD8_U);
        self.w.memarg(0, offset);
        self
    }

    pub fn store64(&mut self, offset: u32) -> &mut Self {
        self.w.byte(opcode::I64_STORE);
        self.w.memarg(0, offset);
        self
    }

    pub fn store32(&mut self, offset: u32) -> &mut Self {
        self.w.byte(opcode::I64_STORE32);
        self.w.memarg(0, offset);
        self
    }

    pub fn store8(&mut self, offset: u32) -> &mut Self {
        self.w.byte(opcode::I64_STORE8);
        self.w.memarg(0, offset);
        self
    }

    pub fn if_empty(&mut self) -> &mut Self {
        self.w.byte(opcode::IF);
        self.w.byte(opcode::BLOCKTYPE_EMPTY);
        self
    }

    pub fn block_empty(&mut self) -> &mut Self {
        self.w.byte(opcode::BLOCK);
        self.w.byte(opcode::BLOCKTYPE_EMPTY);
        self
    }

    pub fn loop_empty(&mut self) -> &mut Self {
        self.w.byte(opcode::LOOP);
        self.w.byte(opcode::BLOCKTYPE_EMPTY);
        self
    }

    pub fn end(&mut self) -> &mut Self {
        self.w.byte(opcode::END);
        self
    }

    pub fn br(&mut self, depth: u32) -> &mut Self {
        self.w.byte(opcode::BR);
        self.w.u32v(depth);
        self
    }

    pub fn br_if(&mut self, depth: u32) -> &mut Self {
        self.w.byte(opcode::BR_IF);
        self.w.u32v(depth);
        self
    }

    pub fn call(&mut self, func: u32) -> &mut Self {
        self.w.byte(opcode::CALL);
        self.w.u32v(func);
        self
    }

    pub fn call_indirect(&mut self, type_idx: u32) -> &mut Self {
        self.w.byte(opcode::CALL_INDIRECT);
        self.w.u32v(type_idx);
        self.w.byte(0x00);
        self
    }

    pub fn ret(&mut self) -> &mut Self {
        self.w.byte(opcode::RETURN);
        self
    }

    pub fn memory_copy(&mut self) -> &mut Self {
        self.w.byte(opcode::MISC_PREFIX);
        self.w.u32v(opcode::MEMORY_COPY);
        self.w.byte(0x00);
        self.w.byte(0x00);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.w.bytes
    }
}

impl Default for Asm {
    fn default() -> Self {
        Asm::new()
    }
}

const REFCOUNT_BACK: i64 = (HEAP_HEADER_SIZE - REFCOUNT_OFFSET) as i64; // 8

/// cot_alloc(metadata_ptr, size) -> i64: bump allocation from HP with
/// the header written in front; returns base + 12.
/// Locals: 2 = base.
pub fn cot_alloc_body() -> Vec<u8> {
    let mut a = Asm::new();
    a.global_get(GLOBAL_HP).local_set(2);
    // header: metadata u32 at base+0
    a.local_get(2).wrap().local_get(0).store32(0);
    // refcount = 1 at base+4
    a.local_get(2)
        .wrap()
        .i64_const(1)
        .store64(REFCOUNT_OFFSET);
    // HP = (base + 12 + size + 7) & ~7
    a.local_get(2)
        .i64_const(HEAP_HEADER_SIZE as i64)
        .op(opcode::I64_ADD)
        .local_get(1)
        .op(opcode::I64_ADD)
        .i64_const(7)
        .op(opcode::I64_ADD)
        .i64_const(-8)
        .op(opcode::I64_AND)
        .global_set(GLOBAL_HP);
    // return base + 12
    a.local_get(2)
        .i64_const(HEAP_HEADER_SIZE as i64)
        .op(opcode::I64_ADD);
    a.finish()
}

/// cot_retain(obj) -> i64. Locals: 1 = refcount.
pub fn cot_retain_body() -> Vec<u8> {
    let mut a = Asm::new();
    // null check
    a.local_get(0).op(opcode::I64_EQZ).if_empty();
    a.i64_const(0).ret();
    a.end();
    // rc = *(obj - 8)
    a.local_get(0)
        .i64_const(REFCOUNT_BACK)
        .op(opcode::I64_SUB)
        .wrap()
        .load64(0)
        .local_set(1);
    // immortal check
    a.local_get(1)
        .i64_const(IMMORTAL_REFCOUNT)
        .op(opcode::I64_EQ)
        .if_empty();
    a.local_get(0).ret();
    a.end();
    // *(obj - 8) = rc + 1
    a.local_get(0)
        .i64_const(REFCOUNT_BACK)
        .op(opcode::I64_SUB)
        .wrap()
        .local_get(1)
        .i64_const(1)
        .op(opcode::I64_ADD)
        .store64(0);
    a.local_get(0);
    a.finish()
}

/// cot_release(obj). Decrement; at zero, load the destructor table
/// index from the metadata record and `call_indirect` the destructor
/// with the object. Locals: 1 = refcount, 2 = metadata ptr, 3 = dtor.
pub fn cot_release_body(dtor_type_idx: u32) -> Vec<u8> {
    let mut a = Asm::new();
    a.local_get(0).op(opcode::I64_EQZ).if_empty();
    a.ret();
    a.end();
    a.local_get(0)
        .i64_const(REFCOUNT_BACK)
        .op(opcode::I64_SUB)
        .wrap()
        .load64(0)
        .local_set(1);
    a.local_get(1)
        .i64_const(IMMORTAL_REFCOUNT)
        .op(opcode::I64_EQ)
        .if_empty();
    a.ret();
    a.end();
    // rc -= 1
    a.local_get(1).i64_const(1).op(opcode::I64_SUB).local_set(1);
    a.local_get(0)
        .i64_const(REFCOUNT_BACK)
        .op(opcode::I64_SUB)
        .wrap()
        .local_get(1)
        .store64(0);
    // still referenced?
    a.local_get(1).op(opcode::I64_EQZ).op(opcode::I32_EQZ).if_empty();
    a.ret();
    a.end();
    // metadata = u32 at obj - 12
    a.local_get(0)
        .i64_const(HEAP_HEADER_SIZE as i64)
        .op(opcode::I64_SUB)
        .wrap()
        .load32u(0)
        .local_set(2);
    // dtor table index = u32 at metadata + 8
    a.local_get(2).wrap().load32u(8).local_set(3);
    a.local_get(3).op(opcode::I64_EQZ).if_empty();
    a.ret();
    a.end();
    a.local_get(0);
    a.local_get(3).wrap();
    a.call_indirect(dtor_type_idx);
    a.finish()
}

/// cot_string_concat(p1, l1, p2, l2) -> i64: bump-allocate l1+l2 raw
/// bytes and copy both halves. Locals: 4 = base.
pub fn cot_string_concat_body() -> Vec<u8> {
    let mut a = Asm::new();
    a.global_get(GLOBAL_HP).local_set(4);
    // copy first half
    a.local_get(4).wrap();
    a.local_get(0).wrap();
    a.local_get(1).wrap();
    a.memory_copy();
    // copy second half at base + l1
    a.local_get(4).local_get(1).op(opcode::I64_ADD).wrap();
    a.local_get(2).wrap();
    a.local_get(3).wrap();
    a.memory_copy();
    // HP = align8(base + l1 + l2)
    a.local_get(4)
        .local_get(1)
        .op(opcode::I64_ADD)
        .local_get(3)
        .op(opcode::I64_ADD)
        .i64_const(7)
        .op(opcode::I64_ADD)
        .i64_const(-8)
        .op(opcode::I64_AND)
        .global_set(GLOBAL_HP);
    a.local_get(4);
    a.finish()
}

/// cot_string_eq(p1, l1, p2, l2) -> i64 (0 or 1). Locals: 4 = i.
pub fn cot_string_eq_body() -> Vec<u8> {
    let mut a = Asm::new();
    a.local_get(1).local_get(3).op(opcode::I64_NE).if_empty();
    a.i64_const(0).ret();
    a.end();
    a.i64_const(0).local_set(4);
    a.loop_empty();
    {
        // i == l1 -> equal
        a.local_get(4).local_get(1).op(opcode::I64_GE_S).if_empty();
        a.i64_const(1).ret();
        a.end();
        // byte compare
        a.local_get(0).local_get(4).op(opcode::I64_ADD).wrap().load8u(0);
        a.local_get(2).local_get(4).op(opcode::I64_ADD).wrap().load8u(0);
        a.op(opcode::I64_NE).if_empty();
        a.i64_const(0).ret();
        a.end();
        a.local_get(4).i64_const(1).op(opcode::I64_ADD).local_set(4);
        a.br(0);
    }
    a.end();
    a.op(opcode::UNREACHABLE);
    a.finish()
}

/// cot_list_new(cap) -> i64. Layout: [i64 len, i64 cap, elems].
/// Locals: 1 = obj. `alloc_idx` is cot_alloc's function index.
pub fn cot_list_new_body(alloc_idx: u32) -> Vec<u8> {
    let mut a = Asm::new();
    // obj = cot_alloc(0, 16 + cap * 8)
    a.i64_const(0);
    a.local_get(0)
        .i64_const(8)
        .op(opcode::I64_MUL)
        .i64_const(16)
        .op(opcode::I64_ADD);
    a.call(alloc_idx).local_set(1);
    a.local_get(1).wrap().i64_const(0).store64(0);
    a.local_get(1).wrap().local_get(0).store64(8);
    a.local_get(1);
    a.finish()
}

/// cot_list_len(list) -> i64.
pub fn cot_list_len_body() -> Vec<u8> {
    let mut a = Asm::new();
    a.local_get(0).wrap().load64(0);
    a.finish()
}

/// cot_list_get(list, idx) -> i64, bounds-checked (traps on overrun).
pub fn cot_list_get_body() -> Vec<u8> {
    let mut a = Asm::new();
    a.local_get(1)
        .local_get(0)
        .wrap()
        .load64(0)
        .op(opcode::I64_GE_U)
        .if_empty();
    a.op(opcode::UNREACHABLE);
    a.end();
    a.local_get(0)
        .local_get(1)
        .i64_const(8)
        .op(opcode::I64_MUL)
        .op(opcode::I64_ADD)
        .wrap()
        .load64(16);
    a.finish()
}

/// cot_list_set(list, idx, val), bounds-checked.
pub fn cot_list_set_body() -> Vec<u8> {
    let mut a = Asm::new();
    a.local_get(1)
        .local_get(0)
        .wrap()
        .load64(0)
        .op(opcode::I64_GE_U)
        .if_empty();
    a.op(opcode::UNREACHABLE);
    a.end();
    a.local_get(0)
        .local_get(1)
        .i64_const(8)
        .op(opcode::I64_MUL)
        .op(opcode::I64_ADD)
        .wrap()
        .local_get(2)
        .store64(16);
    a.finish()
}

/// cot_list_push(list, val) -> i64 (possibly reallocated handle).
/// Locals: 2 = len, 3 = cap, 4 = new list.
pub fn cot_list_push_body(list_new_idx: u32) -> Vec<u8> {
    let mut a = Asm::new();
    a.local_get(0).wrap().load64(0).local_set(2);
    a.local_get(0).wrap().load64(8).local_set(3);
    // grow when full
    a.local_get(2).local_get(3).op(opcode::I64_GE_S).if_empty();
    {
        // new = cot_list_new((cap << 1) | 1): always past cap, never zero
        a.local_get(3).i64_const(1).op(opcode::I64_SHL);
        a.i64_const(1).op(opcode::I64_OR);
        a.call(list_new_idx).local_set(4);
        // copy elems and length
        a.local_get(4).i64_const(16).op(opcode::I64_ADD).wrap();
        a.local_get(0).i64_const(16).op(opcode::I64_ADD).wrap();
        a.local_get(2).i64_const(8).op(opcode::I64_MUL).wrap();
        a.memory_copy();
        a.local_get(4).wrap().local_get(2).store64(0);
        a.local_get(4).local_set(0);
    }
    a.end();
    // elems[len] = val; len += 1
    a.local_get(0)
        .local_get(2)
        .i64_const(8)
        .op(opcode::I64_MUL)
        .op(opcode::I64_ADD)
        .wrap()
        .local_get(1)
        .store64(16);
    a.local_get(0)
        .wrap()
        .local_get(2)
        .i64_const(1)
        .op(opcode::I64_ADD)
        .store64(0);
    a.local_get(0);
    a.finish()
}

/// cot_map_new() -> i64. Maps are (key, value) pair lists:
/// [i64 len, i64 cap, pairs...], 16 bytes per pair.
pub fn cot_map_new_body(alloc_idx: u32) -> Vec<u8> {
    let mut a = Asm::new();
    a.i64_const(0);
    a.i64_const(16 + 8 * 16);
    a.call(alloc_idx).local_set(0);
    a.local_get(0).wrap().i64_const(0).store64(0);
    a.local_get(0).wrap().i64_const(8).store64(8);
    a.local_get(0);
    a.finish()
}

/// cot_map_len(map) -> i64.
pub fn cot_map_len_body() -> Vec<u8> {
    let mut a = Asm::new();
    a.local_get(0).wrap().load64(0);
    a.finish()
}

/// cot_map_get(map, key) -> i64; 0 when absent. Locals: 2 = i, 3 = len.
pub fn cot_map_get_body() -> Vec<u8> {
    let mut a = Asm::new();
    a.local_get(0).wrap().load64(0).local_set(3);
    a.i64_const(0).local_set(2);
    a.loop_empty();
    {
        a.local_get(2).local_get(3).op(opcode::I64_GE_S).if_empty();
        a.i64_const(0).ret();
        a.end();
        // map + 16 + i*16
        a.local_get(0)
            .local_get(2)
            .i64_const(16)
            .op(opcode::I64_MUL)
            .op(opcode::I64_ADD)
            .wrap()
            .load64(16);
        a.local_get(1).op(opcode::I64_EQ).if_empty();
        a.local_get(0)
            .local_get(2)
            .i64_const(16)
            .op(opcode::I64_MUL)
            .op(opcode::I64_ADD)
            .wrap()
            .load64(24);
        a.ret();
        a.end();
        a.local_get(2).i64_const(1).op(opcode::I64_ADD).local_set(2);
        a.br(0);
    }
    a.end();
    a.op(opcode::UNREACHABLE);
    a.finish()
}

/// cot_map_set(map, key, val) -> i64 (possibly reallocated handle).
/// Locals: 3 = i, 4 = len, 5 = cap, 6 = new map.
pub fn cot_map_set_body(alloc_idx: u32) -> Vec<u8> {
    let mut a = Asm::new();
    a.local_get(0).wrap().load64(0).local_set(4);
    // overwrite an existing key
    a.i64_const(0).local_set(3);
    a.block_empty();
    a.loop_empty();
    {
        a.local_get(3).local_get(4).op(opcode::I64_GE_S).br_if(1);
        a.local_get(0)
            .local_get(3)
            .i64_const(16)
            .op(opcode::I64_MUL)
            .op(opcode::I64_ADD)
            .wrap()
            .load64(16);
        a.local_get(1).op(opcode::I64_EQ).if_empty();
        a.local_get(0)
            .local_get(3)
            .i64_const(16)
            .op(opcode::I64_MUL)
            .op(opcode::I64_ADD)
            .wrap()
            .local_get(2)
            .store64(24);
        a.local_get(0).ret();
        a.end();
        a.local_get(3).i64_const(1).op(opcode::I64_ADD).local_set(3);
        a.br(0);
    }
    a.end();
    a.end();
    // append, growing when full
    a.local_get(0).wrap().load64(8).local_set(5);
    a.local_get(4).local_get(5).op(opcode::I64_GE_S).if_empty();
    {
        // new = cot_alloc(0, 16 + cap*2*16)
        a.i64_const(0);
        a.local_get(5)
            .i64_const(32)
            .op(opcode::I64_MUL)
            .i64_const(16)
            .op(opcode::I64_ADD);
        a.call(alloc_idx).local_set(6);
        a.local_get(6).i64_const(16).op(opcode::I64_ADD).wrap();
        a.local_get(0).i64_const(16).op(opcode::I64_ADD).wrap();
        a.local_get(4).i64_const(16).op(opcode::I64_MUL).wrap();
        a.memory_copy();
        a.local_get(6).wrap().local_get(4).store64(0);
        a.local_get(6)
            .wrap()
            .local_get(5)
            .i64_const(2)
            .op(opcode::I64_MUL)
            .store64(8);
        a.local_get(6).local_set(0);
    }
    a.end();
    a.local_get(0)
        .local_get(4)
        .i64_const(16)
        .op(opcode::I64_MUL)
        .op(opcode::I64_ADD)
        .wrap()
        .local_get(1)
        .store64(16);
    a.local_get(0)
        .local_get(4)
        .i64_const(16)
        .op(opcode::I64_MUL)
        .op(opcode::I64_ADD)
        .wrap()
        .local_get(2)
        .store64(24);
    a.local_get(0)
        .wrap()
        .local_get(4)
        .i64_const(1)
        .op(opcode::I64_ADD)
        .store64(0);
    a.local_get(0);
    a.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bodies_are_nonempty_and_balanced() {
        // Every structured open must be closed; count block/loop/if
        // against ends in a few bodies as a smoke check.
        for body in [
            cot_retain_body(),
            cot_release_body(0),
            cot_string_eq_body(),
            cot_list_push_body(0),
            cot_map_set_body(0),
        ] {
            assert!(!body.is_empty());
            let opens = body
                .iter()
                .filter(|&&b| b == opcode::IF || b == opcode::BLOCK || b == opcode::LOOP)
                .count();
            let ends = body.iter().filter(|&&b| b == opcode::END).count();
            // Opcode bytes can collide with immediates, so this is a
            // loose sanity check rather than an exact balance.
            assert!(ends >= 1, "body has no end markers");
            assert!(opens >= 1);
        }
    }

    #[test]
    fn test_alloc_returns_past_header() {
        let body = cot_alloc_body();
        // The body must add the 12-byte header offset at least twice
        // (HP bump and the returned pointer).
        let twelves = body
            .windows(2)
            .filter(|w| w[0] == opcode::I64_CONST && w[1] == 12)
            .count();
        assert!(twelves >= 2, "expected base+12 arithmetic in cot_alloc");
    }
}
