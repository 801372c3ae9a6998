//! Wasm module assembly.
//!
//! The linker owns the per-module state: the deduplicated type table,
//! the function index space (imports first, then user functions, then
//! the ARC/collection runtime, then the test runtime), the globals
//! (stack pointer first, heap pointer second, then the test and
//! assert-fail globals), one linear memory with the string/metadata/
//! module-variable data segment, and the funcref table whose index 0 is
//! reserved null and whose later entries are `_deinit` destructors.
//!
//! Plain wasm32 builds import nothing; test and native builds import
//! `cot_write` and `cot_time` from the host.

pub mod codegen;
pub mod encode;
pub mod runtime;
pub mod testrt;

use crate::debug::{self, Phase};
use crate::error::CompileError;
use crate::ir::{IrFunc, IrModule};
use crate::lower::arc::METADATA_RECORD_SIZE;
use crate::ssa::Func;
use crate::types::{align_up, TypeIndex, TypeKind, TypeRegistry};
use crate::CompileOptions;
use codegen::CodegenCtx;
use encode::{opcode, section, valtype, WasmWriter, MAGIC};
use std::collections::HashMap;
use testrt::{TestRtFuncs, TestRtStrings};

// Global indices. SP is global 0 by contract; every dynamically added
// global sits above these fixed slots.
pub const GLOBAL_SP: u32 = 0;
pub const GLOBAL_HP: u32 = 1;
pub const GLOBAL_TEST_START: u32 = 2;
pub const GLOBAL_SUITE_START: u32 = 3;
pub const GLOBAL_TESTS_PASSED: u32 = 4;
pub const GLOBAL_TESTS_FAILED: u32 = 5;
pub const GLOBAL_ASSERT_FAILED: u32 = 6;
pub const GLOBAL_FAIL_LEFT: u32 = 7;
pub const GLOBAL_FAIL_RIGHT: u32 = 8;
pub const GLOBAL_FAIL_IS_STR: u32 = 9;
pub const GLOBAL_FAIL_LEFT_LEN: u32 = 10;
pub const GLOBAL_FAIL_RIGHT_LEN: u32 = 11;
pub const GLOBAL_COUNT: u32 = 12;

/// 8 MiB linear memory cap.
pub const MEMORY_PAGES: u32 = 128;
/// Shadow stack for frame-resident locals.
pub const STACK_SIZE: u32 = 1 << 20;
/// Data starts past a small null guard so offset 0 stays invalid.
pub const DATA_BASE: u32 = 8;

struct FuncEntry {
    name: String,
    type_idx: u32,
    locals: Vec<u8>,
    body: Vec<u8>,
    exported: bool,
}

pub struct Linker<'a> {
    types: &'a TypeRegistry,
    host_io: bool,
    sig_table: Vec<(Vec<u8>, Vec<u8>)>,
    sig_map: HashMap<(Vec<u8>, Vec<u8>), u32>,
    imports: Vec<(&'static str, &'static str, u32)>,
    funcs: Vec<FuncEntry>,
    func_index: HashMap<String, u32>,
    import_count: u32,
    data: Vec<u8>,
    string_offsets: Vec<u32>,
    metadata_offsets: HashMap<String, u32>,
    metadata_patch: Vec<(usize, String)>,
    global_offsets: HashMap<String, u32>,
    scratch_end: u32,
    table_funcs: Vec<u32>,
}

fn link_err(msg: impl Into<String>) -> CompileError {
    CompileError::Link(msg.into())
}

impl<'a> Linker<'a> {
    fn new(types: &'a TypeRegistry, host_io: bool) -> Linker<'a> {
        Linker {
            types,
            host_io,
            sig_table: Vec::new(),
            sig_map: HashMap::new(),
            imports: Vec::new(),
            funcs: Vec::new(),
            func_index: HashMap::new(),
            import_count: 0,
            data: Vec::new(),
            string_offsets: Vec::new(),
            metadata_offsets: HashMap::new(),
            metadata_patch: Vec::new(),
            global_offsets: HashMap::new(),
            scratch_end: 0,
            table_funcs: Vec::new(),
        }
    }

    /// Canonicalize a (params, results) signature to a stable index.
    fn sig(&mut self, params: Vec<u8>, results: Vec<u8>) -> u32 {
        let key = (params, results);
        if let Some(&idx) = self.sig_map.get(&key) {
            return idx;
        }
        let idx = self.sig_table.len() as u32;
        self.sig_table.push(key.clone());
        self.sig_map.insert(key, idx);
        idx
    }

    fn abs_offset(&self) -> u32 {
        DATA_BASE + self.data.len() as u32
    }

    fn pad_to(&mut self, align: u32) {
        while self.abs_offset() % align != 0 {
            self.data.push(0);
        }
    }

    fn add_bytes(&mut self, bytes: &[u8]) -> u32 {
        let off = self.abs_offset();
        self.data.extend_from_slice(bytes);
        off
    }

    fn add_lit(&mut self, s: &str) -> (u32, u32) {
        (self.add_bytes(s.as_bytes()), s.len() as u32)
    }

    /// Parameter/result value types for an IR function, matching the
    /// three-phase ABI the SSA builder uses: pairs take two i64 slots.
    fn ir_sig(&self, f: &IrFunc) -> (Vec<u8>, Vec<u8>) {
        let mut params = Vec::new();
        for i in 0..f.param_count as usize {
            let ty = f.locals[i].ty;
            if self.types.is_pair(ty) {
                params.push(valtype::I64);
                params.push(valtype::I64);
            } else if self.types.is_float(ty) {
                params.push(valtype::F64);
            } else {
                params.push(valtype::I64);
            }
        }
        let results = self.ret_sig(f.ret);
        (params, results)
    }

    fn ret_sig(&self, ret: TypeIndex) -> Vec<u8> {
        if ret == TypeIndex::VOID {
            vec![]
        } else if self.types.is_pair(ret) {
            vec![valtype::I64, valtype::I64]
        } else if self.types.is_float(ret) {
            vec![valtype::F64]
        } else {
            vec![valtype::I64]
        }
    }

    fn declare(&mut self, name: &str, type_idx: u32, exported: bool) -> u32 {
        let idx = self.import_count + self.funcs.len() as u32;
        self.func_index.insert(name.to_string(), idx);
        self.funcs.push(FuncEntry {
            name: name.to_string(),
            type_idx,
            locals: Vec::new(),
            body: Vec::new(),
            exported,
        });
        idx
    }

    fn set_body(&mut self, name: &str, locals: Vec<u8>, body: Vec<u8>) {
        let idx = self.func_index[name] - self.import_count;
        let entry = &mut self.funcs[idx as usize];
        entry.locals = locals;
        entry.body = body;
    }
}

/// Assemble the final module from the lowered IR and its SSA functions.
pub fn link_module(
    ir: &IrModule,
    ssa_funcs: &[Func],
    types: &TypeRegistry,
    opts: &CompileOptions,
) -> Result<Vec<u8>, CompileError> {
    let host_io = opts.host_io();
    let test_rt = opts.test_mode || opts.bench_mode;
    let mut lk = Linker::new(types, host_io);

    // --- Data layout: string literals, metadata table, module
    // variables, formatter scratch.
    for s in &ir.strings {
        let off = lk.add_bytes(s.as_bytes());
        lk.string_offsets.push(off);
    }
    let rt_lits = if test_rt {
        Some(TestRtStrings {
            test_quote: lk.add_lit("test \""),
            quote_dots: lk.add_lit("\" ... "),
            ok_paren: lk.add_lit("ok ("),
            fail_paren: lk.add_lit("FAIL ("),
            ms_close: lk.add_lit("ms)\n"),
            expected: lk.add_lit("  expected: "),
            received: lk.add_lit("\n  received: "),
            newline: lk.add_lit("\n"),
            failed_bar: lk.add_lit("FAILED | "),
            ok_bar: lk.add_lit("ok | "),
            passed_bar: lk.add_lit(" passed | "),
            failed_open: lk.add_lit(" failed ("),
        })
    } else {
        None
    };

    lk.pad_to(4);
    for (i, name) in ir.metadata_types.iter().enumerate() {
        let off = lk.abs_offset();
        lk.metadata_offsets.insert(name.clone(), off);
        let size = named_type_size(types, name);
        let mut record = Vec::with_capacity(METADATA_RECORD_SIZE as usize);
        record.extend_from_slice(&(i as u32).to_le_bytes());
        record.extend_from_slice(&size.to_le_bytes());
        record.extend_from_slice(&0u32.to_le_bytes()); // destructor, patched
        let start = lk.data.len();
        lk.data.extend_from_slice(&record);
        lk.metadata_patch.push((start + 8, name.clone()));
    }

    lk.pad_to(8);
    for g in &ir.globals {
        let off = lk.abs_offset();
        lk.global_offsets.insert(g.name.clone(), off);
        let size = align_up(g.size.max(8), 8) as usize;
        let mut bytes = vec![0u8; size];
        bytes[..8].copy_from_slice(&g.init.to_le_bytes());
        lk.data.extend_from_slice(&bytes);
    }

    lk.pad_to(8);
    let scratch = lk.add_bytes(&[0u8; 32]);
    lk.scratch_end = scratch + 32;

    let data_end = lk.abs_offset();
    let sp_init = align_up(data_end, 16) as i64 + STACK_SIZE as i64;
    let hp_init = sp_init;

    // --- Function index space: imports, user functions, runtime, test
    // runtime.
    if host_io {
        let write_sig = lk.sig(vec![valtype::I64, valtype::I64], vec![]);
        let time_sig = lk.sig(vec![], vec![valtype::I64]);
        lk.imports.push(("cot", "cot_write", write_sig));
        lk.imports.push(("cot", "cot_time", time_sig));
        lk.import_count = 2;
        lk.func_index.insert("cot_write".to_string(), 0);
        lk.func_index.insert("cot_time".to_string(), 1);
    }

    for (f, _) in ir.funcs.iter().zip(ssa_funcs.iter()) {
        let (params, results) = lk.ir_sig(f);
        let type_idx = lk.sig(params, results);
        lk.declare(&f.name, type_idx, f.exported);
    }

    let dtor_type = lk.sig(vec![valtype::I64], vec![]);
    let sig_ii_i = lk.sig(vec![valtype::I64, valtype::I64], vec![valtype::I64]);
    let sig_i_i = lk.sig(vec![valtype::I64], vec![valtype::I64]);
    let sig_i = lk.sig(vec![valtype::I64], vec![]);
    let sig_4i_i = lk.sig(vec![valtype::I64; 4], vec![valtype::I64]);
    let sig_3i = lk.sig(vec![valtype::I64; 3], vec![]);
    let sig_3i_i = lk.sig(vec![valtype::I64; 3], vec![valtype::I64]);
    let sig_none_i = lk.sig(vec![], vec![valtype::I64]);
    let sig_none = lk.sig(vec![], vec![]);
    let sig_ii = lk.sig(vec![valtype::I64, valtype::I64], vec![]);
    let sig_5i = lk.sig(vec![valtype::I64; 5], vec![]);

    let alloc_idx = lk.declare("cot_alloc", sig_ii_i, false);
    lk.declare("cot_retain", sig_i_i, false);
    lk.declare("cot_release", sig_i, false);
    lk.declare("cot_string_concat", sig_4i_i, false);
    lk.declare("cot_string_eq", sig_4i_i, false);
    let list_new_idx = lk.declare("cot_list_new", sig_i_i, false);
    lk.declare("cot_list_len", sig_i_i, false);
    lk.declare("cot_list_get", sig_ii_i, false);
    lk.declare("cot_list_set", sig_3i, false);
    lk.declare("cot_list_push", sig_ii_i, false);
    lk.declare("cot_map_new", sig_none_i, false);
    lk.declare("cot_map_len", sig_i_i, false);
    lk.declare("cot_map_get", sig_ii_i, false);
    lk.declare("cot_map_set", sig_3i_i, false);

    let rt_funcs = if test_rt {
        let write_i64_idx = lk.declare("__write_i64", sig_i, false);
        lk.declare("__test_begin", sig_none, false);
        lk.declare("__test_print_name", sig_ii, false);
        lk.declare("__test_pass", sig_none, false);
        lk.declare("__test_fail", sig_none, false);
        lk.declare("__test_store_fail_values", sig_5i, false);
        lk.declare("__test_summary", sig_ii, false);
        lk.declare("__test_assert_failed", sig_none_i, false);
        lk.declare("__test_passed_count", sig_none_i, false);
        lk.declare("__test_failed_count", sig_none_i, false);
        Some(TestRtFuncs {
            cot_write: lk.func_index["cot_write"],
            cot_time: lk.func_index["cot_time"],
            write_i64: write_i64_idx,
        })
    } else {
        None
    };

    // --- Destructor table: index 0 reserved null; every `_deinit`
    // function follows, and the matching metadata records point at it.
    for name in &ir.metadata_types {
        let dtor_name = format!("{}_deinit", name);
        if let Some(&fidx) = lk.func_index.get(&dtor_name) {
            let table_idx = lk.table_funcs.len() as u32 + 1;
            lk.table_funcs.push(fidx);
            for (pos, ty_name) in &lk.metadata_patch {
                if ty_name == name {
                    let pos = *pos;
                    lk.data[pos..pos + 4].copy_from_slice(&table_idx.to_le_bytes());
                }
            }
        }
    }
    // Any remaining `_deinit` functions join the table even without a
    // metadata record, keeping indices stable for the native path.
    let mut extra: Vec<u32> = Vec::new();
    for entry in &lk.funcs {
        if entry.name.ends_with("_deinit") {
            let idx = lk.func_index[&entry.name];
            if !lk.table_funcs.contains(&idx) {
                extra.push(idx);
            }
        }
    }
    lk.table_funcs.extend(extra);

    // --- Code generation for user functions.
    {
        let ctx = CodegenCtx {
            types,
            func_index: &lk.func_index,
            string_offsets: &lk.string_offsets,
            metadata_offsets: &lk.metadata_offsets,
            global_offsets: &lk.global_offsets,
        };
        let mut bodies = Vec::with_capacity(ssa_funcs.len());
        for f in ssa_funcs {
            let (locals, body) = codegen::emit_func(f, &ctx)?;
            bodies.push((f.name.clone(), locals, body));
        }
        drop(ctx);
        for (name, locals, body) in bodies {
            lk.set_body(&name, locals, body);
        }
    }

    // --- Runtime bodies.
    lk.set_body("cot_alloc", vec![valtype::I64], runtime::cot_alloc_body());
    lk.set_body("cot_retain", vec![valtype::I64], runtime::cot_retain_body());
    lk.set_body(
        "cot_release",
        vec![valtype::I64; 3],
        runtime::cot_release_body(dtor_type),
    );
    lk.set_body(
        "cot_string_concat",
        vec![valtype::I64],
        runtime::cot_string_concat_body(),
    );
    lk.set_body(
        "cot_string_eq",
        vec![valtype::I64],
        runtime::cot_string_eq_body(),
    );
    lk.set_body(
        "cot_list_new",
        vec![valtype::I64],
        runtime::cot_list_new_body(alloc_idx),
    );
    lk.set_body("cot_list_len", vec![], runtime::cot_list_len_body());
    lk.set_body("cot_list_get", vec![], runtime::cot_list_get_body());
    lk.set_body("cot_list_set", vec![], runtime::cot_list_set_body());
    lk.set_body(
        "cot_list_push",
        vec![valtype::I64; 3],
        runtime::cot_list_push_body(list_new_idx),
    );
    lk.set_body(
        "cot_map_new",
        vec![valtype::I64],
        runtime::cot_map_new_body(alloc_idx),
    );
    lk.set_body("cot_map_len", vec![], runtime::cot_map_len_body());
    lk.set_body(
        "cot_map_get",
        vec![valtype::I64; 2],
        runtime::cot_map_get_body(),
    );
    lk.set_body(
        "cot_map_set",
        vec![valtype::I64; 4],
        runtime::cot_map_set_body(alloc_idx),
    );

    if let (Some(funcs), Some(lits)) = (rt_funcs, rt_lits.as_ref()) {
        lk.set_body(
            "__write_i64",
            vec![valtype::I64; 2],
            testrt::write_i64_body(funcs.cot_write, lk.scratch_end),
        );
        lk.set_body(
            "__test_begin",
            vec![valtype::I64],
            testrt::test_begin_body(funcs),
        );
        lk.set_body(
            "__test_print_name",
            vec![],
            testrt::test_print_name_body(funcs, lits),
        );
        lk.set_body("__test_pass", vec![], testrt::test_pass_body(funcs, lits));
        lk.set_body("__test_fail", vec![], testrt::test_fail_body(funcs, lits));
        lk.set_body(
            "__test_store_fail_values",
            vec![],
            testrt::test_store_fail_values_body(),
        );
        lk.set_body(
            "__test_summary",
            vec![],
            testrt::test_summary_body(funcs, lits),
        );
        lk.set_body(
            "__test_assert_failed",
            vec![],
            testrt::test_assert_failed_body(),
        );
        lk.set_body(
            "__test_passed_count",
            vec![],
            testrt::test_passed_count_body(),
        );
        lk.set_body(
            "__test_failed_count",
            vec![],
            testrt::test_failed_count_body(),
        );
    }

    for entry in &lk.funcs {
        if entry.body.is_empty() {
            return Err(link_err(format!("function '{}' has no body", entry.name)));
        }
    }

    if debug::enabled(Phase::Strings) {
        for (i, s) in ir.strings.iter().enumerate() {
            eprintln!("[strings] #{} at {}: {:?}", i, lk.string_offsets[i], s);
        }
    }
    if debug::enabled(Phase::Abi) {
        for entry in &lk.funcs {
            eprintln!(
                "[abi] {} type {} ({} body bytes)",
                entry.name,
                entry.type_idx,
                entry.body.len()
            );
        }
    }

    Ok(emit_module(&lk, sp_init, hp_init))
}

fn named_type_size(types: &TypeRegistry, name: &str) -> u32 {
    for i in 0..types.len() {
        let idx = TypeIndex(i as u32);
        if let TypeKind::Struct { name: n, .. }
        | TypeKind::Enum { name: n, .. }
        | TypeKind::Union { name: n, .. } = types.kind(idx)
        {
            if n == name {
                return types.size_of(idx);
            }
        }
    }
    0
}

/// Serialize every section in the contract order: type, import,
/// function, table, memory, global, export, element, code, data.
fn emit_module(lk: &Linker, sp_init: i64, hp_init: i64) -> Vec<u8> {
    let mut out = WasmWriter::new();
    out.raw(&MAGIC);

    // type
    let mut sec = WasmWriter::new();
    sec.u32v(lk.sig_table.len() as u32);
    for (params, results) in &lk.sig_table {
        sec.byte(0x60);
        sec.u32v(params.len() as u32);
        sec.raw(params);
        sec.u32v(results.len() as u32);
        sec.raw(results);
    }
    out.section(section::TYPE, &sec.bytes);

    // import
    if !lk.imports.is_empty() {
        let mut sec = WasmWriter::new();
        sec.u32v(lk.imports.len() as u32);
        for (module, name, type_idx) in &lk.imports {
            sec.name(module);
            sec.name(name);
            sec.byte(0x00);
            sec.u32v(*type_idx);
        }
        out.section(section::IMPORT, &sec.bytes);
    }

    // function
    let mut sec = WasmWriter::new();
    sec.u32v(lk.funcs.len() as u32);
    for f in &lk.funcs {
        sec.u32v(f.type_idx);
    }
    out.section(section::FUNCTION, &sec.bytes);

    // table: index 0 reserved null, destructors after it
    let table_size = lk.table_funcs.len() as u32 + 1;
    let mut sec = WasmWriter::new();
    sec.u32v(1);
    sec.byte(valtype::FUNCREF);
    sec.byte(0x01); // min and max
    sec.u32v(table_size);
    sec.u32v(table_size);
    out.section(section::TABLE, &sec.bytes);

    // memory
    let mut sec = WasmWriter::new();
    sec.u32v(1);
    sec.byte(0x01);
    sec.u32v(MEMORY_PAGES);
    sec.u32v(MEMORY_PAGES);
    out.section(section::MEMORY, &sec.bytes);

    // global: SP, HP, then the test-runtime and assert-fail globals
    let mut sec = WasmWriter::new();
    sec.u32v(GLOBAL_COUNT);
    for i in 0..GLOBAL_COUNT {
        let init = match i {
            GLOBAL_SP => sp_init,
            GLOBAL_HP => hp_init,
            _ => 0,
        };
        sec.byte(valtype::I64);
        sec.byte(0x01); // mutable
        sec.byte(opcode::I64_CONST);
        sec.i64v(init);
        sec.byte(opcode::END);
    }
    out.section(section::GLOBAL, &sec.bytes);

    // export: memory plus every exported function
    let mut sec = WasmWriter::new();
    let exported: Vec<&FuncEntry> = lk.funcs.iter().filter(|f| f.exported).collect();
    sec.u32v(1 + exported.len() as u32);
    sec.name("memory");
    sec.byte(0x02);
    sec.u32v(0);
    for f in &exported {
        sec.name(&f.name);
        sec.byte(0x00);
        sec.u32v(lk.func_index[&f.name]);
    }
    out.section(section::EXPORT, &sec.bytes);

    // element: active segment filling the table from index 1
    if !lk.table_funcs.is_empty() {
        let mut sec = WasmWriter::new();
        sec.u32v(1);
        sec.byte(0x00);
        sec.byte(opcode::I32_CONST);
        sec.i32v(1);
        sec.byte(opcode::END);
        sec.u32v(lk.table_funcs.len() as u32);
        for &f in &lk.table_funcs {
            sec.u32v(f);
        }
        out.section(section::ELEMENT, &sec.bytes);
    }

    // code
    let mut sec = WasmWriter::new();
    sec.u32v(lk.funcs.len() as u32);
    for f in &lk.funcs {
        let mut body = WasmWriter::new();
        // run-length local declarations
        let mut runs: Vec<(u32, u8)> = Vec::new();
        for &vt in &f.locals {
            match runs.last_mut() {
                Some((n, t)) if *t == vt => *n += 1,
                _ => runs.push((1, vt)),
            }
        }
        body.u32v(runs.len() as u32);
        for (n, t) in runs {
            body.u32v(n);
            body.byte(t);
        }
        body.raw(&f.body);
        body.byte(opcode::END);
        sec.u32v(body.bytes.len() as u32);
        sec.raw(&body.bytes);
    }
    out.section(section::CODE, &sec.bytes);

    // data
    if !lk.data.is_empty() {
        let mut sec = WasmWriter::new();
        sec.u32v(1);
        sec.byte(0x00);
        sec.byte(opcode::I32_CONST);
        sec.i32v(DATA_BASE as i32);
        sec.byte(opcode::END);
        sec.u32v(lk.data.len() as u32);
        sec.raw(&lk.data);
        out.section(section::DATA, &sec.bytes);
    }

    out.bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_layout_constants() {
        assert_eq!(GLOBAL_SP, 0, "the stack pointer is global index 0");
        assert_eq!(GLOBAL_HP, 1);
        assert_eq!(GLOBAL_COUNT, 12);
    }

    #[test]
    fn test_sig_dedup() {
        let types = TypeRegistry::new();
        let mut lk = Linker::new(&types, false);
        let a = lk.sig(vec![valtype::I64], vec![valtype::I64]);
        let b = lk.sig(vec![valtype::I64], vec![valtype::I64]);
        let c = lk.sig(vec![valtype::I64], vec![]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_data_padding() {
        let types = TypeRegistry::new();
        let mut lk = Linker::new(&types, false);
        lk.add_bytes(b"abc");
        lk.pad_to(8);
        assert_eq!(lk.abs_offset() % 8, 0);
    }
}
