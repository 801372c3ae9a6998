//! Test runtime, emitted in test and bench builds.
//!
//! Timing is computed inside these functions by reading globals written
//! on test entry; the generated runner calls them in strict temporal
//! order and reads no timing value itself (a cross-block reference in
//! the runner would not survive its dispatch structure). Output goes
//! through the `cot_write` host import; durations print through a
//! shared integer formatter writing into a scratch region.

use super::encode::opcode;
use super::runtime::Asm;
use super::{
    GLOBAL_ASSERT_FAILED, GLOBAL_FAIL_IS_STR, GLOBAL_FAIL_LEFT, GLOBAL_FAIL_LEFT_LEN,
    GLOBAL_FAIL_RIGHT, GLOBAL_FAIL_RIGHT_LEN, GLOBAL_SUITE_START, GLOBAL_TESTS_FAILED,
    GLOBAL_TESTS_PASSED, GLOBAL_TEST_START,
};

/// Data-segment literals the test runtime prints, as (offset, len).
#[derive(Debug, Clone, Copy, Default)]
pub struct TestRtStrings {
    pub test_quote: (u32, u32),    // `test "`
    pub quote_dots: (u32, u32),    // `" ... `
    pub ok_paren: (u32, u32),      // `ok (`
    pub fail_paren: (u32, u32),    // `FAIL (`
    pub ms_close: (u32, u32),      // `ms)\n`
    pub expected: (u32, u32),      // `  expected: `
    pub received: (u32, u32),      // `\n  received: `
    pub newline: (u32, u32),       // `\n`
    pub failed_bar: (u32, u32),    // `FAILED | `
    pub ok_bar: (u32, u32),        // `ok | `
    pub passed_bar: (u32, u32),    // ` passed | `
    pub failed_open: (u32, u32),   // ` failed (`
}

/// Function indices the bodies call into.
#[derive(Debug, Clone, Copy)]
pub struct TestRtFuncs {
    pub cot_write: u32,
    pub cot_time: u32,
    pub write_i64: u32,
}

fn write_lit(a: &mut Asm, cot_write: u32, lit: (u32, u32)) {
    a.i64_const(lit.0 as i64);
    a.i64_const(lit.1 as i64);
    a.call(cot_write);
}

/// __test_begin(): reset the assert flag, stamp the test start time,
/// and latch the suite start on the first call. Locals: 0 = now.
pub fn test_begin_body(funcs: TestRtFuncs) -> Vec<u8> {
    let mut a = Asm::new();
    a.i64_const(0).global_set(GLOBAL_ASSERT_FAILED);
    a.call(funcs.cot_time).local_set(0);
    a.local_get(0).global_set(GLOBAL_TEST_START);
    a.global_get(GLOBAL_SUITE_START).op(opcode::I64_EQZ).if_empty();
    a.local_get(0).global_set(GLOBAL_SUITE_START);
    a.end();
    a.finish()
}

/// __test_print_name(ptr, len): `test "NAME" ... ` without a newline.
pub fn test_print_name_body(funcs: TestRtFuncs, lits: &TestRtStrings) -> Vec<u8> {
    let mut a = Asm::new();
    write_lit(&mut a, funcs.cot_write, lits.test_quote);
    a.local_get(0);
    a.local_get(1);
    a.call(funcs.cot_write);
    write_lit(&mut a, funcs.cot_write, lits.quote_dots);
    a.finish()
}

/// __test_pass(): `ok (Nms)\n` with the duration computed here.
pub fn test_pass_body(funcs: TestRtFuncs, lits: &TestRtStrings) -> Vec<u8> {
    let mut a = Asm::new();
    a.global_get(GLOBAL_TESTS_PASSED)
        .i64_const(1)
        .op(opcode::I64_ADD)
        .global_set(GLOBAL_TESTS_PASSED);
    write_lit(&mut a, funcs.cot_write, lits.ok_paren);
    a.call(funcs.cot_time)
        .global_get(GLOBAL_TEST_START)
        .op(opcode::I64_SUB);
    a.call(funcs.write_i64);
    write_lit(&mut a, funcs.cot_write, lits.ms_close);
    a.finish()
}

/// __test_fail(): `FAIL (Nms)\n` plus the expected/received lines from
/// the stored fail values.
pub fn test_fail_body(funcs: TestRtFuncs, lits: &TestRtStrings) -> Vec<u8> {
    let mut a = Asm::new();
    a.global_get(GLOBAL_TESTS_FAILED)
        .i64_const(1)
        .op(opcode::I64_ADD)
        .global_set(GLOBAL_TESTS_FAILED);
    write_lit(&mut a, funcs.cot_write, lits.fail_paren);
    a.call(funcs.cot_time)
        .global_get(GLOBAL_TEST_START)
        .op(opcode::I64_SUB);
    a.call(funcs.write_i64);
    write_lit(&mut a, funcs.cot_write, lits.ms_close);

    write_lit(&mut a, funcs.cot_write, lits.expected);
    a.global_get(GLOBAL_FAIL_IS_STR).op(opcode::I64_EQZ).if_empty();
    a.global_get(GLOBAL_FAIL_LEFT).call(funcs.write_i64);
    a.op(opcode::ELSE);
    a.global_get(GLOBAL_FAIL_LEFT);
    a.global_get(GLOBAL_FAIL_LEFT_LEN);
    a.call(funcs.cot_write);
    a.end();

    write_lit(&mut a, funcs.cot_write, lits.received);
    a.global_get(GLOBAL_FAIL_IS_STR).op(opcode::I64_EQZ).if_empty();
    a.global_get(GLOBAL_FAIL_RIGHT).call(funcs.write_i64);
    a.op(opcode::ELSE);
    a.global_get(GLOBAL_FAIL_RIGHT);
    a.global_get(GLOBAL_FAIL_RIGHT_LEN);
    a.call(funcs.cot_write);
    a.end();
    write_lit(&mut a, funcs.cot_write, lits.newline);
    a.finish()
}

/// __test_store_fail_values(left, right, is_string, left_len, right_len):
/// stash the display values and raise the assert flag.
pub fn test_store_fail_values_body() -> Vec<u8> {
    let mut a = Asm::new();
    a.local_get(0).global_set(GLOBAL_FAIL_LEFT);
    a.local_get(1).global_set(GLOBAL_FAIL_RIGHT);
    a.local_get(2).global_set(GLOBAL_FAIL_IS_STR);
    a.local_get(3).global_set(GLOBAL_FAIL_LEFT_LEN);
    a.local_get(4).global_set(GLOBAL_FAIL_RIGHT_LEN);
    a.i64_const(1).global_set(GLOBAL_ASSERT_FAILED);
    a.finish()
}

/// __test_summary(passed, failed):
/// `ok | N passed | M failed (Tms)\n` or the FAILED variant.
pub fn test_summary_body(funcs: TestRtFuncs, lits: &TestRtStrings) -> Vec<u8> {
    let mut a = Asm::new();
    a.local_get(1).op(opcode::I64_EQZ).if_empty();
    write_lit(&mut a, funcs.cot_write, lits.ok_bar);
    a.op(opcode::ELSE);
    write_lit(&mut a, funcs.cot_write, lits.failed_bar);
    a.end();
    a.local_get(0).call(funcs.write_i64);
    write_lit(&mut a, funcs.cot_write, lits.passed_bar);
    a.local_get(1).call(funcs.write_i64);
    write_lit(&mut a, funcs.cot_write, lits.failed_open);
    a.call(funcs.cot_time)
        .global_get(GLOBAL_SUITE_START)
        .op(opcode::I64_SUB);
    a.call(funcs.write_i64);
    write_lit(&mut a, funcs.cot_write, lits.ms_close);
    a.finish()
}

/// __test_assert_failed() -> i64.
pub fn test_assert_failed_body() -> Vec<u8> {
    let mut a = Asm::new();
    a.global_get(GLOBAL_ASSERT_FAILED);
    a.finish()
}

/// __test_passed_count() -> i64.
pub fn test_passed_count_body() -> Vec<u8> {
    let mut a = Asm::new();
    a.global_get(GLOBAL_TESTS_PASSED);
    a.finish()
}

/// __test_failed_count() -> i64.
pub fn test_failed_count_body() -> Vec<u8> {
    let mut a = Asm::new();
    a.global_get(GLOBAL_TESTS_FAILED);
    a.finish()
}

/// __write_i64(v): decimal formatter into the scratch region, then one
/// `cot_write`. Locals: 1 = cursor, 2 = negative flag.
/// `scratch_end` is the exclusive end of the scratch buffer.
pub fn write_i64_body(cot_write: u32, scratch_end: u32) -> Vec<u8> {
    let end = scratch_end as i64;
    let mut a = Asm::new();
    a.i64_const(end).local_set(1);
    a.i64_const(0).local_set(2);
    // negative?
    a.local_get(0).i64_const(0).op(opcode::I64_LT_S).if_empty();
    a.i64_const(1).local_set(2);
    a.i64_const(0).local_get(0).op(opcode::I64_SUB).local_set(0);
    a.end();
    // do-while over the digits; also covers v == 0
    a.loop_empty();
    {
        a.local_get(1).i64_const(1).op(opcode::I64_SUB).local_set(1);
        a.local_get(1).wrap();
        a.local_get(0)
            .i64_const(10)
            .op(opcode::I64_REM_U)
            .i64_const('0' as i64)
            .op(opcode::I64_ADD);
        a.store8(0);
        a.local_get(0).i64_const(10).op(opcode::I64_DIV_U).local_set(0);
        a.local_get(0).op(opcode::I64_EQZ).op(opcode::I32_EQZ).br_if(0);
    }
    a.end();
    // sign
    a.local_get(2).wrap().if_empty();
    a.local_get(1).i64_const(1).op(opcode::I64_SUB).local_set(1);
    a.local_get(1).wrap().i64_const('-' as i64).store8(0);
    a.end();
    a.local_get(1);
    a.i64_const(end).local_get(1).op(opcode::I64_SUB);
    a.call(cot_write);
    a.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_fail_values_sets_flag() {
        let body = test_store_fail_values_body();
        // Ends by raising ASSERT_FAILED: i64.const 1; global.set.
        let pos = body
            .windows(2)
            .position(|w| w[0] == opcode::I64_CONST && w[1] == 1)
            .expect("stores the flag constant");
        assert!(pos + 2 < body.len());
        assert_eq!(body[pos + 2], opcode::GLOBAL_SET);
    }

    #[test]
    fn test_write_i64_has_digit_loop() {
        let body = write_i64_body(0, 1024);
        assert!(body.contains(&opcode::LOOP));
        assert!(body.contains(&opcode::BR_IF));
    }
}
