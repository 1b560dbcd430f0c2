use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;
use std::string::String;

use super::*;
use crate::insn::{lib_fn, op, set_fn, sysio_fn, Insn};

/// A writer handing its bytes back to the test after the machine owns it.
#[derive(Clone, Default)]
struct SharedOutput(Rc<RefCell<Vec<u8>>>);

impl std::io::Write for SharedOutput {
    fn write(&mut self, buffer: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buffer);
        Ok(buffer.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn assemble(insns: &[Insn]) -> Vec<u8> {
    let mut program = Vec::new();
    for insn in insns {
        insn.encode_into(&mut program);
    }
    program
}

fn code_size(insns: &[Insn]) -> u16 {
    insns.iter().map(|insn| insn.size() as u16).sum()
}

struct Exec {
    result: core::result::Result<u16, TrapInfo>,
    output: SharedOutput,
    machine: Machine,
}

impl Exec {
    fn stdout(&self) -> String {
        String::from_utf8(self.output.0.borrow().clone()).unwrap()
    }
}

fn exec_with(
    insns: &[Insn],
    entry: u16,
    rodata: &[u8],
    input: &str,
    mut config: Config,
) -> Exec {
    let output = SharedOutput::default();
    config.input = Some(Box::new(Cursor::new(input.as_bytes().to_vec())));
    config.output = Some(Box::new(output.clone()));
    let mut machine = Machine::new(assemble(insns), rodata, entry, config).unwrap();
    let result = machine.run();
    Exec {
        result,
        output,
        machine,
    }
}

fn exec(insns: &[Insn], rodata: &[u8], input: &str) -> Exec {
    exec_with(insns, 0, rodata, input, Config::default())
}

/// `[file 1][value...][width 0] sysio writeint`, then a newline.
fn write_int_and_newline(value_insns: &[Insn]) -> Vec<Insn> {
    let mut out = vec![Insn::arg16(op::PUSH, 1)];
    out.extend_from_slice(value_insns);
    out.extend_from_slice(&[
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::WRITEINT),
        Insn::arg16(op::PUSH, 1),
        Insn::arg8(op::PUSHB, b'\n'.into()),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::WRITECHAR),
    ]);
    out
}

fn halt() -> Vec<Insn> {
    vec![Insn::arg16(op::PUSH, 0), Insn::bare(op::END)]
}

#[test]
fn arithmetic_and_output() {
    // (7 * 6 - 2) / 4 = 10
    let mut insns = write_int_and_newline(&[
        Insn::arg16(op::PUSH, 7),
        Insn::arg16(op::PUSH, 6),
        Insn::bare(op::MUL),
        Insn::arg16(op::PUSH, 2),
        Insn::bare(op::SUB),
        Insn::arg16(op::PUSH, 4),
        Insn::bare(op::DIV),
    ]);
    insns.extend(halt());
    let run = exec(&insns, &[], "");
    assert_eq!(run.result, Ok(0));
    assert_eq!(run.stdout(), "10\n");
}

#[test]
fn division_by_zero_traps() {
    let insns = [
        Insn::arg16(op::PUSH, 1),
        Insn::arg16(op::PUSH, 0),
        Insn::bare(op::DIV),
    ];
    let run = exec(&insns, &[], "");
    assert_eq!(
        run.result,
        Err(TrapInfo {
            trap: Trap::IntOverflow,
            pc: 6,
        })
    );
}

#[test]
fn sixteen_bit_wrap() {
    let mut insns = write_int_and_newline(&[
        Insn::arg16(op::PUSH, 0x7FFF),
        Insn::bare(op::INC),
    ]);
    insns.extend(halt());
    let run = exec(&insns, &[], "");
    assert_eq!(run.stdout(), "-32768\n");
}

#[test]
fn bad_pc_and_illegal_opcode() {
    let run = exec(&[Insn::arg16(op::JMP, 0x4000)], &[], "");
    assert_eq!(
        run.result,
        Err(TrapInfo {
            trap: Trap::BadPc,
            pc: 0x4000,
        })
    );

    let run = exec_with(&[Insn::bare(0x3F)], 0, &[], "", Config::default());
    assert_eq!(
        run.result,
        Err(TrapInfo {
            trap: Trap::IllegalOpcode,
            pc: 0,
        })
    );
}

#[test]
fn conditional_branches() {
    // if 3 < 5 then write(1) else write(2)
    // Layout: push 3; push 5; jgte ELSE; <write 1>; jmp END; ELSE: <write 2>; END: halt
    let write_one = write_int_and_newline(&[Insn::arg16(op::PUSH, 1)]);
    let write_two = write_int_and_newline(&[Insn::arg16(op::PUSH, 2)]);
    let head_len = 3 * 3; // push, push, jgte
    let jmp_len = 3;
    let else_addr = head_len + code_size(&write_one) + jmp_len;
    let end_addr = else_addr + code_size(&write_two);

    let mut insns = vec![
        Insn::arg16(op::PUSH, 3),
        Insn::arg16(op::PUSH, 5),
        Insn::arg16(op::JGTE, else_addr),
    ];
    insns.extend(write_one);
    insns.push(Insn::arg16(op::JMP, end_addr));
    insns.extend(write_two);
    insns.extend(halt());
    let run = exec(&insns, &[], "");
    assert_eq!(run.result, Ok(0));
    assert_eq!(run.stdout(), "1\n");
}

#[test]
fn swap_by_reference() {
    // procedure swap(var x, y: integer); var t: integer;
    // with parameters addressed below the frame base.
    let x = 0xFFF8u16; // fp-4, as a frame-base-relative offset
    let y = 0xFFFAu16; // fp-2
    let t = 0x0002u16; // first local
    let swap = [
        Insn::arg16(op::INDS, 2),
        Insn::arg8_16(op::LDS, 0, x),
        Insn::bare(op::LDI),
        Insn::arg8_16(op::STS, 0, t), // t := x^
        Insn::arg8_16(op::LDS, 0, x),
        Insn::arg8_16(op::LDS, 0, y),
        Insn::bare(op::LDI),
        Insn::bare(op::STI), // x^ := y^
        Insn::arg8_16(op::LDS, 0, y),
        Insn::arg8_16(op::LDS, 0, t),
        Insn::bare(op::STI), // y^ := t
        Insn::arg16(op::INDS, 0xFFFE),
        Insn::bare(op::RET),
    ];
    let entry = code_size(&swap);

    // var a at spb+6, b at spb+8 (above the seeded outermost frame).
    let mut main = vec![
        Insn::arg16(op::INDS, 4),
        Insn::arg16(op::PUSH, 100),
        Insn::arg16(op::ST, 6), // a := 100
        Insn::arg16(op::PUSH, 200),
        Insn::arg16(op::ST, 8), // b := 200
        Insn::arg16(op::LA, 6),
        Insn::arg16(op::LA, 8),
        Insn::arg8_16(op::PCAL, 0, 0), // swap(a, b)
        Insn::arg16(op::INDS, 0xFFFC),
    ];
    main.extend(write_int_and_newline(&[Insn::arg16(op::LD, 6)]));
    main.extend(write_int_and_newline(&[Insn::arg16(op::LD, 8)]));
    main.extend(halt());

    let mut insns = swap.to_vec();
    insns.extend(main);
    let run = exec_with(&insns, entry, &[], "", Config::default());
    assert_eq!(run.result, Ok(0));
    assert_eq!(run.stdout(), "200\n100\n");
}

#[test]
fn stack_balance_across_call() {
    // A call with matched pcal/ret leaves sp where it started.
    let callee = [Insn::bare(op::RET)];
    let entry = code_size(&callee);
    let insns = [
        Insn::bare(op::RET), // callee at 0
        Insn::arg8_16(op::PCAL, 0, 0),
        Insn::arg16(op::PUSH, 0),
        Insn::bare(op::END),
    ];
    let run = exec_with(&insns, entry, &[], "", Config::default());
    assert_eq!(run.result, Ok(0));
    // After END popped the exit code, sp is back at the seeded frame top.
    assert_eq!(run.machine.sp(), run.machine.spb + 6);
}

#[test]
fn set_cardinality_of_union() {
    // s := ['A','C','E'] + ['B','D']; write(card(s)) on a subrange with
    // minimum value 'A'.
    let min = u16::from(b'A');
    let mut value = vec![Insn::arg8(op::SETOP, set_fn::EMPTY)];
    for member in [b'A', b'C', b'E'] {
        value.extend_from_slice(&[
            Insn::arg16(op::PUSH, member.into()),
            Insn::arg16(op::PUSH, min),
            Insn::arg8(op::SETOP, set_fn::INCLUDE),
        ]);
    }
    value.push(Insn::arg8(op::SETOP, set_fn::EMPTY));
    for member in [b'B', b'D'] {
        value.extend_from_slice(&[
            Insn::arg16(op::PUSH, member.into()),
            Insn::arg16(op::PUSH, min),
            Insn::arg8(op::SETOP, set_fn::INCLUDE),
        ]);
    }
    value.push(Insn::arg8(op::SETOP, set_fn::UNION));
    value.push(Insn::arg8(op::SETOP, set_fn::CARD));

    let mut insns = write_int_and_newline(&value);
    insns.extend(halt());
    let run = exec(&insns, &[], "");
    assert_eq!(run.result, Ok(0));
    assert_eq!(run.stdout(), "5\n");
}

#[test]
fn set_cardinality_identity() {
    // card(a + b) = card(a) + card(b) - card(a * b) for overlapping sets.
    let build_set = |members: &[u16]| -> Vec<Insn> {
        let mut out = vec![Insn::arg8(op::SETOP, set_fn::EMPTY)];
        for &member in members {
            out.extend_from_slice(&[
                Insn::arg16(op::PUSH, member),
                Insn::arg16(op::PUSH, 0),
                Insn::arg8(op::SETOP, set_fn::INCLUDE),
            ]);
        }
        out
    };
    let a: &[u16] = &[1, 2, 3, 10];
    let b: &[u16] = &[3, 10, 40, 63];

    // card(a + b) + card(a * b) = card(a) + card(b) = 8
    let mut value = build_set(a);
    value.extend(build_set(b));
    value.push(Insn::arg8(op::SETOP, set_fn::UNION));
    value.push(Insn::arg8(op::SETOP, set_fn::CARD));
    value.extend(build_set(a));
    value.extend(build_set(b));
    value.push(Insn::arg8(op::SETOP, set_fn::INTERSECT));
    value.push(Insn::arg8(op::SETOP, set_fn::CARD));
    value.push(Insn::bare(op::ADD));

    let mut insns = write_int_and_newline(&value);
    insns.extend(halt());
    let run = exec(&insns, &[], "");
    assert_eq!(run.result, Ok(0));
    assert_eq!(run.stdout(), "8\n");
}

#[test]
fn set_difference_singleton_subrange() {
    // (a - b) + {5} rebuilt from singletons and subranges equals a.
    let mut value = vec![
        // a = {1, 5}
        Insn::arg8(op::SETOP, set_fn::EMPTY),
        Insn::arg16(op::PUSH, 1),
        Insn::arg16(op::PUSH, 0),
        Insn::arg8(op::SETOP, set_fn::INCLUDE),
        Insn::arg16(op::PUSH, 5),
        Insn::arg16(op::PUSH, 0),
        Insn::arg8(op::SETOP, set_fn::INCLUDE),
        // b = {5}
        Insn::arg8(op::SETOP, set_fn::EMPTY),
        Insn::arg16(op::PUSH, 5),
        Insn::arg16(op::PUSH, 0),
        Insn::arg8(op::SETOP, set_fn::INCLUDE),
        Insn::arg8(op::SETOP, set_fn::DIFFERENCE), // a - b = {1}
        // singleton {5} back in, union -> {1, 5}
        Insn::arg16(op::PUSH, 5),
        Insn::arg16(op::PUSH, 0),
        Insn::arg8(op::SETOP, set_fn::SINGLETON),
        Insn::arg8(op::SETOP, set_fn::UNION),
        // compare with a rebuilt via subrange arithmetic: {1} u {5}
        Insn::arg16(op::PUSH, 1),
        Insn::arg16(op::PUSH, 1),
        Insn::arg16(op::PUSH, 0),
        Insn::arg8(op::SETOP, set_fn::SUBRANGE),
        Insn::arg16(op::PUSH, 5),
        Insn::arg16(op::PUSH, 5),
        Insn::arg16(op::PUSH, 0),
        Insn::arg8(op::SETOP, set_fn::SUBRANGE),
        Insn::arg8(op::SETOP, set_fn::UNION),
        Insn::arg8(op::SETOP, set_fn::EQU),
    ];
    value = write_int_and_newline(&value);
    value.extend(halt());
    let run = exec(&value, &[], "");
    assert_eq!(run.result, Ok(0));
    assert_eq!(run.stdout(), "1\n");
}

#[test]
fn set_member_out_of_range() {
    let insns = [
        Insn::arg8(op::SETOP, set_fn::EMPTY),
        Insn::arg16(op::PUSH, 200),
        Insn::arg16(op::PUSH, 0),
        Insn::arg8(op::SETOP, set_fn::MEMBER),
    ];
    let run = exec(&insns, &[], "");
    assert_eq!(run.result.unwrap_err().trap, Trap::ValueRange);
}

#[test]
fn real_arithmetic_round_trip() {
    use crate::insn::fp;
    // round(2.5 * 4) = 10, with the integer operand promoted in place.
    let mut value = vec![
        Insn::arg16(op::PUSH, 4),
        Insn::arg8(op::FLOAT, fp::FLOAT), // 4.0
    ];
    // 2.5 = 10 / 4
    value.extend_from_slice(&[
        Insn::arg16(op::PUSH, 10),
        Insn::arg8(op::FLOAT, fp::FLOAT),
        Insn::arg16(op::PUSH, 4),
        Insn::arg8(op::FLOAT, fp::DIV | fp::INT1), // 10.0 / 4
        Insn::arg8(op::FLOAT, fp::MUL),            // 4.0 * 2.5
        Insn::arg8(op::FLOAT, fp::ROUND),
    ]);
    let mut insns = write_int_and_newline(&value);
    insns.extend(halt());
    let run = exec(&insns, &[], "");
    assert_eq!(run.result, Ok(0));
    assert_eq!(run.stdout(), "10\n");
}

#[test]
fn float_mod_is_rejected() {
    use crate::insn::fp;
    let insns = [
        Insn::arg16(op::PUSH, 1),
        Insn::arg8(op::FLOAT, fp::FLOAT),
        Insn::arg16(op::PUSH, 1),
        Insn::arg8(op::FLOAT, fp::FLOAT),
        Insn::arg8(op::FLOAT, fp::MOD),
    ];
    let run = exec(&insns, &[], "");
    assert_eq!(run.result.unwrap_err().trap, Trap::BadFpOpcode);
}

#[test]
fn string_concat_overflow_leaves_csp() {
    // With stralloc = 8, concatenating two 6-character strings overflows;
    // csp must be unchanged from before the failing call.
    let config = Config {
        stralloc: 8,
        ..Config::default()
    };
    let insns = [
        Insn::bare(op::PUSHS),
        Insn::arg16(op::LIB, lib_fn::STRTMP),
        Insn::arg16(op::LAC, 0),
        Insn::arg16(op::PUSH, 6),
        Insn::arg16(op::LIB, lib_fn::STRCAT), // len 6: fits
        Insn::arg16(op::LAC, 0),
        Insn::arg16(op::PUSH, 6),
        Insn::arg16(op::LIB, lib_fn::STRCAT), // len 12: overflow
    ];
    let run = exec_with(&insns, 0, b"abcdef", "", config);
    assert_eq!(run.result.unwrap_err().trap, Trap::StringStackOverflow);
    // Reserved word plus the one temporary buffer.
    assert_eq!(run.machine.csp(), 2 + 8);
}

#[test]
fn string_stack_restored_by_pops() {
    let insns = [
        Insn::bare(op::PUSHS),
        Insn::arg16(op::LIB, lib_fn::STRTMP),
        Insn::arg16(op::INDS, 0xFFFC), // discard the string value
        Insn::bare(op::POPS),
        Insn::arg16(op::PUSH, 0),
        Insn::bare(op::END),
    ];
    let run = exec(&insns, &[], "");
    assert_eq!(run.result, Ok(0));
    assert_eq!(run.machine.csp(), 2);
}

#[test]
fn string_copy_compare_and_write() {
    // var s: string; s := 'hello'; write(s); write(strcmp(s, 'hellp'))
    let var = 6u16; // string variable at spb+6: addr, len
    let mut insns = vec![
        Insn::arg16(op::INDS, 4),
        Insn::arg16(op::LA, var),
        Insn::arg16(op::LIB, lib_fn::STRINIT),
        // s := 'hello'
        Insn::arg16(op::LAC, 0),
        Insn::arg16(op::PUSH, 5),
        Insn::arg16(op::LA, var),
        Insn::arg16(op::LIB, lib_fn::STRCPY),
        // write(s)
        Insn::arg16(op::PUSH, 1),
        Insn::arg16(op::LD, var),
        Insn::arg16(op::LD, var + 2),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::WRITESTRING),
        // write(strcmp(s, 'hellp'))
        Insn::arg16(op::PUSH, 1),
        Insn::arg16(op::LD, var),
        Insn::arg16(op::LD, var + 2),
        Insn::arg16(op::LAC, 6),
        Insn::arg16(op::PUSH, 5),
        Insn::arg16(op::LIB, lib_fn::STRCMP),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::WRITEINT),
    ];
    insns.extend(halt());
    let run = exec(&insns, b"hello\0hellp\0", "");
    assert_eq!(run.result, Ok(0));
    assert_eq!(run.stdout(), "hello-1");
}

#[test]
fn substring_insert_delete_position() {
    // s := 'barnacle'; write(pos('nac', s)); s2 := copy(s, 4, 3);
    let s = 6u16;
    let mut insns = vec![
        Insn::arg16(op::INDS, 4),
        Insn::arg16(op::LA, s),
        Insn::arg16(op::LIB, lib_fn::STRINIT),
        Insn::arg16(op::LAC, 0),
        Insn::arg16(op::PUSH, 8),
        Insn::arg16(op::LA, s),
        Insn::arg16(op::LIB, lib_fn::STRCPY),
    ];
    // write(pos('nac', s))
    insns.push(Insn::arg16(op::PUSH, 1));
    insns.extend_from_slice(&[
        Insn::arg16(op::LD, s),
        Insn::arg16(op::LD, s + 2),
        Insn::arg16(op::LAC, 10),
        Insn::arg16(op::PUSH, 3),
        Insn::arg16(op::LIB, lib_fn::STRPOS),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::WRITEINT),
    ]);
    // write(copy(s, 4, 3))
    insns.push(Insn::arg16(op::PUSH, 1));
    insns.extend_from_slice(&[
        Insn::arg16(op::LD, s),
        Insn::arg16(op::LD, s + 2),
        Insn::arg16(op::PUSH, 4),
        Insn::arg16(op::PUSH, 3),
        Insn::arg16(op::LIB, lib_fn::SUBSTR),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::WRITESTRING),
    ]);
    // delete(s, 1, 4); write(s)  -> 'acle'
    insns.extend_from_slice(&[
        Insn::arg16(op::LA, s),
        Insn::arg16(op::PUSH, 1),
        Insn::arg16(op::PUSH, 4),
        Insn::arg16(op::LIB, lib_fn::STRDEL),
    ]);
    insns.push(Insn::arg16(op::PUSH, 1));
    insns.extend_from_slice(&[
        Insn::arg16(op::LD, s),
        Insn::arg16(op::LD, s + 2),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::WRITESTRING),
    ]);
    // insert('obst', s, 1); write(s) -> 'obstacle'
    insns.extend_from_slice(&[
        Insn::arg16(op::LAC, 14),
        Insn::arg16(op::PUSH, 4),
        Insn::arg16(op::LA, s),
        Insn::arg16(op::PUSH, 1),
        Insn::arg16(op::LIB, lib_fn::STRINS),
    ]);
    insns.push(Insn::arg16(op::PUSH, 1));
    insns.extend_from_slice(&[
        Insn::arg16(op::LD, s),
        Insn::arg16(op::LD, s + 2),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::WRITESTRING),
    ]);
    insns.extend(halt());

    let rodata = b"barnacle\0\0nac\0obst";
    let run = exec(&insns, rodata, "");
    assert_eq!(run.result, Ok(0));
    assert_eq!(run.stdout(), "4nacacleobstacle");
}

#[test]
fn heap_new_dispose_coalesce() {
    // p := new(64); q := new(64); dispose(p); dispose(q);
    // then a 400-byte allocation succeeds only if the frees coalesced,
    // and lands back at the original first chunk.
    let p = 6u16;
    let q = 8u16;
    let config = Config {
        hpsize: 512,
        ..Config::default()
    };
    let mut insns = vec![
        Insn::arg16(op::INDS, 4),
        Insn::arg16(op::PUSH, 64),
        Insn::arg16(op::LIB, lib_fn::NEW),
        Insn::arg16(op::ST, p),
        Insn::arg16(op::PUSH, 64),
        Insn::arg16(op::LIB, lib_fn::NEW),
        Insn::arg16(op::ST, q),
        Insn::arg16(op::LD, p),
        Insn::arg16(op::LIB, lib_fn::DISPOSE),
        Insn::arg16(op::LD, q),
        Insn::arg16(op::LIB, lib_fn::DISPOSE),
    ];
    // write(ord(new(400) = p))
    insns.push(Insn::arg16(op::PUSH, 1));
    insns.extend_from_slice(&[
        Insn::arg16(op::PUSH, 400),
        Insn::arg16(op::LIB, lib_fn::NEW),
        Insn::arg16(op::LD, p),
        Insn::bare(op::EQU),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::WRITEINT),
    ]);
    insns.extend(halt());
    let run = exec_with(&insns, 0, &[], "", config);
    assert_eq!(run.result, Ok(0));
    assert_eq!(run.stdout(), "1");
}

#[test]
fn dispose_of_garbage_is_an_error() {
    let insns = [
        Insn::arg16(op::PUSH, 2),
        Insn::arg16(op::LIB, lib_fn::DISPOSE),
    ];
    let run = exec(&insns, &[], "");
    assert_eq!(run.result.unwrap_err().trap, Trap::InternalError);
}

#[test]
fn eoln_and_eof_transitions() {
    // Read three integers from "1 2 3\n". After the third, eoln is true
    // and eof only turns true once a read attempt consumes the line end.
    let v = 6u16;
    let mut insns = vec![Insn::arg16(op::INDS, 2)];
    for _ in 0..3 {
        insns.extend_from_slice(&[
            Insn::arg16(op::PUSH, 0),
            Insn::arg16(op::LA, v),
            Insn::arg16(op::SYSIO, sysio_fn::READINT),
        ]);
    }
    // write(eoln(input)); write(eof(input))
    insns.push(Insn::arg16(op::PUSH, 1));
    insns.extend_from_slice(&[
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::EOLN),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::WRITEINT),
    ]);
    insns.push(Insn::arg16(op::PUSH, 1));
    insns.extend_from_slice(&[
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::EOF),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::WRITEINT),
    ]);
    // The next read attempt consumes the line end.
    insns.extend_from_slice(&[
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::LA, v),
        Insn::arg16(op::SYSIO, sysio_fn::READCHAR),
    ]);
    insns.push(Insn::arg16(op::PUSH, 1));
    insns.extend_from_slice(&[
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::EOF),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::WRITEINT),
    ]);
    insns.extend(halt());
    let run = exec(&insns, &[], "1 2 3\n");
    assert_eq!(run.result, Ok(0));
    assert_eq!(run.stdout(), "101");
}

#[test]
fn read_integers_from_input() {
    let v = 6u16;
    let mut insns = vec![
        Insn::arg16(op::INDS, 2),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::LA, v),
        Insn::arg16(op::SYSIO, sysio_fn::READINT),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::LA, v),
        Insn::arg16(op::SYSIO, sysio_fn::READINT),
    ];
    // Overwrites v; the second token is -7.
    insns.extend(write_int_and_newline(&[Insn::arg16(op::LD, v)]));
    insns.extend(halt());
    let run = exec(&insns, &[], "  12 -7\n");
    assert_eq!(run.result, Ok(0));
    assert_eq!(run.stdout(), "-7\n");
}

#[test]
fn integer_parse_saturates() {
    let v = 6u16;
    let mut insns = vec![
        Insn::arg16(op::INDS, 2),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::LA, v),
        Insn::arg16(op::SYSIO, sysio_fn::READINT),
    ];
    insns.extend(write_int_and_newline(&[Insn::arg16(op::LD, v)]));
    insns.extend(halt());
    let run = exec(&insns, &[], "99999\n");
    assert_eq!(run.result, Ok(0));
    assert_eq!(run.stdout(), "32767\n");
}

#[test]
fn field_width_pads_output() {
    let mut insns = vec![
        Insn::arg16(op::PUSH, 1),
        Insn::arg16(op::PUSH, 42),
        Insn::arg16(op::PUSH, 6),
        Insn::arg16(op::SYSIO, sysio_fn::WRITEINT),
    ];
    insns.extend(halt());
    let run = exec(&insns, &[], "");
    assert_eq!(run.stdout(), "    42");
}

#[test]
fn getenv_reads_the_environment() {
    std::env::set_var("POFF_MACHINE_TEST", "value");
    let insns = [
        Insn::arg16(op::PUSH, 1),
        Insn::arg16(op::LAC, 0),
        Insn::arg16(op::PUSH, 17),
        Insn::arg16(op::LIB, lib_fn::GETENV),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::WRITESTRING),
        Insn::arg16(op::PUSH, 0),
        Insn::bare(op::END),
    ];
    let run = exec(&insns, b"POFF_MACHINE_TEST\0", "");
    assert_eq!(run.result, Ok(0));
    assert_eq!(run.stdout(), "value");
}

#[test]
fn multiword_and_long_transfers() {
    // Store a long, copy it twice (frame-relative and indirect multiword
    // transfers), then sum pieces of all three copies.
    let mut insns = vec![
        Insn::arg16(op::INDS, 12),
        // long 0x0002_0001 at spb+6
        Insn::arg16(op::PUSH, 1),
        Insn::arg16(op::PUSH, 2),
        Insn::arg16(op::STH, 6),
        // copy to spb+10 via ldm/stm
        Insn::arg16(op::PUSH, 4),
        Insn::arg16(op::LDM, 6),
        Insn::arg16(op::PUSH, 4),
        Insn::arg16(op::STM, 10),
        // copy to spb+14 via ldim/stim
        Insn::arg16(op::LA, 14),
        Insn::arg16(op::LA, 6),
        Insn::arg16(op::PUSH, 4),
        Insn::bare(op::LDIM),
        Insn::arg16(op::PUSH, 4),
        Insn::bare(op::STIM),
        // (1 + 2) + 2 + 2 = 7
        Insn::arg16(op::LDH, 10),
        Insn::bare(op::ADD),
        Insn::arg16(op::LD, 8),
        Insn::bare(op::ADD),
        Insn::arg16(op::LD, 16),
        Insn::bare(op::ADD),
        Insn::arg16(op::ST, 6),
    ];
    insns.extend(write_int_and_newline(&[Insn::arg16(op::LD, 6)]));
    insns.extend(halt());
    let run = exec(&insns, &[], "");
    assert_eq!(run.result, Ok(0));
    assert_eq!(run.stdout(), "7\n");
}

#[test]
fn disk_file_round_trip() {
    let path = std::env::temp_dir().join("poff_machine_test_file.txt");
    let name = path.to_str().unwrap().as_bytes().to_vec();
    let _ = std::fs::remove_file(&path);

    let f = 6u16; // file number variable
    let v = 8u16; // integer variable
    let name_len = name.len() as u16;
    let mut insns = vec![
        Insn::arg16(op::INDS, 4),
        Insn::arg16(op::SYSIO, sysio_fn::ALLOCFILE),
        Insn::arg16(op::ST, f),
        // assign(f, text, name); rewrite(f)
        Insn::arg16(op::LD, f),
        Insn::arg16(op::PUSH, 1),
        Insn::arg16(op::LAC, 0),
        Insn::arg16(op::PUSH, name_len),
        Insn::arg16(op::SYSIO, sysio_fn::ASSIGNFILE),
        Insn::arg16(op::LD, f),
        Insn::arg16(op::PUSH, 2),
        Insn::arg16(op::SYSIO, sysio_fn::OPENFILE),
        // write(f, 9, ' ', 8); writeln(f)
        Insn::arg16(op::LD, f),
        Insn::arg16(op::PUSH, 9),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::WRITEINT),
        Insn::arg16(op::LD, f),
        Insn::arg8(op::PUSHB, b' '.into()),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::WRITECHAR),
        Insn::arg16(op::LD, f),
        Insn::arg16(op::PUSH, 8),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::WRITEINT),
        Insn::arg16(op::LD, f),
        Insn::arg8(op::PUSHB, b'\n'.into()),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::WRITECHAR),
        Insn::arg16(op::LD, f),
        Insn::arg16(op::SYSIO, sysio_fn::CLOSEFILE),
        // reset(f)
        Insn::arg16(op::LD, f),
        Insn::arg16(op::PUSH, 1),
        Insn::arg16(op::SYSIO, sysio_fn::OPENFILE),
    ];
    // write(filesize(f)) -> 4 bytes of "9 8\n"
    insns.extend(write_int_and_newline(&[
        Insn::arg16(op::LD, f),
        Insn::arg16(op::SYSIO, sysio_fn::FILESIZE),
        Insn::arg16(op::INDS, 0xFFFE), // drop the high word
    ]));
    // read(f, v); write(v) twice
    for _ in 0..2 {
        insns.extend_from_slice(&[
            Insn::arg16(op::LD, f),
            Insn::arg16(op::LA, v),
            Insn::arg16(op::SYSIO, sysio_fn::READINT),
        ]);
        insns.extend(write_int_and_newline(&[Insn::arg16(op::LD, v)]));
    }
    // seek(f, 2); read(f, v); write(v) -> the second token again
    insns.extend_from_slice(&[
        Insn::arg16(op::LD, f),
        Insn::arg16(op::PUSH, 2),
        Insn::arg16(op::PUSH, 0),
        Insn::arg16(op::SYSIO, sysio_fn::SEEK),
        Insn::arg16(op::LD, f),
        Insn::arg16(op::LA, v),
        Insn::arg16(op::SYSIO, sysio_fn::READINT),
    ]);
    insns.extend(write_int_and_newline(&[Insn::arg16(op::LD, v)]));
    insns.extend_from_slice(&[
        Insn::arg16(op::LD, f),
        Insn::arg16(op::SYSIO, sysio_fn::FREEFILE),
    ]);
    insns.extend(halt());

    let run = exec(&insns, &name, "");
    assert_eq!(run.result, Ok(0));
    assert_eq!(run.stdout(), "4\n9\n8\n8\n");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn too_many_files_is_reported() {
    // The table holds 16 slots and two are the standard streams.
    let mut insns = Vec::new();
    for _ in 0..15 {
        insns.push(Insn::arg16(op::SYSIO, sysio_fn::ALLOCFILE));
    }
    let run = exec(&insns, &[], "");
    assert_eq!(run.result.unwrap_err().trap, Trap::TooManyFiles);
}

#[test]
fn unimplemented_library_calls_surface_not_yet() {
    let run = exec(&[Insn::arg16(op::LIB, lib_fn::SSTRDUP)], &[], "");
    assert_eq!(run.result.unwrap_err().trap, Trap::NotYet);
}
