//! Single-machine execution: arithmetic, stacks, memory, halts, faults.

mod common;

use common::Asm;
use forkvm::error::{MemOp, RangeFault, Stack};
use forkvm::{Mach, MachBuilder, MachError};

#[test]
fn add_then_compare_halts_clean() {
  let prog = Asm::new()
    .op("push", 2)
    .op("push", 3)
    .op0("add")
    .op("push", 5)
    .op0("eq")
    .op("hz", 3)
    .op("halt", 0)
    .assemble();
  let mut m = Mach::new(&prog).unwrap();
  m.run().unwrap();
  assert_eq!(m.halt_code(), Some(0));
}

#[test]
fn failed_compare_halts_with_its_code() {
  let prog = Asm::new()
    .op("push", 2)
    .op("push", 3)
    .op0("add")
    .op("push", 6)
    .op0("eq")
    .op("hz", 3)
    .op("halt", 0)
    .assemble();
  let mut m = Mach::new(&prog).unwrap();
  let err = m.run().unwrap_err();
  assert_eq!(*err.cause(), MachError::Halt(3));
  assert_eq!(m.halt_code(), Some(3));
}

#[test]
fn declared_outputs_read_back() {
  let prog = Asm::new()
    .output(0x80, 0x88)
    .op("push", 42)
    .op("storeTo", 0x80)
    .op("push", 17)
    .op("storeTo", 0x84)
    .op("halt", 0)
    .assemble();
  let mut m = Mach::new(&prog).unwrap();
  m.run().unwrap();
  assert_eq!(m.values().unwrap(), vec![vec![42, 17]]);
  let outs = m.outputs().unwrap();
  assert_eq!(outs.len(), 1);
  assert_eq!((outs[0].name.as_deref(), outs[0].from, outs[0].to), (None, 0x80, 0x88));
}

#[test]
fn inputs_feed_the_program() {
  let prog = Asm::new()
    .input(0x80, 0x88)
    .output(0x88, 0x8c)
    .op("fetch", 0x80)
    .op("fetch", 0x84)
    .op0("add")
    .op("storeTo", 0x88)
    .op("halt", 0)
    .assemble();
  let mut mb = MachBuilder::new(&prog).unwrap();
  mb.input(&[3, 4]).unwrap();
  let mut m = mb.build();
  m.run().unwrap();
  assert_eq!(m.values().unwrap(), vec![vec![7]]);
}

#[test]
fn halt_pairs_become_output_regions() {
  let prog = Asm::new()
    .op("push", 42)
    .op("storeTo", 0x80)
    .op("push", 17)
    .op("storeTo", 0x84)
    .op("cpush", 0x80)
    .op("cpush", 0x88)
    .op("halt", 0)
    .assemble();
  let mut m = Mach::new(&prog).unwrap();
  m.run().unwrap();
  assert_eq!(m.values().unwrap(), vec![vec![42, 17]]);
}

#[test]
fn lone_halt_pair_entry_is_an_error() {
  let prog = Asm::new().op("cpush", 0x80).op("halt", 0).assemble();
  let mut m = Mach::new(&prog).unwrap();
  m.run().unwrap();
  assert_eq!(m.values(), Err(MachError::OddOutputPairs(1)));
}

#[test]
fn named_outputs_resolve() {
  // The program writes its own region name, "x", at 0x100.
  let prog = Asm::new()
    .output_named(0x80, 0x84, 0x100)
    .op("push", 1)
    .op("storeTo", 0x100)
    .op("push", 0x78)
    .op("storeTo", 0x104)
    .op("push", 42)
    .op("storeTo", 0x80)
    .op("halt", 0)
    .assemble();
  let mut m = Mach::new(&prog).unwrap();
  m.run().unwrap();
  let named = m.named_values().unwrap();
  assert_eq!(named.get("x"), Some(&vec![42]));
}

#[test]
fn op_limit_stops_a_loop() {
  let prog = Asm::new()
    .max_ops(100)
    .label("loop")
    .op("push", 1)
    .op0("pop")
    .refer("jump", "loop")
    .op("halt", 0)
    .assemble();
  let mut m = Mach::new(&prog).unwrap();
  let err = m.run().unwrap_err();
  assert_eq!(*err.cause(), MachError::OpLimit);
  assert_eq!(m.op_count(), 100);
}

#[test]
fn calls_return_through_the_control_stack() {
  let prog = Asm::new()
    .op("push", 2)
    .op("push", 3)
    .refer("call", "fn")
    .op("hnz", 0)
    .op("halt", 7)
    .label("fn")
    .op0("add")
    .op("push", 5)
    .op0("neq")
    .op0("ret")
    .assemble();
  let mut m = Mach::new(&prog).unwrap();
  // 2 + 3 == 5, so neq leaves 0 and hnz falls through to HALT(7).
  let err = m.run().unwrap_err();
  assert_eq!(*err.cause(), MachError::Halt(7));
}

#[test]
fn loop_via_control_stack_target() {
  // A bare jnz pops its target from the control stack; the target stays
  // for the next iteration only because we re-push it each time around.
  let prog = Asm::new()
    .output(0x80, 0x84)
    .op("push", 5)
    .label("loop")
    .op0("dup")
    .op("fetch", 0x80)
    .op0("add")
    .op("storeTo", 0x80)
    .op("sub", 1)
    .op0("dup")
    .refer("cpush", "loop")
    .op0("jnz")
    .op0("cpop")
    .op0("pop")
    .op("halt", 0)
    .assemble();
  let mut m = Mach::new(&prog).unwrap();
  m.run().unwrap();
  assert_eq!(m.values().unwrap(), vec![vec![15]]);
}

#[test]
fn countdown_loop_with_jnz() {
  // acc at 0x80; counts 5,4,3,2,1 summed = 15.
  let prog = Asm::new()
    .output(0x80, 0x84)
    .op("push", 5)
    .label("loop")
    .op0("dup")
    .op("fetch", 0x80)
    .op0("add")
    .op("storeTo", 0x80)
    .op("sub", 1)
    .op0("dup")
    .refer("jnz", "loop")
    .op0("pop")
    .op("halt", 0)
    .assemble();
  let mut m = Mach::new(&prog).unwrap();
  m.run().unwrap();
  assert_eq!(m.values().unwrap(), vec![vec![15]]);
}

#[test]
fn modulo_is_euclidean() {
  let prog = Asm::new()
    .output(0x80, 0x84)
    .op("push", (-7i32) as u32)
    .op("mod", 3)
    .op("storeTo", 0x80)
    .op("halt", 0)
    .assemble();
  let mut m = Mach::new(&prog).unwrap();
  m.run().unwrap();
  assert_eq!(m.values().unwrap(), vec![vec![2]]);
}

#[test]
fn division_by_zero_faults() {
  let prog = Asm::new().op("push", 1).op("div", 0).op("halt", 0).assemble();
  let mut m = Mach::new(&prog).unwrap();
  let err = m.run().unwrap_err();
  assert_eq!(*err.cause(), MachError::DivideByZero);
}

#[test]
fn unaligned_stack_store_faults() {
  let prog = Asm::new().op("push", 1).op("storeTo", 0x0e).op("halt", 0).assemble();
  let mut m = Mach::new(&prog).unwrap();
  let err = m.run().unwrap_err();
  assert_eq!(*err.cause(), MachError::Unaligned { op: MemOp::Store, addr: 0x0e });
}

#[test]
fn calls_into_the_stack_region_segfault() {
  let prog = Asm::new().op("call", 0x20).op("halt", 0).assemble();
  let mut m = Mach::new(&prog).unwrap();
  let err = m.run().unwrap_err();
  assert_eq!(*err.cause(), MachError::Segfault);
}

#[test]
fn popping_an_empty_stack_underflows() {
  let prog = Asm::new().op0("pop").op("halt", 0).assemble();
  let mut m = Mach::new(&prog).unwrap();
  let err = m.run().unwrap_err();
  assert_eq!(
    *err.cause(),
    MachError::StackRange { stack: Stack::Param, kind: RangeFault::Underflow }
  );
}

#[test]
fn uninitialized_memory_crashes() {
  // Fall off the end of the program into zeroed memory.
  let prog = Asm::new().op("push", 1).op0("pop").assemble();
  let mut m = Mach::new(&prog).unwrap();
  let err = m.run().unwrap_err();
  assert_eq!(*err.cause(), MachError::Crashed);
}

#[test]
fn shuffle_ops_rearrange_the_stack() {
  let prog = Asm::new()
    .output(0x80, 0x8c)
    .op("push", 1)
    .op("push", 2)
    .op("push", 3)
    .op0("swap") // 1 3 2
    .op("dup", 3) // 1 3 2 1
    .op("storeTo", 0x88)
    .op("storeTo", 0x84)
    .op("storeTo", 0x80)
    .op("halt", 0)
    .assemble();
  let mut m = Mach::new(&prog).unwrap();
  m.run().unwrap();
  assert_eq!(m.values().unwrap(), vec![vec![3, 2, 1]]);
}

#[test]
fn stacks_survive_a_round_trip_through_control() {
  let prog = Asm::new()
    .op("push", 11)
    .op("push", 22)
    .op("p2c", 2)
    .op("c2p", 1)
    .op("push", 0) // spill the returned 11, since halt clobbers the register
    .op("halt", 0)
    .assemble();
  let mut m = Mach::new(&prog).unwrap();
  m.run().unwrap();
  let (ps, cs) = m.stacks().unwrap();
  // p2c moved 22 then 11 over; c2p brought 11 back; the top is halt's code.
  assert_eq!(ps, vec![11, 0]);
  assert_eq!(cs, vec![22]);
}

#[test]
fn step_is_idempotent_after_halt() {
  let prog = Asm::new().op("push", 9).op("halt", 0).assemble();
  let mut m = Mach::new(&prog).unwrap();
  assert!(m.step().is_ok());
  assert!(m.step().is_ok());
  // Stepping a halted machine stays halted.
  assert!(m.step().is_ok());
  assert_eq!(m.halt_code(), Some(0));
  assert_eq!(m.op_count(), 0, "no op limit, so no counting");
  // halt parks its code in the top-of-stack register.
  let (ps, _) = m.stacks().unwrap();
  assert_eq!(ps, vec![0]);
}
