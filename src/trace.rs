//! Execution tracing hooks.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::MachError;
use crate::machine::Mach;
use crate::opcode::Op;

/**

Observes machine execution when a program is run with [`Mach::trace`].

All hooks default to no-ops so a tracer implements only what it cares
about. A single tracer instance observes an entire machine family: `queue`
fires when a machine replicates, and `begin`/`end` bracket each machine's
turn on the run loop.

*/
pub trait Tracer {
  /// A machine is about to start (or resume, after a dequeue) running.
  fn begin(&mut self, _m: &Mach) {}

  /// `op`, decoded at `ip`, is about to execute.
  fn before(&mut self, _m: &Mach, _ip: u32, _op: Op) {}

  /// `op` executed without fault; `m` reflects its effects.
  fn after(&mut self, _m: &Mach, _ip: u32, _op: Op) {}

  /// `child`, replicated from `parent`, was placed on the run queue.
  fn queue(&mut self, _parent: &Mach, _child: &Mach) {}

  /// `m` reached a terminal state.
  fn end(&mut self, _m: &Mach) {}

  /// The context handler disposed of terminal machine `m` with `result`.
  fn handle(&mut self, _m: &Mach, _result: &Result<(), MachError>) {}
}

pub type TracerRef = Rc<RefCell<dyn Tracer>>;
