/*!

  The fault taxonomy. Every way a machine can stop is a value of `MachError`;
  the library never panics on program misbehavior. Two variants are not faults
  at all: `Halted` is the internal terminal state left by the halt operations
  (the exit code lives in the machine's top-of-stack register), and `Halt(n)`
  is the distinguishable per-code error value that `Mach::error` surfaces for
  nonzero exit codes.

  Faults are fatal to the machine that raised them and are never retried.
  Resource faults (`RunQueueFull`, `NoQueue`, `CopyLimit`, `OpLimit`) are
  recoverable at the family level: the handler still sees the dead machine,
  and other queued machines still run.

*/

use std::fmt::{self, Display, Formatter};

use thiserror::Error;

/// Which of the two stacks a range fault names.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Stack {
  Param,
  Control,
}

impl Display for Stack {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Stack::Param => write!(f, "param"),
      Stack::Control => write!(f, "control"),
    }
  }
}

/// Which direction a stack pointer escaped.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RangeFault {
  Overflow,
  Underflow,
}

impl Display for RangeFault {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      RangeFault::Overflow => write!(f, "overflow"),
      RangeFault::Underflow => write!(f, "underflow"),
    }
  }
}

/// The memory access a misalignment fault names.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MemOp {
  Fetch,
  Store,
}

impl Display for MemOp {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      MemOp::Fetch => write!(f, "fetch"),
      MemOp::Store => write!(f, "store"),
    }
  }
}

/// Everything that can terminate a machine or fail a build.
#[derive(Clone, Eq, PartialEq, Debug, Error)]
pub enum MachError {
  // Terminations that are not faults.
  #[error("halted")]
  Halted,
  #[error("HALT({0})")]
  Halt(u32),
  #[error("crashed")]
  Crashed,

  // Decode faults.
  #[error("invalid IP")]
  InvalidIp,
  #[error("varcode argument too big")]
  VarcodeTooBig,
  #[error("invalid op code {code:#04x}")]
  InvalidOp { code: u8 },
  #[error("unexpected immediate argument {arg:#06x} for {name:?} op")]
  UnexpectedImm { name: &'static str, arg: u32 },
  #[error("missing immediate argument for {name:?} op")]
  MissingImm { name: &'static str },

  // Stack faults.
  #[error("{stack} stack {kind}")]
  StackRange { stack: Stack, kind: RangeFault },

  // Memory faults.
  #[error("segfault")]
  Segfault,
  #[error("unaligned memory {op} @{addr:#06x}")]
  Unaligned { op: MemOp, addr: u32 },
  #[error("division by zero")]
  DivideByZero,

  // Resource faults.
  #[error("run queue full")]
  RunQueueFull,
  #[error("no queue, cannot copy")]
  NoQueue,
  #[error("machine copy limit exceeded")]
  CopyLimit,
  #[error("op count limit exceeded")]
  OpLimit,

  /// A fault wrapped with the address it was raised at.
  #[error("@{addr:#06x}: {cause}")]
  At { addr: u32, cause: Box<MachError> },

  // Program-load failures.
  #[error("truncated options")]
  TruncatedOptions,
  #[error("truncated string")]
  TruncatedString,
  #[error("truncated varint")]
  TruncatedVarint,
  #[error("varint too big")]
  BigVarint,
  #[error("no such operation {0:?}")]
  NoSuchOp(String),
  #[error("no such option {0:?}")]
  NoSuchOption(String),
  #[error("operation does not accept an argument")]
  NoArg,
  #[error("unsupported machine version {0}")]
  BadVersion(u32),
  #[error("invalid stack size {0:#06x}")]
  BadStackSize(u32),
  #[error("unpaired {0} option")]
  UnpairedRegion(&'static str),
  #[error("invalid option code={code:#04x} have={have} arg={arg:#x}")]
  BadOption { code: u8, have: bool, arg: u32 },
  #[error("bad label: {0}")]
  BadLabel(Box<MachError>),
  #[error("undefined input {0:?}")]
  NoSuchInput(String),
  #[error("too many input values: max is {max}, got {got}")]
  InputTooLong { max: u32, got: usize },
  #[error("invalid control stack length {0}")]
  OddOutputPairs(usize),

  /// A handler's own reason for refusing further results.
  #[error("{0}")]
  Stopped(String),
}

impl MachError {
  /// Wraps a fault with the address it was raised at, unless it already
  /// carries one.
  pub fn at(self, addr: u32) -> MachError {
    match self {
      MachError::At { .. } => self,
      cause => MachError::At { addr, cause: Box::new(cause) },
    }
  }

  /// The underlying fault, with any address wrapper stripped.
  pub fn cause(&self) -> &MachError {
    match self {
      MachError::At { cause, .. } => cause,
      other => other,
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn messages() {
    let e = MachError::StackRange { stack: Stack::Param, kind: RangeFault::Underflow };
    assert_eq!(e.to_string(), "param stack underflow");
    let e = MachError::Unaligned { op: MemOp::Store, addr: 0x42 };
    assert_eq!(e.to_string(), "unaligned memory store @0x0042");
    assert_eq!(MachError::Halt(3).to_string(), "HALT(3)");
  }

  #[test]
  fn at_wraps_once() {
    let e = MachError::Segfault.at(0x40).at(0x50);
    assert_eq!(e, MachError::Segfault.at(0x40));
    assert_eq!(e.to_string(), "@0x0040: segfault");
    assert_eq!(*e.cause(), MachError::Segfault);
  }
}
