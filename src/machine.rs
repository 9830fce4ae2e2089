/*!

The machine itself: registers, dual stacks, paged memory, the stepping
loop, and replication.

# Layout

A machine's address space starts with its stack region `[0, stacksize)`.
The parameter stack grows up from address zero; the control stack grows
down from the top of the region; program text is loaded immediately after,
at `cbp + 4`, and data lives wherever the program puts it.

The top of the parameter stack is cached in the `pa` register and only
spilled to memory when something is pushed on top of it. An empty
parameter stack is encoded by the `PSP_EMPTY` sentinel, four below zero in
wrapping arithmetic, so the first push lands the pointer back at zero
without spilling.

# Replication

`fork` and `branch` copy the running machine. Copies share pages by
reference count; the first store into a shared page copies just that page.
Copies also share the decode cache, so a child never re-decodes text its
ancestors already executed.

*/

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::mem;
use std::rc::Rc;
use std::sync::Arc;

use tracing::trace;

#[cfg(feature = "trace_execution")]
use prettytable::{format, Table};

use crate::alloc::MachSlot;
use crate::context::Context;
use crate::encoding::MAX_VARCODE_LEN;
use crate::error::{MachError, MemOp, RangeFault, Stack};
use crate::opcode::{decode_op, Op, Opcode};
use crate::page::{Page, PageRef, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use crate::region::{OutputRegion, Region};
use crate::trace::TracerRef;

/// The parameter stack pointer's empty sentinel: four below zero, so that a
/// push from empty wraps the pointer to zero and skips the spill.
pub(crate) const PSP_EMPTY: u32 = 0xffff_fffc;

/// A decoded op plus the address immediately after its encoding.
#[derive(Copy, Clone)]
pub(crate) struct CachedOp {
  end: u32,
  op: Op,
}

/// Decode results keyed by `ip - cbp`. Shared by every machine in a family:
/// text pages are never written, so one decode serves all copies.
#[derive(Default)]
pub(crate) struct OpCache {
  cos: Vec<Option<CachedOp>>,
}

impl OpCache {
  pub(crate) fn with_len(n: usize) -> OpCache {
    OpCache { cos: vec![None; n] }
  }

  fn get(&self, k: u32) -> Option<CachedOp> {
    self.cos.get(k as usize).copied().flatten()
  }

  fn set(&mut self, k: u32, co: CachedOp) {
    let k = k as usize;
    if k >= self.cos.len() {
      self.cos.resize(k + 1, None);
    }
    self.cos[k] = Some(co);
  }
}

pub struct Mach {
  pub(crate) ctx: Rc<Context>,
  pub(crate) opc: Rc<RefCell<OpCache>>,
  pub(crate) err: Option<MachError>,
  pub(crate) ip: u32,
  pub(crate) pbp: u32,
  pub(crate) psp: u32,
  pub(crate) pa: u32,
  pub(crate) cbp: u32,
  pub(crate) csp: u32,
  pub(crate) count: u32,
  pub(crate) limit: u32,
  pub(crate) pages: Vec<Option<PageRef>>,
}

impl Mach {
  /// Loads and validates an encoded program. Equivalent to
  /// `MachBuilder::new(prog)?.build()`.
  pub fn new(prog: &[u8]) -> Result<Mach, MachError> {
    Ok(crate::builder::MachBuilder::new(prog)?.build())
  }

  /// A bare machine with no program, no stack region, and a context that
  /// refuses replication.
  pub(crate) fn unloaded() -> Mach {
    Mach {
      ctx: Rc::new(Context::unscheduled(Vec::new())),
      opc: Rc::new(RefCell::new(OpCache::default())),
      err: None,
      ip: 0,
      pbp: 0,
      psp: PSP_EMPTY,
      pa: 0,
      cbp: 0,
      csp: 0,
      count: 0,
      limit: 0,
      pages: Vec::new(),
    }
  }

  pub fn ip(&self) -> u32 {
    self.ip
  }

  /// Operations executed so far.
  pub fn op_count(&self) -> u32 {
    self.count
  }

  /// The exit code, if the machine stopped at a halt operation.
  pub fn halt_code(&self) -> Option<u32> {
    match &self.err {
      Some(MachError::Halted) => Some(self.pa),
      _ => None,
    }
  }

  /**
    The machine's terminal status. `None` while it can still step and after
    a clean `HALT(0)`; a nonzero halt surfaces as [`MachError::Halt`]. All
    errors come wrapped with the address they were raised at.
  */
  pub fn error(&self) -> Option<MachError> {
    match &self.err {
      None => None,
      Some(MachError::Halted) => match self.pa {
        0 => None,
        code => Some(MachError::Halt(code).at(self.ip)),
      },
      Some(err) => Some(err.clone().at(self.ip)),
    }
  }

  pub fn result(&self) -> Result<(), MachError> {
    match self.error() {
      None => Ok(()),
      Some(err) => Err(err),
    }
  }

  /**
    Runs the machine family to completion. Whenever a machine reaches a
    terminal state its context handler disposes of it; while the handler
    keeps returning `Ok` the loop pulls the next queued machine into this
    slot and keeps going. The first handler error stops the family and
    releases any machines still queued.
  */
  pub fn run(&mut self) -> Result<(), MachError> {
    loop {
      while self.err.is_none() {
        self.advance();
      }
      trace!(ip = self.ip, count = self.count, "terminal machine");
      let ctx = Rc::clone(&self.ctx);
      let res = ctx.handle(self);
      if res.is_ok() {
        if let Some(next) = ctx.dequeue() {
          let prev = mem::replace(self, next);
          prev.release();
          continue;
        }
      } else {
        self.drain_queue();
      }
      return res;
    }
  }

  /**
    Runs the machine family under a tracer, firing `before`/`after` around
    every operation. Installs `t` on the shared context so that `queue`
    events fire too, and uninstalls it when the family finishes; the install
    is idempotent, so resuming a trace with the same tracer is fine.
  */
  pub fn trace(&mut self, t: TracerRef) -> Result<(), MachError> {
    self.ctx.install_tracer(Rc::clone(&t));
    loop {
      t.borrow_mut().begin(self);
      while self.err.is_none() {
        let ip = self.ip;
        let co = match self.decode_cached() {
          Ok(co) => co,
          Err(err) => {
            self.err = Some(err);
            break;
          }
        };
        t.borrow_mut().before(self, ip, co.op);
        self.advance();
        if self.err.is_none() {
          t.borrow_mut().after(self, ip, co.op);
        }
      }
      t.borrow_mut().end(self);
      let ctx = Rc::clone(&self.ctx);
      let res = ctx.handle(self);
      t.borrow_mut().handle(self, &res);
      if res.is_ok() {
        if let Some(next) = ctx.dequeue() {
          let prev = mem::replace(self, next);
          prev.release();
          continue;
        }
      } else {
        self.drain_queue();
      }
      self.ctx.remove_tracer();
      return res;
    }
  }

  /**
    Executes one operation if the machine is still running, then reports its
    status. Note that single-stepping bypasses the run loop's disposal of
    queued machines; call `run` (or drop the machine and every queued copy)
    to finish a family that has forked.
  */
  pub fn step(&mut self) -> Result<(), MachError> {
    if self.err.is_none() {
      self.advance();
    }
    self.result()
  }

  fn drain_queue(&self) {
    while let Some(n) = self.ctx.dequeue() {
      n.release();
    }
  }

  /// Returns this record's buffers to the context allocators.
  pub(crate) fn release(mut self) {
    let ctx = Rc::clone(&self.ctx);
    let mut pages = mem::replace(&mut self.pages, Vec::new());
    for pg in pages.drain(..) {
      if let Some(pg) = pg {
        ctx.free_page(pg);
      }
    }
    ctx.free_mach(MachSlot { pages });
  }

  fn advance(&mut self) {
    if self.limit != 0 {
      if self.count >= self.limit {
        self.err = Some(MachError::OpLimit);
        return;
      }
      self.count += 1;
    }
    match self.decode_cached() {
      Err(err) => self.err = Some(err),
      Ok(co) => {
        self.ip = co.end;
        if let Err(err) = self.exec(co.op) {
          self.err = Some(err);
        }
      }
    }
  }

  fn decode_cached(&mut self) -> Result<CachedOp, MachError> {
    let k = self.ip.wrapping_sub(self.cbp);
    if let Some(co) = self.opc.borrow().get(k) {
      return Ok(co);
    }
    let mut bs = [0u8; MAX_VARCODE_LEN];
    self.fetch_bytes(self.ip, &mut bs);
    let (len, op) = decode_op(&bs)?;
    let co = CachedOp { end: self.ip.wrapping_add(len as u32), op };
    self.opc.borrow_mut().set(k, co);
    Ok(co)
  }

  fn exec(&mut self, op: Op) -> Result<(), MachError> {
    use Opcode::*;
    match (op.code, op.have) {
      (Crash, _) => Err(MachError::Crashed),
      (Nop, _) => Ok(()),

      (Push, false) => self.push(0),
      (Push, true) => self.push(op.arg),
      (Pop, false) => self.drop_one(),
      (Pop, true) => {
        for _ in 0..op.arg {
          self.drop_one()?;
        }
        Ok(())
      }
      (Dup, false) => {
        let v = self.p_get(1)?;
        self.push(v)
      }
      (Dup, true) => {
        let v = self.p_get(op.arg.max(1))?;
        self.push(v)
      }
      (Swap, false) => self.swap(2),
      (Swap, true) => self.swap(op.arg.wrapping_add(1)),

      (Fetch, false) => {
        let addr = self.pop()?;
        let v = self.fetch(addr)?;
        self.push(v)
      }
      (Fetch, true) => {
        let v = self.fetch(op.arg)?;
        self.push(v)
      }
      (Store, false) => {
        let val = self.pop()?;
        let addr = self.pop()?;
        self.store(addr, val)
      }
      (Store, true) => {
        let addr = self.pop()?;
        self.store(addr, op.arg)
      }
      (StoreTo, false) => {
        let addr = self.pop()?;
        let val = self.pop()?;
        self.store(addr, val)
      }
      (StoreTo, true) => {
        let val = self.pop()?;
        self.store(op.arg, val)
      }

      (Neg, _) => {
        let a = self.p_get(1)?;
        self.pa = a.wrapping_neg();
        Ok(())
      }
      (Add, false) => self.binop(|a, b| Ok(a.wrapping_add(b))),
      (Add, true) => self.binop_imm(op.arg, |a, b| Ok(a.wrapping_add(b))),
      (Sub, false) => self.binop(|a, b| Ok(a.wrapping_sub(b))),
      (Sub, true) => self.binop_imm(op.arg, |a, b| Ok(a.wrapping_sub(b))),
      (Mul, false) => self.binop(|a, b| Ok(a.wrapping_mul(b))),
      (Mul, true) => self.binop_imm(op.arg, |a, b| Ok(a.wrapping_mul(b))),
      (Div, false) => self.binop(sdiv),
      (Div, true) => self.binop_imm(op.arg, sdiv),
      (Mod, false) => self.binop(smod),
      (Mod, true) => self.binop_imm(op.arg, smod),
      (Divmod, false) => {
        let b = self.p_get(1)?;
        let a = self.p_get(2)?;
        let q = sdiv(a, b)?;
        let r = smod(a, b)?;
        self.p_set(2, q)?;
        self.pa = r;
        Ok(())
      }
      (Divmod, true) => {
        let a = self.p_get(1)?;
        let q = sdiv(a, op.arg)?;
        let r = smod(a, op.arg)?;
        self.pa = q;
        self.push(r)
      }

      (Lt, false) => self.binop(|a, b| Ok((a < b) as u32)),
      (Lt, true) => self.binop_imm(op.arg, |a, b| Ok((a < b) as u32)),
      (Lte, false) => self.binop(|a, b| Ok((a <= b) as u32)),
      (Lte, true) => self.binop_imm(op.arg, |a, b| Ok((a <= b) as u32)),
      (Eq, false) => self.binop(|a, b| Ok((a == b) as u32)),
      (Eq, true) => self.binop_imm(op.arg, |a, b| Ok((a == b) as u32)),
      (Neq, false) => self.binop(|a, b| Ok((a != b) as u32)),
      (Neq, true) => self.binop_imm(op.arg, |a, b| Ok((a != b) as u32)),
      (Gt, false) => self.binop(|a, b| Ok((a > b) as u32)),
      (Gt, true) => self.binop_imm(op.arg, |a, b| Ok((a > b) as u32)),
      (Gte, false) => self.binop(|a, b| Ok((a >= b) as u32)),
      (Gte, true) => self.binop_imm(op.arg, |a, b| Ok((a >= b) as u32)),
      (Not, _) => {
        let a = self.p_get(1)?;
        self.pa = (a == 0) as u32;
        Ok(())
      }
      (And, false) => self.binop(|a, b| Ok((a != 0 && b != 0) as u32)),
      (And, true) => self.binop_imm(op.arg, |a, b| Ok((a != 0 && b != 0) as u32)),
      (Or, false) => self.binop(|a, b| Ok((a != 0 || b != 0) as u32)),
      (Or, true) => self.binop_imm(op.arg, |a, b| Ok((a != 0 || b != 0) as u32)),

      (Bitnot, _) => {
        let a = self.p_get(1)?;
        self.pa = !a;
        Ok(())
      }
      (Bitand, false) => self.binop(|a, b| Ok(a & b)),
      (Bitand, true) => self.binop_imm(op.arg, |a, b| Ok(a & b)),
      (Bitor, false) => self.binop(|a, b| Ok(a | b)),
      (Bitor, true) => self.binop_imm(op.arg, |a, b| Ok(a | b)),
      (Bitxor, false) => self.binop(|a, b| Ok(a ^ b)),
      (Bitxor, true) => self.binop_imm(op.arg, |a, b| Ok(a ^ b)),
      (Shiftl, false) => self.binop(|a, b| Ok(shl(a, b))),
      (Shiftl, true) => self.binop_imm(op.arg, |a, b| Ok(shl(a, b))),
      (Shiftr, false) => self.binop(|a, b| Ok(shr(a, b))),
      (Shiftr, true) => self.binop_imm(op.arg, |a, b| Ok(shr(a, b))),

      (Bitest, false) => {
        let addr = self.pop()?;
        self.bitest(addr)
      }
      (Bitest, true) => self.bitest(op.arg),
      (Bitset, false) => {
        let addr = self.pop()?;
        let n = self.pop()?;
        self.bitmod(addr, n, true)
      }
      (Bitset, true) => {
        let n = self.pop()?;
        self.bitmod(op.arg, n, true)
      }
      (Bitost, false) => {
        let addr = self.pop()?;
        let n = self.pop()?;
        self.bitmod(addr, n, false)
      }
      (Bitost, true) => {
        let n = self.pop()?;
        self.bitmod(op.arg, n, false)
      }
      (Bitseta, false) => {
        let addr = self.pop()?;
        self.bitmoda(addr, true)
      }
      (Bitseta, true) => self.bitmoda(op.arg, true),
      (Bitosta, false) => {
        let addr = self.pop()?;
        self.bitmoda(addr, false)
      }
      (Bitosta, true) => self.bitmoda(op.arg, false),

      (Mark, _) => {
        let ip = self.ip;
        self.cpush(ip)
      }
      (Cpush, true) => self.cpush(op.arg),
      (Cpush, false) => Err(MachError::MissingImm { name: op.code.name() }),
      (Cpop, false) => self.cpop().map(|_| ()),
      (Cpop, true) => {
        for _ in 0..op.arg {
          self.cpop()?;
        }
        Ok(())
      }
      (P2c, false) => {
        let v = self.pop()?;
        self.cpush(v)
      }
      (P2c, true) => {
        for _ in 0..op.arg {
          let v = self.pop()?;
          self.cpush(v)?;
        }
        Ok(())
      }
      (C2p, false) => {
        let v = self.cpop()?;
        self.push(v)
      }
      (C2p, true) => {
        for _ in 0..op.arg {
          let v = self.cpop()?;
          self.push(v)?;
        }
        Ok(())
      }

      (Jump, false) => {
        let v = self.pop()?;
        self.jump(v as i32)
      }
      (Jump, true) => self.jump(op.arg as i32),
      (Jnz, false) => {
        let v = self.pop()?;
        match v {
          0 => Ok(()),
          _ => self.cjump(),
        }
      }
      (Jnz, true) => {
        let v = self.pop()?;
        match v {
          0 => Ok(()),
          _ => self.jump(op.arg as i32),
        }
      }
      (Jz, false) => {
        let v = self.pop()?;
        match v {
          0 => self.cjump(),
          _ => Ok(()),
        }
      }
      (Jz, true) => {
        let v = self.pop()?;
        match v {
          0 => self.jump(op.arg as i32),
          _ => Ok(()),
        }
      }
      (Call, false) => {
        let v = self.pop()?;
        self.call(v)
      }
      (Call, true) => self.call(op.arg),
      (Ret, _) => self.ret(),

      (Fork, false) => {
        let v = self.pop()?;
        self.fork(v as i32)
      }
      (Fork, true) => self.fork(op.arg as i32),
      (Fnz, false) => {
        let v = self.pop()?;
        match v {
          0 => Ok(()),
          _ => self.cfork(),
        }
      }
      (Fnz, true) => {
        let v = self.pop()?;
        match v {
          0 => Ok(()),
          _ => self.fork(op.arg as i32),
        }
      }
      (Fz, false) => {
        let v = self.pop()?;
        match v {
          0 => self.cfork(),
          _ => Ok(()),
        }
      }
      (Fz, true) => {
        let v = self.pop()?;
        match v {
          0 => self.fork(op.arg as i32),
          _ => Ok(()),
        }
      }
      (Branch, false) => {
        let v = self.pop()?;
        self.branch(v as i32)
      }
      (Branch, true) => self.branch(op.arg as i32),
      (Bnz, false) => {
        let v = self.pop()?;
        match v {
          0 => Ok(()),
          _ => self.cbranch(),
        }
      }
      (Bnz, true) => {
        let v = self.pop()?;
        match v {
          0 => Ok(()),
          _ => self.branch(op.arg as i32),
        }
      }
      (Bz, false) => {
        let v = self.pop()?;
        match v {
          0 => self.cbranch(),
          _ => Ok(()),
        }
      }
      (Bz, true) => {
        let v = self.pop()?;
        match v {
          0 => self.branch(op.arg as i32),
          _ => Ok(()),
        }
      }

      (Halt, _) => {
        self.pa = op.arg;
        Err(MachError::Halted)
      }
      (Hz, _) => {
        let v = self.pop()?;
        match v {
          0 => {
            self.pa = op.arg;
            Err(MachError::Halted)
          }
          _ => Ok(()),
        }
      }
      (Hnz, _) => {
        let v = self.pop()?;
        match v {
          0 => Ok(()),
          _ => {
            self.pa = op.arg;
            Err(MachError::Halted)
          }
        }
      }
    }
  }

  /// Pops the right operand, applies `f` to `(left, popped)`, and leaves
  /// the result on top.
  fn binop<F>(&mut self, f: F) -> Result<(), MachError>
  where
    F: FnOnce(u32, u32) -> Result<u32, MachError>,
  {
    let b = self.pop()?;
    let a = self.p_get(1)?;
    self.pa = f(a, b)?;
    Ok(())
  }

  fn binop_imm<F>(&mut self, arg: u32, f: F) -> Result<(), MachError>
  where
    F: FnOnce(u32, u32) -> Result<u32, MachError>,
  {
    let a = self.p_get(1)?;
    self.pa = f(a, arg)?;
    Ok(())
  }

  fn bitest(&mut self, addr: u32) -> Result<(), MachError> {
    let n = self.p_get(1)?;
    let (wa, bit) = bit_word(addr, n);
    let w = self.fetch(wa)?;
    self.pa = (w >> bit) & 1;
    Ok(())
  }

  /// Sets (`on`) or clears the bit `n` in the vector at `addr`; `n` is
  /// consumed by the caller.
  fn bitmod(&mut self, addr: u32, n: u32, on: bool) -> Result<(), MachError> {
    let (wa, bit) = bit_word(addr, n);
    let w = self.fetch(wa)?;
    let w = match on {
      true => w | (1 << bit),
      false => w & !(1 << bit),
    };
    self.store(wa, w)
  }

  /// Test-and-modify: flips bit `n` (taken from the top of the stack, in
  /// place) toward `on`, leaving 1 if the flip happened and 0 if the bit
  /// was already in the target state... inverted for clears, where 1 means
  /// the bit was set and got cleared.
  fn bitmoda(&mut self, addr: u32, on: bool) -> Result<(), MachError> {
    let n = self.p_get(1)?;
    let (wa, bit) = bit_word(addr, n);
    let mask = 1 << bit;
    let w = self.fetch(wa)?;
    match (w & mask != 0, on) {
      (true, true) => self.pa = 0,
      (false, true) => {
        self.store(wa, w | mask)?;
        self.pa = 1;
      }
      (true, false) => {
        self.store(wa, w & !mask)?;
        self.pa = 1;
      }
      (false, false) => self.pa = 0,
    }
    Ok(())
  }

  // -- parameter stack ----------------------------------------------------

  fn push(&mut self, val: u32) -> Result<(), MachError> {
    let psp = self.psp.wrapping_add(4);
    if psp < PSP_EMPTY && psp > self.csp {
      return Err(MachError::StackRange { stack: Stack::Param, kind: RangeFault::Overflow });
    }
    if psp > 0 {
      self.store(self.psp, self.pa)?;
    }
    self.pa = val;
    self.psp = psp;
    Ok(())
  }

  fn drop_one(&mut self) -> Result<(), MachError> {
    let psp = self.psp.wrapping_sub(4);
    if psp < self.cbp {
      self.pa = self.fetch(psp)?;
    } else if psp < PSP_EMPTY {
      return Err(MachError::StackRange { stack: Stack::Param, kind: RangeFault::Underflow });
    }
    self.psp = psp;
    Ok(())
  }

  fn pop(&mut self) -> Result<u32, MachError> {
    let val = self.p_get(1)?;
    self.drop_one()?;
    Ok(val)
  }

  /// The `i`th element from the top, counting from 1; element 1 is the
  /// cached `pa` register.
  fn p_get(&self, i: u32) -> Result<u32, MachError> {
    if i == 1 {
      return match self.psp {
        PSP_EMPTY => {
          Err(MachError::StackRange { stack: Stack::Param, kind: RangeFault::Underflow })
        }
        _ => Ok(self.pa),
      };
    }
    let addr = self.psp.wrapping_add(4).wrapping_sub(i.wrapping_mul(4));
    if addr < self.pbp || addr > self.csp {
      return Err(MachError::StackRange { stack: Stack::Param, kind: RangeFault::Underflow });
    }
    self.fetch(addr)
  }

  fn p_set(&mut self, i: u32, val: u32) -> Result<(), MachError> {
    if i == 1 {
      return match self.psp {
        PSP_EMPTY => {
          Err(MachError::StackRange { stack: Stack::Param, kind: RangeFault::Underflow })
        }
        _ => {
          self.pa = val;
          Ok(())
        }
      };
    }
    let addr = self.psp.wrapping_add(4).wrapping_sub(i.wrapping_mul(4));
    if addr < self.pbp || addr > self.csp {
      return Err(MachError::StackRange { stack: Stack::Param, kind: RangeFault::Underflow });
    }
    self.store(addr, val)
  }

  fn swap(&mut self, i: u32) -> Result<(), MachError> {
    let v = self.p_get(i)?;
    let top = self.p_get(1)?;
    self.p_set(i, top)?;
    self.pa = v;
    Ok(())
  }

  // -- control stack ------------------------------------------------------

  fn cpush(&mut self, val: u32) -> Result<(), MachError> {
    let csp = self.csp.wrapping_sub(4);
    if (self.psp < self.cbp && csp < self.psp) || csp >= self.cbp {
      return Err(MachError::StackRange { stack: Stack::Control, kind: RangeFault::Overflow });
    }
    self.store(self.csp, val)?;
    self.csp = csp;
    Ok(())
  }

  fn cpop(&mut self) -> Result<u32, MachError> {
    if self.csp >= self.cbp {
      return Err(MachError::StackRange { stack: Stack::Control, kind: RangeFault::Underflow });
    }
    self.csp += 4;
    self.fetch(self.csp)
  }

  // -- control flow -------------------------------------------------------

  /// Redirects the instruction pointer, faulting on any target inside the
  /// stack region.
  fn jump_to(&mut self, ip: u32) -> Result<(), MachError> {
    if ip >= self.pbp && ip <= self.cbp {
      return Err(MachError::Segfault);
    }
    self.ip = ip;
    Ok(())
  }

  fn jump(&mut self, off: i32) -> Result<(), MachError> {
    let ip = self.ip.wrapping_add(off as u32);
    self.jump_to(ip)
  }

  /// Jump to a target popped from the control stack.
  fn cjump(&mut self) -> Result<(), MachError> {
    let ip = self.cpop()?;
    self.jump_to(ip)
  }

  fn call(&mut self, ip: u32) -> Result<(), MachError> {
    if ip >= self.pbp && ip <= self.cbp {
      return Err(MachError::Segfault);
    }
    let ret = self.ip;
    self.cpush(ret)?;
    self.ip = ip;
    Ok(())
  }

  fn ret(&mut self) -> Result<(), MachError> {
    let ip = self.cpop()?;
    self.jump_to(ip)
  }

  // -- replication --------------------------------------------------------

  /// Copies this machine: registers by value, pages by reference, decode
  /// cache shared.
  fn copy(&self) -> Result<Mach, MachError> {
    let slot = self.ctx.alloc_mach()?;
    let mut pages = slot.pages;
    pages.clear();
    pages.extend(self.pages.iter().cloned());
    Ok(Mach {
      ctx: Rc::clone(&self.ctx),
      opc: Rc::clone(&self.opc),
      err: self.err.clone(),
      ip: self.ip,
      pbp: self.pbp,
      psp: self.psp,
      pa: self.pa,
      cbp: self.cbp,
      csp: self.csp,
      count: self.count,
      limit: self.limit,
      pages,
    })
  }

  /// The copy goes to the target; this machine continues after the op.
  fn fork(&mut self, off: i32) -> Result<(), MachError> {
    let ip = self.ip.wrapping_add(off as u32);
    if ip >= self.pbp && ip <= self.cbp {
      return Err(MachError::Segfault);
    }
    let mut n = self.copy()?;
    n.ip = ip;
    let ctx = Rc::clone(&self.ctx);
    ctx.enqueue(self, n)
  }

  /// Like `fork`, but the target comes off the copy's control stack; this
  /// machine keeps its own copy of the target value.
  fn cfork(&mut self) -> Result<(), MachError> {
    let mut n = self.copy()?;
    let ip = n.cpop()?;
    n.jump_to(ip)?;
    let ctx = Rc::clone(&self.ctx);
    ctx.enqueue(self, n)
  }

  /// This machine goes to the target; the copy continues after the op.
  fn branch(&mut self, off: i32) -> Result<(), MachError> {
    let ip = self.ip.wrapping_add(off as u32);
    if ip >= self.pbp && ip <= self.cbp {
      return Err(MachError::Segfault);
    }
    let n = self.copy()?;
    let ctx = Rc::clone(&self.ctx);
    ctx.enqueue(self, n)?;
    self.ip = ip;
    Ok(())
  }

  fn cbranch(&mut self) -> Result<(), MachError> {
    let n = self.copy()?;
    let ip = self.cpop()?;
    let ctx = Rc::clone(&self.ctx);
    ctx.enqueue(self, n)?;
    self.jump_to(ip)
  }

  // -- memory -------------------------------------------------------------

  /**
    Reads the word at `addr`. Word access inside the stack region must be
    4-aligned; at or above `cbp`, unaligned reads gather bytes across page
    boundaries. Unmaterialized memory reads as zero.
  */
  pub fn fetch(&self, addr: u32) -> Result<u32, MachError> {
    if addr < self.cbp && addr & 3 != 0 {
      return Err(MachError::Unaligned { op: MemOp::Fetch, addr });
    }
    let off = (addr & PAGE_MASK) as usize;
    if off + 4 <= PAGE_SIZE {
      let i = (addr >> PAGE_SHIFT) as usize;
      let val = match self.pages.get(i).and_then(|slot| slot.as_ref()) {
        Some(pg) => pg.word(off),
        None => 0,
      };
      return Ok(val);
    }
    let mut bs = [0u8; 4];
    self.fetch_bytes(addr, &mut bs);
    Ok(u32::from_le_bytes(bs))
  }

  fn store(&mut self, addr: u32, val: u32) -> Result<(), MachError> {
    if addr < self.cbp && addr & 3 != 0 {
      return Err(MachError::Unaligned { op: MemOp::Store, addr });
    }
    let off = (addr & PAGE_MASK) as usize;
    if off + 4 <= PAGE_SIZE {
      let i = (addr >> PAGE_SHIFT) as usize;
      self.writable_page(i).set_word(off, val);
      return Ok(());
    }
    self.store_bytes(addr, &val.to_le_bytes());
    Ok(())
  }

  pub(crate) fn fetch_bytes(&self, addr: u32, bs: &mut [u8]) {
    for (n, b) in bs.iter_mut().enumerate() {
      let a = addr.wrapping_add(n as u32);
      let i = (a >> PAGE_SHIFT) as usize;
      let off = (a & PAGE_MASK) as usize;
      *b = match self.pages.get(i).and_then(|slot| slot.as_ref()) {
        Some(pg) => pg.d[off],
        None => 0,
      };
    }
  }

  pub(crate) fn store_bytes(&mut self, addr: u32, bs: &[u8]) {
    let mut n = 0;
    while n < bs.len() {
      let a = addr.wrapping_add(n as u32);
      let i = (a >> PAGE_SHIFT) as usize;
      let off = (a & PAGE_MASK) as usize;
      let take = (PAGE_SIZE - off).min(bs.len() - n);
      let pg = self.writable_page(i);
      pg.d[off..off + take].copy_from_slice(&bs[n..n + take]);
      n += take;
    }
  }

  /**
    An exclusive reference to page `i`, materializing it if absent and
    copying it first if shared with another machine.
  */
  fn writable_page(&mut self, i: usize) -> &mut Page {
    if i >= self.pages.len() {
      self.pages.resize(i + 1, None);
    }
    let fresh = match &self.pages[i] {
      None => Some(self.ctx.alloc_page()),
      Some(pg) if Arc::strong_count(pg) > 1 => {
        let mut npg = self.ctx.alloc_page();
        if let Some(n) = Arc::get_mut(&mut npg) {
          n.d = pg.d;
        }
        Some(npg)
      }
      Some(_) => None,
    };
    if let Some(pg) = fresh {
      self.pages[i] = Some(pg);
    }
    match self.pages[i].as_mut().and_then(Arc::get_mut) {
      Some(page) => page,
      None => unreachable!("page not exclusively held after materialization"),
    }
  }

  // -- inspection ---------------------------------------------------------

  /// The words in `[from, to)`, stepping down when `from > to` so control
  /// stack contents come out bottom-up.
  fn fetch_many(&self, mut from: u32, to: u32) -> Result<Vec<u32>, MachError> {
    let mut vals = Vec::new();
    if from <= to {
      while from < to {
        vals.push(self.fetch(from)?);
        from += 4;
      }
    } else {
      while from > to {
        vals.push(self.fetch(from)?);
        from -= 4;
      }
    }
    Ok(vals)
  }

  fn fetch_ps(&self) -> Result<Vec<u32>, MachError> {
    if self.psp == PSP_EMPTY {
      return Ok(Vec::new());
    }
    if self.psp > self.cbp {
      return Err(MachError::StackRange { stack: Stack::Param, kind: RangeFault::Underflow });
    }
    if self.psp > self.csp {
      return Err(MachError::StackRange { stack: Stack::Param, kind: RangeFault::Overflow });
    }
    let mut vals = self.fetch_many(self.pbp, self.psp)?;
    vals.push(self.pa);
    Ok(vals)
  }

  fn fetch_cs(&self) -> Result<Vec<u32>, MachError> {
    if self.csp == self.cbp {
      return Ok(Vec::new());
    }
    if self.csp > self.cbp {
      return Err(MachError::StackRange { stack: Stack::Control, kind: RangeFault::Underflow });
    }
    if self.csp < self.psp && self.psp < self.cbp {
      return Err(MachError::StackRange { stack: Stack::Control, kind: RangeFault::Overflow });
    }
    self.fetch_many(self.cbp, self.csp)
  }

  /// Both stacks, parameter then control, each bottom-up.
  pub fn stacks(&self) -> Result<(Vec<u32>, Vec<u32>), MachError> {
    Ok((self.fetch_ps()?, self.fetch_cs()?))
  }

  /// A length-prefixed string: a word count of bytes, then the bytes.
  pub(crate) fn fetch_string(&self, addr: u32) -> Result<String, MachError> {
    let n = self.fetch(addr)?;
    let mut bs = vec![0u8; n as usize];
    self.fetch_bytes(addr.wrapping_add(4), &mut bs);
    Ok(String::from_utf8_lossy(&bs).into_owned())
  }

  /**
    The machine's output regions: every region declared by the program,
    plus, after a clean halt, any `[from, to]` pairs left on the control
    stack bottom-up. Errors with the machine's own fault if it did not end
    cleanly.
  */
  fn output_regions(&self) -> Result<Vec<Region>, MachError> {
    let mut done = false;
    if self.err.is_some() {
      match self.halt_code() {
        Some(0) => done = true,
        _ => return self.result().map(|_| Vec::new()),
      }
    }
    let mut outs = self.ctx.outputs().to_vec();
    if done {
      let cs = self.fetch_cs()?;
      if !cs.is_empty() {
        if cs.len() % 2 != 0 {
          return Err(MachError::OddOutputPairs(cs.len()));
        }
        for pair in cs.chunks(2) {
          outs.push(Region { name: 0, from: pair[0], to: pair[1] });
        }
      }
    }
    Ok(outs)
  }

  /// Output regions with their names resolved.
  pub fn outputs(&self) -> Result<Vec<OutputRegion>, MachError> {
    let mut outs = Vec::new();
    for rg in self.output_regions()? {
      let name = match rg.name {
        0 => None,
        addr => Some(self.fetch_string(addr)?),
      };
      outs.push(OutputRegion { name, from: rg.from, to: rg.to });
    }
    Ok(outs)
  }

  /// The words of every output region, in declaration order, halt-pair
  /// regions last.
  pub fn values(&self) -> Result<Vec<Vec<u32>>, MachError> {
    let mut vals = Vec::new();
    for rg in self.output_regions()? {
      vals.push(self.fetch_many(rg.from, rg.to)?);
    }
    Ok(vals)
  }

  /// The words of every output region keyed by name; positions stand in
  /// for missing names.
  pub fn named_values(&self) -> Result<HashMap<String, Vec<u32>>, MachError> {
    let mut vals = HashMap::new();
    for (i, rg) in self.output_regions()?.into_iter().enumerate() {
      let name = match rg.name {
        0 => format!("unnamed_output_{}", i),
        addr => self.fetch_string(addr)?,
      };
      vals.insert(name, self.fetch_many(rg.from, rg.to)?);
    }
    Ok(vals)
  }

  pub fn pbp(&self) -> u32 {
    self.pbp
  }

  pub fn psp(&self) -> u32 {
    self.psp
  }

  pub fn cbp(&self) -> u32 {
    self.cbp
  }

  pub fn csp(&self) -> u32 {
    self.csp
  }

  /// Calls `f` with the base address and contents of every materialized
  /// page, in address order.
  pub fn each_page<F>(&self, mut f: F)
  where
    F: FnMut(u32, &Page),
  {
    for (i, slot) in self.pages.iter().enumerate() {
      if let Some(pg) = slot {
        f((i as u32) << PAGE_SHIFT, pg);
      }
    }
  }

  /// Copies memory starting at `addr` into `buf`; unmaterialized memory
  /// copies as zeroes. Returns the bytes copied, always `buf.len()`.
  pub fn mem_copy(&self, addr: u32, buf: &mut [u8]) -> usize {
    self.fetch_bytes(addr, buf);
    buf.len()
  }

  /// Dumps the memory image, one full page per materialized slot with
  /// zero-filled gaps, to `w`. Returns the bytes written.
  pub fn write_to<W: std::io::Write>(&self, w: &mut W) -> std::io::Result<u64> {
    let zero = [0u8; PAGE_SIZE];
    let mut n = 0u64;
    for slot in &self.pages {
      let bytes: &[u8] = match slot {
        Some(pg) => &pg.d,
        None => &zero,
      };
      w.write_all(bytes)?;
      n += bytes.len() as u64;
    }
    Ok(n)
  }
}

impl fmt::Debug for Mach {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.debug_struct("Mach")
      .field("err", &self.err)
      .field("ip", &format_args!("{:#06x}", self.ip))
      .field("psp", &format_args!("{:#x}", self.psp))
      .field("pa", &format_args!("{:#x}", self.pa))
      .field("csp", &format_args!("{:#x}", self.csp))
      .field("count", &self.count)
      .finish()
  }
}

impl Mach {
  fn status_line(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "Mach")?;
    if let Some(code) = self.halt_code() {
      write!(f, " HALT:{}", code)?;
    } else if let Some(err) = &self.err {
      write!(f, " ERR:{}", err)?;
    }
    write!(
      f,
      " @{:#06x} psp={:#x} pa={:#x} csp={:#x} n={}",
      self.ip, self.psp, self.pa, self.csp, self.count
    )
  }
}

#[cfg(not(feature = "trace_execution"))]
impl Display for Mach {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    self.status_line(f)
  }
}

#[cfg(feature = "trace_execution")]
lazy_static! {
  static ref STACK_TABLE_FORMAT: format::TableFormat = format::FormatBuilder::new()
    .column_separator(' ')
    .borders(' ')
    .padding(1, 1)
    .build();
}

#[cfg(feature = "trace_execution")]
impl Display for Mach {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    self.status_line(f)?;
    writeln!(f)?;
    let ps = self.fetch_ps().unwrap_or_default();
    let cs = self.fetch_cs().unwrap_or_default();
    let mut t = table!([Mach::stack_table(&ps), Mach::stack_table(&cs)]);
    t.set_titles(row![ub->"param", ub->"control"]);
    t.set_format(*STACK_TABLE_FORMAT);
    write!(f, "{}", t)
  }
}

#[cfg(feature = "trace_execution")]
impl Mach {
  /// One stack as a two-column table, top element first.
  fn stack_table(vals: &[u32]) -> Table {
    let mut t = Table::new();
    t.set_format(*STACK_TABLE_FORMAT);
    if vals.is_empty() {
      t.add_row(row![i->"(empty)"]);
      return t;
    }
    for (i, v) in vals.iter().enumerate().rev() {
      t.add_row(row![r->i, r->format!("{:#010x}", v)]);
    }
    t
  }
}

fn bit_word(addr: u32, n: u32) -> (u32, u32) {
  (addr.wrapping_add((n / 32).wrapping_mul(4)), n % 32)
}

fn shl(a: u32, b: u32) -> u32 {
  match b {
    0..=31 => a << b,
    _ => 0,
  }
}

fn shr(a: u32, b: u32) -> u32 {
  match b {
    0..=31 => a >> b,
    _ => 0,
  }
}

/// Signed Euclidean division: the quotient rounds so the remainder is
/// always non-negative.
fn sdiv(a: u32, b: u32) -> Result<u32, MachError> {
  match b {
    0 => Err(MachError::DivideByZero),
    _ => Ok((a as i32).wrapping_div_euclid(b as i32) as u32),
  }
}

fn smod(a: u32, b: u32) -> Result<u32, MachError> {
  match b {
    0 => Err(MachError::DivideByZero),
    _ => Ok((a as i32).wrapping_rem_euclid(b as i32) as u32),
  }
}
