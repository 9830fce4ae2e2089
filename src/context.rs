/*!

Shared execution context for a machine family.

Every machine holds a reference-counted context carrying the pieces that are
shared across a family of forked machines: the terminal-state handler, the
bounded run queue, the machine and page allocators, declared output regions,
and an optional tracer.

A context without a handler permits no replication: `fork` and `branch`
fault with [`MachError::NoQueue`]. Installing a handler brings a LIFO run
queue, free-list allocators, and optionally a copy ceiling with it.

*/

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use crate::alloc::{
  CopyCeiling, HeapMachAllocator, HeapPageAllocator, MachAllocator, MachFreeList, MachSlot,
  PageAllocator, PageFreeList,
};
use crate::error::MachError;
use crate::page::PageRef;
use crate::machine::Mach;
use crate::region::Region;
use crate::trace::TracerRef;

/// Disposes of machines that reach a terminal state.
pub trait Handler {
  fn handle(&mut self, m: &mut Mach) -> Result<(), MachError>;
}

impl<F> Handler for F
where
  F: FnMut(&mut Mach) -> Result<(), MachError>,
{
  fn handle(&mut self, m: &mut Mach) -> Result<(), MachError> {
    self(m)
  }
}

/// The no-handler default: a terminal machine's own result stands.
struct ResultHandler;

impl Handler for ResultHandler {
  fn handle(&mut self, m: &mut Mach) -> Result<(), MachError> {
    m.result()
  }
}

struct RunQueue {
  q: Vec<Mach>,
  cap: usize,
}

// Free-list sizing guess; a forking machine rarely dirties more pages.
const PAGES_PER_MACH_GUESS: usize = 4;

pub struct Context {
  handler: RefCell<Box<dyn Handler>>,
  queue: RefCell<Option<RunQueue>>,
  machs: Box<dyn MachAllocator>,
  pages: Box<dyn PageAllocator>,
  tracer: RefCell<Option<TracerRef>>,
  outputs: Vec<Region>,
}

impl Context {
  /// A context with no run queue: programs may not replicate.
  pub(crate) fn unscheduled(outputs: Vec<Region>) -> Context {
    Context {
      handler: RefCell::new(Box::new(ResultHandler)),
      queue: RefCell::new(None),
      machs: Box::new(HeapMachAllocator),
      pages: Box::new(HeapPageAllocator),
      tracer: RefCell::new(None),
      outputs,
    }
  }

  /// A context with a handler, a bounded LIFO run queue, and free-list
  /// allocators. A nonzero `max_copies` caps replication.
  pub(crate) fn scheduled(
    handler: Box<dyn Handler>,
    queue_size: usize,
    max_copies: u32,
    outputs: Vec<Region>,
  ) -> Context {
    let mfl = MachFreeList::with_capacity(queue_size);
    let machs: Box<dyn MachAllocator> = match max_copies {
      0 => Box::new(mfl),
      n => Box::new(CopyCeiling::new(n, mfl)),
    };
    Context {
      handler: RefCell::new(handler),
      queue: RefCell::new(Some(RunQueue { q: Vec::with_capacity(queue_size), cap: queue_size })),
      machs,
      pages: Box::new(PageFreeList::with_capacity(queue_size * PAGES_PER_MACH_GUESS)),
      tracer: RefCell::new(None),
      outputs,
    }
  }

  pub(crate) fn outputs(&self) -> &[Region] {
    &self.outputs
  }

  pub(crate) fn alloc_mach(&self) -> Result<MachSlot, MachError> {
    self.machs.alloc_mach()
  }

  pub(crate) fn free_mach(&self, slot: MachSlot) {
    self.machs.free_mach(slot);
  }

  pub(crate) fn alloc_page(&self) -> PageRef {
    self.pages.alloc_page()
  }

  pub(crate) fn free_page(&self, pg: PageRef) {
    self.pages.free_page(pg);
  }

  /// Places `child` on the run queue, crediting `parent` to any tracer.
  /// A refused child is released back to the allocators.
  pub(crate) fn enqueue(&self, parent: &Mach, child: Mach) -> Result<(), MachError> {
    let verdict = match &*self.queue.borrow() {
      None => Err(MachError::NoQueue),
      Some(rq) if rq.q.len() >= rq.cap => Err(MachError::RunQueueFull),
      Some(_) => Ok(()),
    };
    if let Err(err) = verdict {
      debug!(%err, "refused child machine");
      child.release();
      return Err(err);
    }
    if let Some(t) = self.tracer() {
      t.borrow_mut().queue(parent, &child);
    }
    if let Some(rq) = self.queue.borrow_mut().as_mut() {
      rq.q.push(child);
    }
    Ok(())
  }

  /// Pops the most recently queued machine, if any.
  pub(crate) fn dequeue(&self) -> Option<Mach> {
    self.queue.borrow_mut().as_mut().and_then(|rq| rq.q.pop())
  }

  pub(crate) fn handle(&self, m: &mut Mach) -> Result<(), MachError> {
    self.handler.borrow_mut().handle(m)
  }

  pub(crate) fn tracer(&self) -> Option<TracerRef> {
    self.tracer.borrow().clone()
  }

  /// Installs `t`, replacing any prior tracer; reinstalling the same
  /// tracer is a no-op.
  pub(crate) fn install_tracer(&self, t: TracerRef) {
    let mut cur = self.tracer.borrow_mut();
    match &*cur {
      Some(have) if Rc::ptr_eq(have, &t) => (),
      _ => *cur = Some(t),
    }
  }

  pub(crate) fn remove_tracer(&self) {
    *self.tracer.borrow_mut() = None;
  }
}
