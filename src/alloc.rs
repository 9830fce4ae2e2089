/*!

Allocators for machine records and memory pages.

Forking workloads churn through short-lived machines, so both machines and
pages are allocated through pluggable allocators that a context can back
with free lists. A retired machine returns its page vector for reuse; a
retired page returns to the pool only once no other machine maps it.

The copy ceiling is an allocator too: it wraps another machine allocator
and fails allocation once a program has replicated itself enough times.

*/

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::error::MachError;
use crate::page::{Page, PageRef};

/// Recycled buffers from a retired machine record.
#[derive(Default)]
pub struct MachSlot {
  pub pages: Vec<Option<PageRef>>,
}

pub trait MachAllocator {
  fn alloc_mach(&self) -> Result<MachSlot, MachError>;
  fn free_mach(&self, slot: MachSlot);
}

pub trait PageAllocator {
  /// Returns an exclusively owned, zeroed page.
  fn alloc_page(&self) -> PageRef;
  fn free_page(&self, pg: PageRef);
}

/// Allocates fresh and drops freed; the no-scheduler default.
pub struct HeapMachAllocator;

impl MachAllocator for HeapMachAllocator {
  fn alloc_mach(&self) -> Result<MachSlot, MachError> {
    Ok(MachSlot::default())
  }

  fn free_mach(&self, _slot: MachSlot) {}
}

pub struct HeapPageAllocator;

impl PageAllocator for HeapPageAllocator {
  fn alloc_page(&self) -> PageRef {
    Arc::new(Page::zeroed())
  }

  fn free_page(&self, _pg: PageRef) {}
}

/// A free list of machine record buffers.
pub struct MachFreeList {
  free: RefCell<Vec<MachSlot>>,
}

impl MachFreeList {
  pub fn with_capacity(n: usize) -> MachFreeList {
    MachFreeList { free: RefCell::new(Vec::with_capacity(n)) }
  }
}

impl MachAllocator for MachFreeList {
  fn alloc_mach(&self) -> Result<MachSlot, MachError> {
    Ok(self.free.borrow_mut().pop().unwrap_or_default())
  }

  fn free_mach(&self, mut slot: MachSlot) {
    slot.pages.clear();
    self.free.borrow_mut().push(slot);
  }
}

/// A free list of pages. Only pages no longer shared are retained; a page
/// still mapped by another machine is merely unreferenced.
pub struct PageFreeList {
  free: RefCell<Vec<PageRef>>,
}

impl PageFreeList {
  pub fn with_capacity(n: usize) -> PageFreeList {
    PageFreeList { free: RefCell::new(Vec::with_capacity(n)) }
  }
}

impl PageAllocator for PageFreeList {
  fn alloc_page(&self) -> PageRef {
    match self.free.borrow_mut().pop() {
      Some(mut pg) => {
        if let Some(p) = Arc::get_mut(&mut pg) {
          p.zero();
        }
        pg
      }
      None => Arc::new(Page::zeroed()),
    }
  }

  fn free_page(&self, pg: PageRef) {
    if Arc::strong_count(&pg) == 1 {
      self.free.borrow_mut().push(pg);
    }
  }
}

/// Caps the number of machine allocations, bounding how many times a
/// program may replicate itself.
pub struct CopyCeiling<A> {
  left: Cell<u32>,
  inner: A,
}

impl<A: MachAllocator> CopyCeiling<A> {
  pub fn new(max_copies: u32, inner: A) -> CopyCeiling<A> {
    CopyCeiling { left: Cell::new(max_copies), inner }
  }
}

impl<A: MachAllocator> MachAllocator for CopyCeiling<A> {
  fn alloc_mach(&self) -> Result<MachSlot, MachError> {
    match self.left.get() {
      0 => Err(MachError::CopyLimit),
      n => {
        self.left.set(n - 1);
        self.inner.alloc_mach()
      }
    }
  }

  fn free_mach(&self, slot: MachSlot) {
    self.inner.free_mach(slot);
  }
}
