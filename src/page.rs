/*!

Fixed-size memory pages.

Machine memory is a sparse vector of reference-counted pages. A page that has
never been stored to is simply absent, and reads of absent pages yield zero.
When a machine replicates itself it clones page references rather than page
contents; a store into a shared page copies it first.

Words are serialized little-endian regardless of host order, so a program
image built on one platform runs identically on another.

*/

use std::sync::Arc;

pub const PAGE_SIZE: usize = 0x40;
pub const PAGE_MASK: u32 = PAGE_SIZE as u32 - 1;
pub const PAGE_SHIFT: u32 = 6;

/// A shared handle to a page. The strong count doubles as the sharing test
/// for copy-on-write: a count above one means some other machine also maps
/// this page.
pub type PageRef = Arc<Page>;

#[derive(Clone, Debug)]
pub struct Page {
  pub d: [u8; PAGE_SIZE],
}

impl Page {
  pub fn zeroed() -> Page {
    Page { d: [0u8; PAGE_SIZE] }
  }

  pub fn zero(&mut self) {
    self.d = [0u8; PAGE_SIZE];
  }

  /// Reads the word at `off`; the caller guarantees `off + 4 <= PAGE_SIZE`.
  pub fn word(&self, off: usize) -> u32 {
    let mut bs = [0u8; 4];
    bs.copy_from_slice(&self.d[off..off + 4]);
    u32::from_le_bytes(bs)
  }

  pub fn set_word(&mut self, off: usize, val: u32) {
    self.d[off..off + 4].copy_from_slice(&val.to_le_bytes());
  }

  pub fn is_zero(&self) -> bool {
    self.d.iter().all(|&b| b == 0)
  }
}
