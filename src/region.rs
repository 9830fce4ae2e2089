//! Named half-open address intervals declared as input or output channels.

use std::fmt::{Display, Formatter};

/// A declared region of machine memory. The name, when nonzero, is the
/// address of a length-prefixed string in the same address space.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Region {
  pub(crate) name: u32,
  pub from: u32,
  pub to: u32,
}

impl Display for Region {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "[{:#010x}, {:#010x}]", self.from, self.to)
  }
}

/// An output region with its name resolved, as returned by `Mach::outputs`.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct OutputRegion {
  pub name: Option<String>,
  pub from: u32,
  pub to: u32,
}
