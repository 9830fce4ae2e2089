/*!

An embeddable stack machine whose programs fork themselves to explore
alternatives.

A program is a varcode-encoded options header plus instruction text. Running
it yields a *family* of machines: the `fork` and `branch` operations copy
the running machine, page-by-page and copy-on-write, and park the copy on a
bounded LIFO run queue. Every machine that reaches a terminal state is
offered to the embedder's handler; the family ends when the queue drains or
the handler refuses a result.

Words on the wire and in machine memory are little-endian, regardless of
host byte order.

```ignore
use forkvm::{Mach, MachBuilder, MachError};

let mut mb = MachBuilder::new(&prog)?;
mb.input(&[3, 1, 4])?;
let mut m = mb.handler(|m: &mut Mach| {
  println!("solution: {:?}", m.values()?);
  Ok(())
}).build();
m.run()?;
```

*/

#[cfg(feature = "trace_execution")]
#[macro_use]
extern crate prettytable;
#[cfg(feature = "trace_execution")]
#[macro_use]
extern crate lazy_static;

pub mod alloc;
pub mod builder;
pub mod context;
pub mod encoding;
pub mod error;
pub mod machine;
pub mod opcode;
pub mod page;
pub mod region;
pub mod trace;

pub use builder::{DebugInfo, MachBuilder};
pub use context::Handler;
pub use error::MachError;
pub use machine::Mach;
pub use opcode::{Op, Opcode};
pub use region::OutputRegion;
pub use trace::{Tracer, TracerRef};
