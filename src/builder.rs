/*!

Program loading.

An encoded program is an options header followed by instruction text. Each
option is a varcode whose 7-bit code names the option and whose value, when
present, is its parameter. The header runs until the `end` option; the text
is loaded immediately after the stack region, at `cbp + 4`.

Options either shape the machine (`stackSize`, `entry`, `maxOps`,
`maxCopies`, `queueSize`), declare memory channels (`input`/`output` pairs
with an optional trailing `name`), or carry debug metadata (`addrLabels`,
`spanOpen`/`spanClose`) that the loader collects into a [`DebugInfo`] for
the embedder.

*/

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use string_cache::DefaultAtom;
use tracing::debug;

use crate::context::{Context, Handler};
use crate::encoding::{read_varcode, CODE_WITH_VALUE};
use crate::error::MachError;
use crate::machine::{Mach, OpCache};
use crate::region::Region;

pub const OPT_END: u8 = 0x00;
pub const OPT_STACK_SIZE: u8 = 0x01;
pub const OPT_QUEUE_SIZE: u8 = 0x02;
pub const OPT_MAX_OPS: u8 = 0x03;
pub const OPT_MAX_COPIES: u8 = 0x04;
pub const OPT_ENTRY: u8 = 0x05;
pub const OPT_INPUT: u8 = 0x06;
pub const OPT_OUTPUT: u8 = 0x07;
pub const OPT_NAME: u8 = 0x08;
pub const OPT_ADDR_LABELS: u8 = 0x09;
pub const OPT_SPAN_OPEN: u8 = 0x0a;
pub const OPT_SPAN_CLOSE: u8 = 0x0b;
pub const OPT_VERSION: u8 = 0x7f;

/// The assembly-facing name of an option code.
pub fn option_name(code: u8) -> Option<&'static str> {
  match code & !CODE_WITH_VALUE {
    OPT_END => Some("end"),
    OPT_STACK_SIZE => Some("stackSize"),
    OPT_QUEUE_SIZE => Some("queueSize"),
    OPT_MAX_OPS => Some("maxOps"),
    OPT_MAX_COPIES => Some("maxCopies"),
    OPT_ENTRY => Some("entry"),
    OPT_INPUT => Some("input"),
    OPT_OUTPUT => Some("output"),
    OPT_NAME => Some("name"),
    OPT_ADDR_LABELS => Some("addrLabels"),
    OPT_SPAN_OPEN => Some("spanOpen"),
    OPT_SPAN_CLOSE => Some("spanClose"),
    OPT_VERSION => Some("version"),
    _ => None,
  }
}

pub fn option_code(name: &str) -> Result<u8, MachError> {
  match name {
    "end" => Ok(OPT_END),
    "stackSize" => Ok(OPT_STACK_SIZE),
    "queueSize" => Ok(OPT_QUEUE_SIZE),
    "maxOps" => Ok(OPT_MAX_OPS),
    "maxCopies" => Ok(OPT_MAX_COPIES),
    "entry" => Ok(OPT_ENTRY),
    "input" => Ok(OPT_INPUT),
    "output" => Ok(OPT_OUTPUT),
    "name" => Ok(OPT_NAME),
    "addrLabels" => Ok(OPT_ADDR_LABELS),
    "spanOpen" => Ok(OPT_SPAN_OPEN),
    "spanClose" => Ok(OPT_SPAN_CLOSE),
    "version" => Ok(OPT_VERSION),
    _ => Err(MachError::NoSuchOption(name.to_string())),
  }
}

const SPAN_OPEN: u8 = 1 << 0;
const SPAN_CLOSE: u8 = 1 << 1;

/// Debug metadata collected from a program's options header: address labels
/// and logical span boundaries. Labels are interned, since the same names
/// recur across the many programs a test suite loads.
#[derive(Default, Debug)]
pub struct DebugInfo {
  labels: HashMap<u32, Vec<DefaultAtom>>,
  spans: HashMap<u32, u8>,
}

impl DebugInfo {
  fn label(&mut self, addr: u32, name: &str) {
    self.labels.entry(addr).or_insert_with(Vec::new).push(DefaultAtom::from(name));
  }

  fn annotate(&mut self, addr: u32, flag: u8) {
    *self.spans.entry(addr).or_insert(0) |= flag;
  }

  pub fn labels(&self, addr: u32) -> &[DefaultAtom] {
    match self.labels.get(&addr) {
      Some(names) => names,
      None => &[],
    }
  }

  /// Whether a span opens and/or closes at `addr`.
  pub fn span(&self, addr: u32) -> (bool, bool) {
    let flags = self.spans.get(&addr).copied().unwrap_or(0);
    (flags & SPAN_OPEN != 0, flags & SPAN_CLOSE != 0)
  }

  pub fn labeled_addrs(&self) -> Vec<u32> {
    let mut addrs: Vec<u32> = self.labels.keys().copied().collect();
    addrs.sort_unstable();
    addrs
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty() && self.spans.is_empty()
  }
}

/// Default stack region size when the program sets none.
const DEFAULT_STACK_SIZE: u32 = 0x40;
const MAX_STACK_SIZE: u32 = 0xffff;
const DEFAULT_QUEUE_SIZE: usize = 10;

struct OptReader<'a> {
  buf: &'a [u8],
  n: usize,
}

impl<'a> OptReader<'a> {
  fn new(buf: &'a [u8]) -> OptReader<'a> {
    OptReader { buf, n: 0 }
  }

  /// The next option as (code, has-parameter, parameter).
  fn read(&mut self) -> Result<(u8, bool, u32), MachError> {
    let vc = read_varcode(&self.buf[self.n..]).map_err(|_| MachError::TruncatedOptions)?;
    self.n += vc.len;
    Ok((vc.code & !CODE_WITH_VALUE, vc.code & CODE_WITH_VALUE != 0, vc.value))
  }

  /// Consumes the next option only if it is `code` with a parameter.
  fn may_read(&mut self, code: u8) -> Result<Option<u32>, MachError> {
    let save = self.n;
    match self.read() {
      Ok((c, true, arg)) if c == code => Ok(Some(arg)),
      Ok(_) | Err(_) => {
        self.n = save;
        Ok(None)
      }
    }
  }

  /// A little-endian base-128 varint, as used inside `addrLabels` payloads.
  fn read_uvarint(&mut self) -> Result<u32, MachError> {
    let mut val: u32 = 0;
    let mut shift = 0;
    loop {
      let b = *self.buf.get(self.n).ok_or(MachError::TruncatedVarint)?;
      self.n += 1;
      if shift >= 32 {
        return Err(MachError::BigVarint);
      }
      val |= ((b & 0x7f) as u32) << shift;
      if b & 0x80 == 0 {
        return Ok(val);
      }
      shift += 7;
    }
  }

  /// A uvarint byte count followed by that many bytes.
  fn read_string(&mut self) -> Result<String, MachError> {
    let len = self.read_uvarint()? as usize;
    let end = self.n.checked_add(len).filter(|&e| e <= self.buf.len());
    let end = end.ok_or(MachError::TruncatedString)?;
    let s = String::from_utf8_lossy(&self.buf[self.n..end]).into_owned();
    self.n = end;
    Ok(s)
  }
}

/**

Builds a machine from an encoded program.

```ignore
let mut mb = MachBuilder::new(&prog)?;
mb.input(&[3, 5, 8])?;
let mut m = mb.handler(|m: &mut Mach| { ... }).build();
m.run()?;
```

`new` parses the options header and loads the instruction text; `build`
finalizes the context. Without a handler the machine gets a context that
refuses replication.

*/
pub struct MachBuilder {
  mach: Mach,
  base: u32,
  queue_size: usize,
  max_copies: u32,
  handler: Option<Box<dyn Handler>>,
  inputs: Vec<Region>,
  outputs: Vec<Region>,
  next_input: usize,
  dbg: DebugInfo,
}

impl MachBuilder {
  pub fn new(prog: &[u8]) -> Result<MachBuilder, MachError> {
    let mut mach = Mach::unloaded();
    mach.cbp = DEFAULT_STACK_SIZE - 4;
    mach.csp = mach.cbp;
    mach.ip = DEFAULT_STACK_SIZE;
    let mut mb = MachBuilder {
      mach,
      base: DEFAULT_STACK_SIZE,
      queue_size: DEFAULT_QUEUE_SIZE,
      max_copies: 0,
      handler: None,
      inputs: Vec::new(),
      outputs: Vec::new(),
      next_input: 0,
      dbg: DebugInfo::default(),
    };

    let mut opts = OptReader::new(prog);
    loop {
      let (code, have, arg) = opts.read()?;
      if mb.handle_opt(&mut opts, code, have, arg)? {
        break;
      }
    }

    let text = &prog[opts.n..];
    // Cache keys are ip - cbp, and the entry sits one word past cbp.
    mb.mach.opc = Rc::new(RefCell::new(OpCache::with_len(text.len() + 4)));
    mb.mach.store_bytes(mb.base, text);
    debug!(
      base = mb.base,
      text_len = text.len(),
      entry = mb.mach.ip,
      inputs = mb.inputs.len(),
      outputs = mb.outputs.len(),
      "loaded program"
    );
    Ok(mb)
  }

  fn handle_opt(
    &mut self,
    opts: &mut OptReader<'_>,
    code: u8,
    have: bool,
    arg: u32,
  ) -> Result<bool, MachError> {
    match (code, have) {
      (OPT_END, false) => return Ok(true),

      (OPT_VERSION, false) => (),
      (OPT_VERSION, true) if arg == 0 => (),
      (OPT_VERSION, true) => return Err(MachError::BadVersion(arg)),

      (OPT_STACK_SIZE, true) => {
        if arg == 0 || arg > MAX_STACK_SIZE || arg & 3 != 0 {
          return Err(MachError::BadStackSize(arg));
        }
        let old_base = self.base;
        self.base = arg;
        self.mach.cbp = arg - 4;
        self.mach.csp = arg - 4;
        // An entry option may already have redirected the ip.
        if self.mach.ip == 0 || self.mach.ip == old_base {
          self.mach.ip = arg;
        }
      }

      (OPT_QUEUE_SIZE, true) => self.queue_size = arg as usize,
      (OPT_MAX_OPS, true) => self.mach.limit = arg,
      (OPT_MAX_OPS, false) => self.mach.limit = 0,
      (OPT_MAX_COPIES, true) => self.max_copies = arg,
      (OPT_MAX_COPIES, false) => self.max_copies = 0,
      (OPT_ENTRY, true) => self.mach.ip = arg,

      (OPT_INPUT, true) => {
        let rg = read_region(opts, OPT_INPUT, "input", arg)?;
        self.inputs.push(rg);
      }
      (OPT_OUTPUT, true) => {
        let rg = read_region(opts, OPT_OUTPUT, "output", arg)?;
        self.outputs.push(rg);
      }

      (OPT_ADDR_LABELS, true) => {
        for _ in 0..arg {
          let addr = opts.read_uvarint().map_err(|e| MachError::BadLabel(Box::new(e)))?;
          let name = opts.read_string().map_err(|e| MachError::BadLabel(Box::new(e)))?;
          self.dbg.label(addr, &name);
        }
      }
      (OPT_SPAN_OPEN, true) => self.dbg.annotate(arg, SPAN_OPEN),
      (OPT_SPAN_CLOSE, true) => self.dbg.annotate(arg, SPAN_CLOSE),

      _ => return Err(MachError::BadOption { code, have, arg }),
    }
    Ok(false)
  }

  /// Installs the terminal-state handler, enabling replication.
  pub fn handler<H: Handler + 'static>(mut self, h: H) -> MachBuilder {
    self.handler = Some(Box::new(h));
    self
  }

  /// Writes `vals` into the next unclaimed declared input region.
  pub fn input(&mut self, vals: &[u32]) -> Result<(), MachError> {
    let i = self.next_input;
    let rg = match self.inputs.get(i) {
      Some(rg) => *rg,
      None => return Err(MachError::NoSuchInput(format!("#{}", i))),
    };
    self.write_input(rg, vals)?;
    self.next_input += 1;
    Ok(())
  }

  /// Writes `vals` into the declared input region named `name`.
  pub fn named_input(&mut self, name: &str, vals: &[u32]) -> Result<(), MachError> {
    for rg in &self.inputs {
      if rg.name != 0 && self.mach.fetch_string(rg.name)? == name {
        let rg = *rg;
        return self.write_input(rg, vals);
      }
    }
    Err(MachError::NoSuchInput(name.to_string()))
  }

  fn write_input(&mut self, rg: Region, vals: &[u32]) -> Result<(), MachError> {
    let max = rg.to.wrapping_sub(rg.from) / 4;
    if vals.len() > max as usize {
      return Err(MachError::InputTooLong { max, got: vals.len() });
    }
    for (k, &v) in vals.iter().enumerate() {
      self.mach.store_bytes(rg.from.wrapping_add(4 * k as u32), &v.to_le_bytes());
    }
    Ok(())
  }

  pub fn debug_info(&self) -> &DebugInfo {
    &self.dbg
  }

  pub fn take_debug_info(&mut self) -> DebugInfo {
    std::mem::take(&mut self.dbg)
  }

  /// Finalizes the context and hands over the machine.
  pub fn build(self) -> Mach {
    let MachBuilder { mut mach, queue_size, max_copies, handler, outputs, .. } = self;
    let ctx = match handler {
      Some(h) => Context::scheduled(h, queue_size, max_copies, outputs),
      None => Context::unscheduled(outputs),
    };
    mach.ctx = Rc::new(ctx);
    mach
  }
}

/// Reads the closing half of an `input`/`output` pair, plus an optional
/// trailing `name` option carrying the address of the region's name string.
fn read_region(
  opts: &mut OptReader<'_>,
  code: u8,
  kind: &'static str,
  from: u32,
) -> Result<Region, MachError> {
  let (c, have, to) = opts.read().map_err(|_| MachError::UnpairedRegion(kind))?;
  if c != code || !have {
    return Err(MachError::UnpairedRegion(kind));
  }
  let mut rg = Region { name: 0, from, to };
  if let Some(name) = opts.may_read(OPT_NAME)? {
    rg.name = name;
  }
  Ok(rg)
}
