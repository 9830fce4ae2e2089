//! A minimal test assembler: builds encoded programs with label-resolved
//! control arguments and an options header.
//!
//! Offset arguments participate in their own encoding length, so assembly
//! iterates: every label-referring op starts at the worst-case width and
//! widths only ever shrink, which converges in a handful of passes.

use std::collections::HashMap;

use forkvm::builder::{
  OPT_END, OPT_INPUT, OPT_MAX_COPIES, OPT_MAX_OPS, OPT_NAME, OPT_OUTPUT, OPT_QUEUE_SIZE,
  OPT_STACK_SIZE,
};
use forkvm::encoding::{put_varcode, CODE_WITH_VALUE, MAX_VARCODE_LEN};
use forkvm::opcode::Op;

enum Entry {
  Plain(Op),
  Ref { op: Op, label: String },
}

pub struct Asm {
  stack_size: u32,
  opts: Vec<(u8, u32)>,
  entries: Vec<Entry>,
  labels: HashMap<String, usize>,
}

impl Asm {
  pub fn new() -> Asm {
    Asm { stack_size: 0x40, opts: Vec::new(), entries: Vec::new(), labels: HashMap::new() }
  }

  pub fn stack_size(mut self, n: u32) -> Asm {
    self.stack_size = n;
    self
  }

  pub fn queue_size(mut self, n: u32) -> Asm {
    self.opts.push((OPT_QUEUE_SIZE, n));
    self
  }

  pub fn max_ops(mut self, n: u32) -> Asm {
    self.opts.push((OPT_MAX_OPS, n));
    self
  }

  pub fn max_copies(mut self, n: u32) -> Asm {
    self.opts.push((OPT_MAX_COPIES, n));
    self
  }

  pub fn input(mut self, from: u32, to: u32) -> Asm {
    self.opts.push((OPT_INPUT, from));
    self.opts.push((OPT_INPUT, to));
    self
  }

  pub fn output(mut self, from: u32, to: u32) -> Asm {
    self.opts.push((OPT_OUTPUT, from));
    self.opts.push((OPT_OUTPUT, to));
    self
  }

  pub fn output_named(mut self, from: u32, to: u32, name_addr: u32) -> Asm {
    self.opts.push((OPT_OUTPUT, from));
    self.opts.push((OPT_OUTPUT, to));
    self.opts.push((OPT_NAME, name_addr));
    self
  }

  /// Defines `name` as the address of the next op.
  pub fn label(mut self, name: &str) -> Asm {
    self.labels.insert(name.to_string(), self.entries.len());
    self
  }

  /// An op with an immediate argument.
  pub fn op(mut self, name: &str, arg: u32) -> Asm {
    let op = Op::resolve(name, arg, true).expect(name);
    self.entries.push(Entry::Plain(op));
    self
  }

  /// An op with no immediate.
  pub fn op0(mut self, name: &str) -> Asm {
    let op = Op::resolve(name, 0, false).expect(name);
    self.entries.push(Entry::Plain(op));
    self
  }

  /// An op whose argument refers to `label`: offsets for jump kinds,
  /// addresses for the rest.
  pub fn refer(mut self, name: &str, label: &str) -> Asm {
    let op = Op::resolve(name, 0, false).expect(name);
    self.entries.push(Entry::Ref { op, label: label.to_string() });
    self
  }

  pub fn assemble(self) -> Vec<u8> {
    let mut widths: Vec<usize> = self
      .entries
      .iter()
      .map(|e| match e {
        Entry::Plain(op) => {
          let mut bs = [0u8; MAX_VARCODE_LEN];
          op.encode_into(&mut bs)
        }
        Entry::Ref { .. } => MAX_VARCODE_LEN,
      })
      .collect();

    for pass in 0.. {
      assert!(pass < 16, "assembly did not converge");
      let addrs = self.addrs(&widths);
      let mut changed = false;
      for (i, e) in self.entries.iter().enumerate() {
        if let Entry::Ref { op, label } = e {
          let targ = self.target(&addrs, label);
          let (_, n) = op.resolve_ref_arg(addrs[i], targ).expect(label);
          if widths[i] != n {
            widths[i] = n;
            changed = true;
          }
        }
      }
      if !changed {
        break;
      }
    }

    let mut prog = Vec::new();
    let mut bs = [0u8; MAX_VARCODE_LEN];
    let n = put_varcode(&mut bs, self.stack_size, OPT_STACK_SIZE | CODE_WITH_VALUE);
    prog.extend_from_slice(&bs[..n]);
    for &(code, arg) in &self.opts {
      let n = put_varcode(&mut bs, arg, code | CODE_WITH_VALUE);
      prog.extend_from_slice(&bs[..n]);
    }
    let n = put_varcode(&mut bs, 0, OPT_END);
    prog.extend_from_slice(&bs[..n]);

    let addrs = self.addrs(&widths);
    for (i, e) in self.entries.iter().enumerate() {
      let n = match e {
        Entry::Plain(op) => op.encode_into(&mut bs),
        Entry::Ref { op, label } => {
          let targ = self.target(&addrs, label);
          let (op, n) = op.resolve_ref_arg(addrs[i], targ).expect(label);
          op.encode_sized_into(&mut bs, n)
        }
      };
      prog.extend_from_slice(&bs[..n]);
    }
    prog
  }

  /// Start addresses of each entry, plus the end-of-text address.
  fn addrs(&self, widths: &[usize]) -> Vec<u32> {
    let mut addrs = Vec::with_capacity(widths.len() + 1);
    let mut at = self.stack_size;
    addrs.push(at);
    for &w in widths {
      at += w as u32;
      addrs.push(at);
    }
    addrs
  }

  fn target(&self, addrs: &[u32], label: &str) -> u32 {
    let i = *self.labels.get(label).unwrap_or_else(|| panic!("undefined label {:?}", label));
    addrs[i]
  }
}
