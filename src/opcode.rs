/*!

  The opcode table and the `Op` value.

  An operation is a 7-bit opcode plus an optional 32-bit immediate; on the wire
  it is a single varcode whose code byte carries the opcode in its low seven
  bits and "has immediate" in the high bit. Each opcode is statically
  classified by the kind of immediate it accepts: none at all, an arbitrary
  value, an absolute address, or a signed IP-relative offset. Offsets are
  relative to the decoded end of the instruction itself, which makes their
  encoded length depend on their own value; `Op::resolve_ref_arg` solves that
  fixed point.

  The numbering is part of the wire format. Code 0 is `crash` so that a
  machine running into zeroed memory crashes rather than silently looping.
  Gaps in the numbering are reserved: they decode to an invalid-op fault,
  which keeps them available for future revisions.

*/

use std::convert::TryFrom;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::{Display as StrumDisplay, EnumString, IntoStaticStr};

use crate::encoding::{
  put_varcode, put_varcode_sized, read_varcode, varcode_len, VarCodeFault, CODE_WITH_VALUE,
  MAX_VARCODE_LEN,
};
use crate::error::MachError;

/// Opcodes of the machine. The discriminant is the 7-bit wire code.
#[derive(
  StrumDisplay, IntoStaticStr, EnumString, TryFromPrimitive, IntoPrimitive,
  Clone,        Copy,          PartialEq,  Eq,               Debug,        Hash,
)]
#[repr(u8)]
pub enum Opcode {
  // Terminal zero: uninitialized memory crashes.
  #[strum(serialize = "crash")]   Crash   = 0x00,
  #[strum(serialize = "nop")]     Nop     = 0x01,

  // Stack manipulation.
  #[strum(serialize = "push")]    Push    = 0x02,
  #[strum(serialize = "pop")]     Pop     = 0x03,
  #[strum(serialize = "dup")]     Dup     = 0x04,
  #[strum(serialize = "swap")]    Swap    = 0x05,

  // Memory.
  #[strum(serialize = "fetch")]   Fetch   = 0x08,
  #[strum(serialize = "store")]   Store   = 0x09,
  #[strum(serialize = "storeTo")] StoreTo = 0x0a,

  // Arithmetic.
  #[strum(serialize = "neg")]     Neg     = 0x10,
  #[strum(serialize = "add")]     Add     = 0x11,
  #[strum(serialize = "sub")]     Sub     = 0x12,
  #[strum(serialize = "mul")]     Mul     = 0x13,
  #[strum(serialize = "div")]     Div     = 0x14,
  #[strum(serialize = "mod")]     Mod     = 0x15,
  #[strum(serialize = "divmod")]  Divmod  = 0x16,

  // Comparisons and boolean logic.
  #[strum(serialize = "lt")]      Lt      = 0x18,
  #[strum(serialize = "lte")]     Lte     = 0x19,
  #[strum(serialize = "eq")]      Eq      = 0x1a,
  #[strum(serialize = "neq")]     Neq     = 0x1b,
  #[strum(serialize = "gt")]      Gt      = 0x1c,
  #[strum(serialize = "gte")]     Gte     = 0x1d,
  #[strum(serialize = "not")]     Not     = 0x1e,
  #[strum(serialize = "and")]     And     = 0x1f,
  #[strum(serialize = "or")]      Or      = 0x20,

  // Bitwise.
  #[strum(serialize = "bitnot")]  Bitnot  = 0x21,
  #[strum(serialize = "bitand")]  Bitand  = 0x22,
  #[strum(serialize = "bitor")]   Bitor   = 0x23,
  #[strum(serialize = "bitxor")]  Bitxor  = 0x24,
  #[strum(serialize = "shiftl")]  Shiftl  = 0x25,
  #[strum(serialize = "shiftr")]  Shiftr  = 0x26,

  // Bit-vector test/set/clear.
  #[strum(serialize = "bitest")]  Bitest  = 0x28,
  #[strum(serialize = "bitset")]  Bitset  = 0x29,
  #[strum(serialize = "bitost")]  Bitost  = 0x2a,
  #[strum(serialize = "bitseta")] Bitseta = 0x2b,
  #[strum(serialize = "bitosta")] Bitosta = 0x2c,

  // Control stack.
  #[strum(serialize = "mark")]    Mark    = 0x30,
  #[strum(serialize = "cpush")]   Cpush   = 0x31,
  #[strum(serialize = "cpop")]    Cpop    = 0x32,
  #[strum(serialize = "p2c")]     P2c     = 0x33,
  #[strum(serialize = "c2p")]     C2p     = 0x34,

  // Jumps, calls.
  #[strum(serialize = "jump")]    Jump    = 0x38,
  #[strum(serialize = "jnz")]     Jnz     = 0x39,
  #[strum(serialize = "jz")]      Jz      = 0x3a,
  #[strum(serialize = "call")]    Call    = 0x3b,
  #[strum(serialize = "ret")]     Ret     = 0x3c,

  // Replication.
  #[strum(serialize = "fork")]    Fork    = 0x40,
  #[strum(serialize = "fnz")]     Fnz     = 0x41,
  #[strum(serialize = "fz")]      Fz      = 0x42,
  #[strum(serialize = "branch")]  Branch  = 0x43,
  #[strum(serialize = "bnz")]     Bnz     = 0x44,
  #[strum(serialize = "bz")]      Bz      = 0x45,

  // Halts.
  #[strum(serialize = "halt")]    Halt    = 0x48,
  #[strum(serialize = "hz")]      Hz      = 0x49,
  #[strum(serialize = "hnz")]     Hnz     = 0x4a,
}

/// The kind of immediate an opcode accepts.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ImmKind {
  /// No immediate is legal.
  None,
  /// An arbitrary 32-bit value (often a repeat count).
  Value,
  /// An absolute address.
  Addr,
  /// A signed offset relative to the decoded end of the instruction.
  Offset,
}

impl Opcode {
  /// The name this opcode assembles from and displays as.
  pub fn name(self) -> &'static str {
    self.into()
  }

  pub fn imm_kind(self) -> ImmKind {
    use Opcode::*;
    match self {
      Crash | Nop | Neg | Not | And | Or | Bitnot | Mark | Ret => ImmKind::None,

      Push | Pop | Dup | Swap | Add | Sub | Mul | Div | Mod | Divmod | Lt | Lte | Eq | Neq
      | Gt | Gte | Bitand | Bitor | Bitxor | Shiftl | Shiftr | Cpush | Cpop | P2c | C2p
      | Halt | Hz | Hnz => ImmKind::Value,

      Fetch | Store | StoreTo | Bitest | Bitset | Bitost | Bitseta | Bitosta | Call => {
        ImmKind::Addr
      }

      Jump | Jnz | Jz | Fork | Fnz | Fz | Branch | Bnz | Bz => ImmKind::Offset,
    }
  }

  /// Whether the immediate must be present. Only `cpush` has no
  /// stack-operand fallback.
  pub fn imm_required(self) -> bool {
    self == Opcode::Cpush
  }
}

/// A decoded (or to-be-encoded) operation: opcode, immediate, and whether the
/// immediate was present on the wire.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Op {
  pub code: Opcode,
  pub arg: u32,
  pub have: bool,
}

impl Op {
  /// Builds an op from its assembly name, checking that an argument is legal.
  pub fn resolve(name: &str, arg: u32, have: bool) -> Result<Op, MachError> {
    let code = Opcode::from_str(name).map_err(|_| MachError::NoSuchOp(name.to_string()))?;
    if have && code.imm_kind() == ImmKind::None {
      return Err(MachError::NoArg);
    }
    Ok(Op { code, arg, have })
  }

  /// The code byte as it appears on the wire: opcode plus the immediate flag.
  fn code_byte(&self) -> u8 {
    let c: u8 = self.code.into();
    match self.have {
      true => c | CODE_WITH_VALUE,
      false => c,
    }
  }

  /// True only if the argument can name another op's encoded location, ala
  /// `resolve_ref_arg`.
  pub fn accepts_ref(&self) -> bool {
    match self.code.imm_kind() {
      ImmKind::Value | ImmKind::Addr | ImmKind::Offset => true,
      ImmKind::None => false,
    }
  }

  /// The number of bytes to reserve for this op: the worst case for ops whose
  /// argument is still an unresolved reference, the exact length otherwise.
  pub fn needed_size(&self) -> usize {
    match self.accepts_ref() {
      true => MAX_VARCODE_LEN,
      false => varcode_len(self.arg, self.code_byte()),
    }
  }

  /**
    Fills in the argument of a control op given its own encoded location and
    its target's. Address and value kinds just take the target address. Offset
    kinds are relative to the decoded end of the instruction, so the encoded
    length is part of its own equation: we search for the smallest width
    `n ∈ [2, 6]` whose implied offset `targ − my − n` fits in `n` bytes, and
    pad the encoding with leading zero groups when the offset would fit in
    fewer. That absorbs the boundary where a magnitude change flips the
    minimal length. Returns the op and the width it must be encoded at.
  */
  pub fn resolve_ref_arg(self, my_ip: u32, targ_ip: u32) -> Result<(Op, usize), MachError> {
    match self.code.imm_kind() {
      ImmKind::Offset => {
        let op = Op { have: true, ..self };
        let d = targ_ip.wrapping_sub(my_ip);
        for n in 2..=MAX_VARCODE_LEN {
          let arg = d.wrapping_sub(n as u32);
          if varcode_len(arg, op.code_byte()) <= n {
            return Ok((Op { arg, ..op }, n));
          }
        }
        // A u32 always fits in five groups, so n = 6 always matched.
        unreachable!("no self-consistent varcode width")
      }

      ImmKind::Value | ImmKind::Addr => {
        let op = Op { arg: targ_ip, have: true, ..self };
        let len = op.needed_size();
        Ok((op, len))
      }

      ImmKind::None => Err(MachError::NoArg),
    }
  }

  /// Encodes the op into `buf` at its minimal length, returning bytes written.
  pub fn encode_into(&self, buf: &mut [u8]) -> usize {
    put_varcode(buf, self.arg, self.code_byte())
  }

  /// Encodes the op padded to exactly `size` bytes (see `put_varcode_sized`).
  pub fn encode_sized_into(&self, buf: &mut [u8], size: usize) -> usize {
    put_varcode_sized(buf, self.arg, self.code_byte(), size)
  }
}

/**
  Decodes one op from the front of `buf`, validating it against the opcode
  table: an unknown code, an immediate on an op that takes none, or a missing
  required immediate are all decode faults.
*/
pub fn decode_op(buf: &[u8]) -> Result<(usize, Op), MachError> {
  let vc = read_varcode(buf).map_err(|fault| match fault {
    VarCodeFault::Truncated => MachError::InvalidIp,
    VarCodeFault::TooBig => MachError::VarcodeTooBig,
  })?;

  let raw = vc.code & !CODE_WITH_VALUE;
  let have = vc.code & CODE_WITH_VALUE != 0;
  let code = Opcode::try_from(raw).map_err(|_| MachError::InvalidOp { code: raw })?;

  if have && code.imm_kind() == ImmKind::None {
    return Err(MachError::UnexpectedImm { name: code.name(), arg: vc.value });
  }
  if !have && code.imm_required() {
    return Err(MachError::MissingImm { name: code.name() });
  }

  Ok((vc.len, Op { code, arg: vc.value, have }))
}

impl Display for Op {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    if !self.have {
      return write!(f, "{}", self.code);
    }
    match self.code.imm_kind() {
      ImmKind::Value => write!(f, "{} {}", self.arg, self.code),
      ImmKind::Addr => write!(f, "@{:#06x} {}", self.arg, self.code),
      ImmKind::Offset => write!(f, "{:+} {}", self.arg as i32, self.code),
      ImmKind::None => write!(f, "INVALID({:#x} {})", self.arg, self.code),
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  fn all_opcodes() -> Vec<Opcode> {
    (0u8..0x80).filter_map(|c| Opcode::try_from(c).ok()).collect()
  }

  #[test]
  fn op_round_trips() {
    let mut buf = [0u8; MAX_VARCODE_LEN];
    for code in all_opcodes() {
      let mut cases = vec![];
      if !code.imm_required() {
        cases.push(Op { code, arg: 0, have: false });
      }
      if code.imm_kind() != ImmKind::None {
        for &arg in &[0, 1, 0x7f, 0x80, 0x1234_5678, u32::max_value()] {
          cases.push(Op { code, arg, have: true });
        }
      }
      for op in cases {
        let n = op.encode_into(&mut buf);
        assert!(n <= MAX_VARCODE_LEN);
        let (m, got) = decode_op(&buf[..n]).unwrap();
        assert_eq!(m, n);
        assert_eq!(got, op, "round trip of {}", op);
      }
    }
  }

  #[test]
  fn reserved_codes_fault() {
    assert_eq!(decode_op(&[0x06]), Err(MachError::InvalidOp { code: 0x06 }));
    assert_eq!(decode_op(&[0x7f]), Err(MachError::InvalidOp { code: 0x7f }));
  }

  #[test]
  fn imm_validation() {
    // `nop` takes no immediate.
    assert_eq!(
      decode_op(&[0x81, 0x01]),
      Err(MachError::UnexpectedImm { name: "nop", arg: 1 })
    );
    // `cpush` requires one.
    assert_eq!(decode_op(&[0x31]), Err(MachError::MissingImm { name: "cpush" }));
  }

  #[test]
  fn resolve_by_name() {
    let op = Op::resolve("push", 5, true).unwrap();
    assert_eq!(op, Op { code: Opcode::Push, arg: 5, have: true });
    assert_eq!(Op::resolve("ret", 1, true), Err(MachError::NoArg));
    assert!(matches!(Op::resolve("frobnicate", 0, false), Err(MachError::NoSuchOp(_))));
  }

  /// Encode a resolved offset op at its chosen width and check that decoding
  /// from `my_ip` lands exactly on `targ_ip`.
  fn check_ref(my_ip: u32, targ_ip: u32) -> usize {
    let jump = Op { code: Opcode::Jump, arg: 0, have: true };
    let (op, n) = jump.resolve_ref_arg(my_ip, targ_ip).unwrap();
    let mut buf = [0u8; MAX_VARCODE_LEN];
    assert_eq!(op.encode_sized_into(&mut buf, n), n);
    let (m, got) = decode_op(&buf[..n]).unwrap();
    assert_eq!(m, n);
    let end = my_ip + m as u32;
    assert_eq!(end.wrapping_add(got.arg), targ_ip, "site {:#x} -> {:#x}", my_ip, targ_ip);
    n
  }

  #[test]
  fn offsets_land_on_target() {
    assert_eq!(check_ref(0x40, 0x50), 2);
    // Backward jumps encode as 32-bit two's complement, five groups.
    assert_eq!(check_ref(0x40, 0x30), 6);
    assert_eq!(check_ref(0x1000, 0x1000), 6); // self-target is "just before" the op
  }

  #[test]
  fn offset_length_threshold() {
    // d = 0x81: offset 0x7f fits the two-byte width exactly.
    assert_eq!(check_ref(0x100, 0x181), 2);
    // d = 0x82: a two-byte width implies offset 0x80, which needs three
    // bytes; the resolver widens to three and pads.
    assert_eq!(check_ref(0x100, 0x182), 3);
    // Same boundary two groups up.
    assert_eq!(check_ref(0x100, 0x100 + 0x4000 + 2), 3);
    assert_eq!(check_ref(0x100, 0x100 + 0x4000 + 3), 4);
  }

  #[test]
  fn resolve_addr_ref() {
    let call = Op { code: Opcode::Call, arg: 0, have: true };
    let (op, _) = call.resolve_ref_arg(0x40, 0x123).unwrap();
    assert_eq!(op.arg, 0x123);
  }

  #[test]
  fn display_forms() {
    assert_eq!(Op { code: Opcode::Push, arg: 7, have: true }.to_string(), "7 push");
    assert_eq!(Op { code: Opcode::Ret, arg: 0, have: false }.to_string(), "ret");
    assert_eq!(
      Op { code: Opcode::Fetch, arg: 0x40, have: true }.to_string(),
      "@0x0040 fetch"
    );
    assert_eq!(
      Op { code: Opcode::Jump, arg: (-6i32) as u32, have: true }.to_string(),
      "-6 jump"
    );
  }
}
