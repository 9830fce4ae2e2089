/*!

  The varcode, the self-delimiting variable-length encoding shared by the option
  header and by every instruction. A varcode is a (value, 7-bit code) pair:

    [ 1vvvvvvv ]*  [ 0ccccccc ]

  Every byte except the last has its high bit set and contributes seven bits to
  a 32-bit value, most significant group first. The final byte, with its high
  bit clear, carries the code. Whether any value bytes preceded the terminal
  byte is significant: it distinguishes "value present" from "no value", and is
  returned out of band.

  A 32-bit value needs at most five 7-bit groups, so a varcode is at most six
  bytes long. Leading zero groups (`0x80` bytes) are legal padding; decoders
  shift in zeros, which lets an encoder fix the width of a varcode whose value
  is not yet known (see `Op::resolve_ref_arg`).

*/

/// The maximum size of a varcode: five value bytes and a final code byte.
pub const MAX_VARCODE_LEN: usize = 1 + 5;

/// The high bit of a decoded code marks that value bytes preceded it.
pub const CODE_WITH_VALUE: u8 = 0x80;

/// The result of a successful `read_varcode`: bytes consumed, the 32-bit
/// value, and the 7-bit code with `CODE_WITH_VALUE` set if a value was given.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct VarCode {
  pub len: usize,
  pub value: u32,
  pub code: u8,
}

/// Why a varcode failed to decode.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum VarCodeFault {
  /// The buffer ended before a terminal (high-bit-clear) byte.
  Truncated,
  /// More than five value bytes preceded the terminal byte.
  TooBig,
}

/// Decodes one varcode from the front of `buf`.
pub fn read_varcode(buf: &[u8]) -> Result<VarCode, VarCodeFault> {
  let mut value: u32 = 0;
  for (i, &b) in buf.iter().enumerate() {
    if b & 0x80 == 0 {
      let mut code = b;
      if i > 0 {
        code |= CODE_WITH_VALUE;
      }
      return Ok(VarCode { len: i + 1, value, code });
    }
    if i == 5 {
      return Err(VarCodeFault::TooBig);
    }
    value = value << 7 | u32::from(b & 0x7f);
  }
  Err(VarCodeFault::Truncated)
}

/**
  Encodes a varcode into `buf`, returning the number of bytes written. The
  value is encoded only if `code` has `CODE_WITH_VALUE` set. Panics if `buf`
  is too small; callers size buffers with `varcode_len` or `MAX_VARCODE_LEN`.
*/
pub fn put_varcode(buf: &mut [u8], value: u32, code: u8) -> usize {
  put_varcode_sized(buf, value, code, varcode_len(value, code))
}

/**
  Encodes a varcode padded with leading zero groups to exactly `size` bytes.
  `size` must be between `varcode_len(value, code)` and `MAX_VARCODE_LEN`,
  and the code must carry a value for any padding to be expressible.
*/
pub fn put_varcode_sized(buf: &mut [u8], value: u32, code: u8, size: usize) -> usize {
  debug_assert!(size >= varcode_len(value, code) && size <= MAX_VARCODE_LEN);
  debug_assert!(code & CODE_WITH_VALUE != 0 || size == 1);

  let mut n = size;
  n -= 1;
  buf[n] = code & 0x7f;
  if code & CODE_WITH_VALUE != 0 {
    let mut v = value;
    while n > 0 {
      n -= 1;
      buf[n] = (v as u8 & 0x7f) | 0x80;
      v >>= 7;
    }
  }
  size
}

/// The minimal encoded length of a varcode: one byte per 7-bit value group
/// (at least one when a value is carried) plus the code byte.
pub fn varcode_len(value: u32, code: u8) -> usize {
  let mut n = 1;
  if code & CODE_WITH_VALUE == 0 {
    return n;
  }
  let mut v = value;
  loop {
    n += 1;
    v >>= 7;
    if v == 0 {
      break;
    }
  }
  n
}


#[cfg(test)]
mod tests {
  use super::*;

  fn round_trip(value: u32, code: u8) {
    let mut buf = [0u8; MAX_VARCODE_LEN];
    let n = put_varcode(&mut buf, value, code);
    assert_eq!(n, varcode_len(value, code));
    let vc = read_varcode(&buf[..n]).unwrap();
    assert_eq!(vc.len, n);
    assert_eq!(vc.code, code);
    match code & CODE_WITH_VALUE {
      0 => assert_eq!(vc.value, 0),
      _ => assert_eq!(vc.value, value),
    }
  }

  #[test]
  fn round_trips() {
    round_trip(0, 0x12);
    round_trip(0, 0x80 | 0x12);
    round_trip(1, 0x80 | 0x12);
    round_trip(0x7f, 0x80 | 0x03);
    round_trip(0x80, 0x80 | 0x03);
    round_trip(0x3fff, 0x80 | 0x03);
    round_trip(0x4000, 0x80 | 0x03);
    round_trip(0xdeadbeef, 0x80 | 0x7f);
    round_trip(u32::max_value(), 0x80 | 0x7f);
  }

  #[test]
  fn length_never_exceeds_max() {
    for &value in &[0, 1, 0x7f, 0x80, 0x3fff, 0x4000, 0x0fff_ffff, 0x1000_0000, u32::max_value()] {
      assert!(varcode_len(value, 0x80) <= MAX_VARCODE_LEN);
    }
    assert_eq!(varcode_len(u32::max_value(), 0x80), MAX_VARCODE_LEN);
  }

  #[test]
  fn group_thresholds() {
    assert_eq!(varcode_len(0x7f, 0x80), 2);
    assert_eq!(varcode_len(0x80, 0x80), 3);
    assert_eq!(varcode_len(0x3fff, 0x80), 3);
    assert_eq!(varcode_len(0x4000, 0x80), 4);
    // No value at all: just the code byte.
    assert_eq!(varcode_len(0xffff, 0x00), 1);
  }

  #[test]
  fn truncated() {
    assert_eq!(read_varcode(&[]), Err(VarCodeFault::Truncated));
    assert_eq!(read_varcode(&[0x81]), Err(VarCodeFault::Truncated));
    assert_eq!(read_varcode(&[0x81, 0x82, 0x83]), Err(VarCodeFault::Truncated));
  }

  #[test]
  fn oversized() {
    assert_eq!(
      read_varcode(&[0x81, 0x81, 0x81, 0x81, 0x81, 0x81, 0x01]),
      Err(VarCodeFault::TooBig)
    );
  }

  #[test]
  fn padding_decodes_to_same_value() {
    let mut buf = [0u8; MAX_VARCODE_LEN];
    let n = put_varcode_sized(&mut buf, 0x42, 0x80 | 0x05, MAX_VARCODE_LEN);
    assert_eq!(n, MAX_VARCODE_LEN);
    let vc = read_varcode(&buf[..n]).unwrap();
    assert_eq!(vc.value, 0x42);
    assert_eq!(vc.code, 0x80 | 0x05);
    assert_eq!(vc.len, MAX_VARCODE_LEN);
  }

  #[test]
  fn value_flag_requires_value_byte() {
    // A lone terminal byte decodes without the value flag.
    let vc = read_varcode(&[0x05]).unwrap();
    assert_eq!(vc.code, 0x05);
    assert_eq!(vc.len, 1);
    // A single zero group sets the flag even though the value is zero.
    let vc = read_varcode(&[0x80, 0x05]).unwrap();
    assert_eq!(vc.code, 0x80 | 0x05);
    assert_eq!(vc.value, 0);
  }
}
