//! Self-delimiting numeric values.
//!
//! Big-endian groups of seven bits; every byte except the last has its
//! high bit set. A u64 never needs more than ten bytes.

/// Longest encoding of a u64.
pub const MAX_SDNV_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SdnvError {
    #[error("sdnv truncated after {0} bytes")]
    Truncated(usize),
    #[error("sdnv does not fit in 64 bits")]
    Overflow,
}

/// Append the encoding of `value` to `out`.
pub fn encode(value: u64, out: &mut Vec<u8>) {
    let len = encoded_len(value);
    for i in (0..len).rev() {
        let group = ((value >> (7 * i)) & 0x7f) as u8;
        if i == 0 {
            out.push(group);
        } else {
            out.push(group | 0x80);
        }
    }
}

/// Number of bytes `encode` would write.
pub fn encoded_len(value: u64) -> usize {
    let mut len = 1;
    let mut rest = value >> 7;
    while rest != 0 {
        len += 1;
        rest >>= 7;
    }
    len
}

/// Decode one value from the front of `buf`, returning it with the number
/// of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(u64, usize), SdnvError> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i == MAX_SDNV_LEN || value > (u64::MAX >> 7) {
            return Err(SdnvError::Overflow);
        }
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(SdnvError::Truncated(buf.len()))
}
