//! Consistent-overhead byte stuffing.
//!
//! Encoded output never contains a zero byte, which leaves `0x00` free to
//! delimit frames in a byte stream. Overhead is one byte per 254 bytes of
//! input, plus one.

use thiserror::Error;

/// Largest run a single code byte can describe.
const MAX_RUN: u8 = 0xFF;

/// Errors removing byte stuffing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StuffingError {
    /// A zero byte appeared inside stuffed data.
    #[error("zero byte at offset {0} inside stuffed data")]
    ZeroByte(usize),

    /// A code byte points past the end of the input.
    #[error("code byte at offset {offset} overruns input by {missing} bytes")]
    Overrun {
        /// Offset of the offending code byte.
        offset: usize,
        /// Bytes missing to satisfy the run.
        missing: usize,
    },
}

/// Stuff `input`, returning bytes free of zeros.
pub fn encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 254 + 2);
    let mut code_idx = 0;
    let mut code: u8 = 1;
    out.push(0);

    for &byte in input {
        if byte == 0 {
            out[code_idx] = code;
            code_idx = out.len();
            out.push(0);
            code = 1;
        } else {
            out.push(byte);
            code += 1;
            if code == MAX_RUN {
                out[code_idx] = code;
                code_idx = out.len();
                out.push(0);
                code = 1;
            }
        }
    }
    out[code_idx] = code;
    out
}

/// Reverse [`encode`].
pub fn decode(input: &[u8]) -> Result<Vec<u8>, StuffingError> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        let code = input[i];
        if code == 0 {
            return Err(StuffingError::ZeroByte(i));
        }
        let start = i + 1;
        let end = start + code as usize - 1;
        if end > input.len() {
            return Err(StuffingError::Overrun {
                offset: i,
                missing: end - input.len(),
            });
        }
        for (offset, &byte) in input[start..end].iter().enumerate() {
            if byte == 0 {
                return Err(StuffingError::ZeroByte(start + offset));
            }
            out.push(byte);
        }
        i = end;
        if code != MAX_RUN && i < input.len() {
            out.push(0);
        }
    }
    Ok(out)
}
