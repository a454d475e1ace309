//! Zero-run compression: every run of zero bytes becomes `00 <count>`.

use super::protocol::DecodeError;

pub fn encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] != 0 {
            out.push(input[i]);
            i += 1;
            continue;
        }
        let mut run = 0u8;
        while i < input.len() && input[i] == 0 && run < u8::MAX {
            run += 1;
            i += 1;
        }
        out.push(0);
        out.push(run);
    }
    out
}

/// Expands a zero-coded body. `limit` bounds the expanded size so a short
/// hostile frame cannot balloon into a large allocation.
pub fn decode(input: &[u8], limit: usize) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(input.len().min(limit));
    let mut bytes = input.iter();
    while let Some(&byte) = bytes.next() {
        if byte != 0 {
            out.push(byte);
        } else {
            let run = *bytes
                .next()
                .ok_or(DecodeError::Malformed("truncated zero run"))?;
            if run == 0 {
                return Err(DecodeError::Malformed("empty zero run"));
            }
            out.resize(out.len() + run as usize, 0);
        }
        if out.len() > limit {
            return Err(DecodeError::Malformed("zero-coded body too large"));
        }
    }
    Ok(out)
}
