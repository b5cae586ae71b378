use std::fmt;

use super::Error;

/// Reads a network-order u32 at `offset`.
pub(crate) fn unpack_u32(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(raw)
}

/// Removes the pad-length octet and trailing padding from a PADDED
/// payload, returning the content slice bounds `(start, end)`.
pub(crate) fn strip_padding(payload: &[u8]) -> Result<(usize, usize), Error> {
    if payload.is_empty() {
        return Err(Error::TooMuchPadding);
    }
    let pad_len = payload[0] as usize;
    // The pad-length octet itself counts against the payload.
    if pad_len + 1 > payload.len() {
        return Err(Error::TooMuchPadding);
    }
    Ok((1, payload.len() - pad_len))
}

/// Builder for flag-byte `Debug` output: prints set flags by name.
pub(crate) fn debug_flags<'a, 'f: 'a>(
    fmt: &'a mut fmt::Formatter<'f>,
    bits: u8,
) -> DebugFlags<'a, 'f> {
    let result = write!(fmt, "({bits:#x}");
    DebugFlags {
        fmt,
        result,
        started: false,
    }
}

pub(crate) struct DebugFlags<'a, 'f: 'a> {
    fmt: &'a mut fmt::Formatter<'f>,
    result: fmt::Result,
    started: bool,
}

impl DebugFlags<'_, '_> {
    pub(crate) fn flag_if(mut self, enabled: bool, name: &str) -> Self {
        if enabled {
            self.result = self.result.and_then(|()| {
                let sep = if self.started { " | " } else { ": " };
                write!(self.fmt, "{sep}{name}")
            });
            self.started = true;
        }
        self
    }

    pub(crate) fn finish(self) -> fmt::Result {
        self.result.and_then(|()| write!(self.fmt, ")"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_bounds() {
        // pad_len 2, content "ab", padding "\0\0"
        let payload = [2u8, b'a', b'b', 0, 0];
        assert_eq!(strip_padding(&payload), Ok((1, 3)));
        // pad_len eats everything
        let payload = [4u8, 0, 0, 0];
        assert_eq!(strip_padding(&payload), Err(Error::TooMuchPadding));
        // pad_len exactly the rest: zero-length content is legal
        let payload = [3u8, 0, 0, 0];
        assert_eq!(strip_padding(&payload), Ok((1, 1)));
    }

    #[test]
    fn unpack_is_network_order() {
        assert_eq!(unpack_u32(&[0, 0x01, 0x00, 0x00, 0x01], 1), 0x0100_0001);
    }
}
