// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Command assembly (C3) and response reading (C4).
//!
//! Both outgoing commands and incoming responses flow through a
//! fixed-capacity [`CommandBuffer`] owned by the driver task, whose write
//! cursor is reset at the start of each new command or response.

use std::time::{Duration, Instant};

use crate::crc::{crc16, format_crc, parse_crc};
use crate::error::WireError;
use crate::transport::TrackerLink;

/// Minimum capacity required by the wire protocol.
pub const COMMAND_BUFFER_CAPACITY: usize = 2048;

/// A fixed-capacity byte buffer with a write cursor, reused across commands
/// and responses.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    buf: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(COMMAND_BUFFER_CAPACITY),
        }
    }

    /// Reset the cursor to the start of the buffer.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Append bytes, failing if the fixed capacity would be exceeded.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        if self.buf.len() + bytes.len() > COMMAND_BUFFER_CAPACITY {
            return Err(WireError::BufferOverflow {
                capacity: COMMAND_BUFFER_CAPACITY,
            });
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Build a command into `buf`: reset, write `command`, append `\r`.
///
/// Outgoing commands never carry a trailing CRC; the device accepts the
/// plain form, and appending CRC is only needed for verbs known to reject
/// it (see [`command_with_crc`]).
pub fn build_command(buf: &mut CommandBuffer, command: &str) -> Result<(), WireError> {
    buf.reset();
    buf.push(command.as_bytes())?;
    buf.push(b"\r")
}

/// Send a command built with [`build_command`] over `link`.
pub fn send_command(
    link: &mut dyn TrackerLink,
    buf: &CommandBuffer,
) -> Result<(), WireError> {
    link.write_all(buf.as_bytes())
        .map_err(|e| WireError::Unexpected {
            expected: "successful write".into(),
            got: e.to_string(),
        })
}

/// Read bytes from `link` into `buf` until the last byte is `\r` or
/// `timeout` elapses.
fn read_until_cr(
    link: &mut dyn TrackerLink,
    buf: &mut CommandBuffer,
    timeout: Duration,
) -> Result<(), WireError> {
    buf.reset();
    let deadline = Instant::now() + timeout;
    let mut chunk = [0u8; 256];
    loop {
        if buf.as_bytes().last() == Some(&b'\r') {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(WireError::Timeout);
        }
        match link.read(&mut chunk) {
            Ok(0) => continue,
            Ok(n) => buf.push(&chunk[..n])?,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Err(WireError::Timeout),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                return Err(WireError::Unexpected {
                    expected: "successful read".into(),
                    got: e.to_string(),
                })
            }
        }
    }
}

/// Read and CRC-verify one response, returning its payload (CRC and `\r`
/// stripped).
pub fn read_response(
    link: &mut dyn TrackerLink,
    buf: &mut CommandBuffer,
    timeout: Duration,
) -> Result<Vec<u8>, WireError> {
    read_until_cr(link, buf, timeout)?;
    let raw = buf.as_bytes();
    // Last 5 bytes are <CRC4>\r.
    if raw.len() < 5 {
        return Err(WireError::ResponseTooShort);
    }
    let payload_end = raw.len() - 5;
    let payload = &raw[..payload_end];
    let crc_digits = &raw[payload_end..raw.len() - 1];
    let got = parse_crc(crc_digits).ok_or(WireError::ResponseTooShort)?;
    let expected = crc16(payload);
    if expected != got {
        return Err(WireError::BadCrc { expected, got });
    }
    Ok(payload.to_vec())
}

/// Read a response and require its payload to start with `expected`.
pub fn read_expected_response(
    link: &mut dyn TrackerLink,
    buf: &mut CommandBuffer,
    timeout: Duration,
    expected: &str,
) -> Result<Vec<u8>, WireError> {
    let payload = read_response(link, buf, timeout)?;
    if !payload.starts_with(expected.as_bytes()) {
        return Err(WireError::Unexpected {
            expected: expected.to_string(),
            got: String::from_utf8_lossy(&payload).into_owned(),
        });
    }
    Ok(payload)
}

/// Serialize a full wire command including its CRC suffix, for collaborators
/// (e.g. `PVWR`) that must append one explicitly.
pub fn command_with_crc(command: &str) -> String {
    let crc = crc16(command.as_bytes());
    format!("{}{}", command, String::from_utf8_lossy(&format_crc(crc)))
}

// ---------------------------------------------------------------------------
// Cursor: explicit "take n bytes" primitives over a parsed payload.
// ---------------------------------------------------------------------------

/// A read cursor over a byte slice, used by the fixed-width ASCII parsers
/// for `PHINF`/`TX`/`PHSR` replies. Replaces pointer arithmetic with named,
/// bounds-checked "take" operations.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Take exactly `n` bytes, advancing the cursor.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::ResponseTooShort);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Take `n` bytes and decode them as UTF-8 (lossless ASCII in practice).
    pub fn take_str(&mut self, n: usize) -> Result<&'a str, WireError> {
        let bytes = self.take(n)?;
        std::str::from_utf8(bytes).map_err(|_| WireError::ResponseTooShort)
    }

    /// Skip `n` bytes without returning them.
    pub fn skip(&mut self, n: usize) -> Result<(), WireError> {
        self.take(n).map(|_| ())
    }

    /// Look at the next `n` bytes without advancing the cursor.
    pub fn peek(&self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        Some(&self.buf[self.pos..self.pos + n])
    }

    /// Take `n` ASCII hex digits and parse as an unsigned integer.
    pub fn take_hex(&mut self, n: usize) -> Result<u32, WireError> {
        let s = self.take_str(n)?;
        u32::from_str_radix(s, 16).map_err(|_| WireError::ResponseTooShort)
    }

    /// Take a single byte and return it as `u8` without advancing semantics
    /// beyond one position.
    pub fn take_byte(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Take `n` bytes of a signed fixed-point decimal with an explicit
    /// leading `+`/`-` sign (the NDI wire shapes for quaternion/translation
    /// components), returning the raw integer value before scaling.
    pub fn take_signed_fixed(&mut self, n: usize) -> Result<i64, WireError> {
        let s = self.take_str(n)?;
        s.parse::<i64>().map_err(|_| WireError::ResponseTooShort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_take_advances_position() {
        let mut c = Cursor::new(b"0123456789");
        assert_eq!(c.take(3).unwrap(), b"012");
        assert_eq!(c.position(), 3);
        assert_eq!(c.take(2).unwrap(), b"34");
    }

    #[test]
    fn cursor_take_past_end_errors() {
        let mut c = Cursor::new(b"ab");
        assert!(c.take(3).is_err());
    }

    #[test]
    fn cursor_take_hex_parses_uppercase_and_lowercase() {
        let mut c = Cursor::new(b"1A2b");
        assert_eq!(c.take_hex(2).unwrap(), 0x1A);
        assert_eq!(c.take_hex(2).unwrap(), 0x2b);
    }

    #[test]
    fn cursor_take_signed_fixed_handles_sign() {
        let mut c = Cursor::new(b"+00100-00050");
        assert_eq!(c.take_signed_fixed(6).unwrap(), 100);
        assert_eq!(c.take_signed_fixed(6).unwrap(), -50);
    }

    #[test]
    fn command_with_crc_matches_vendor_vector() {
        // Full response line for "OKAY" is "OKAYA896\r"; the same
        // CRC-append logic is reused for outgoing PVWR framing.
        assert_eq!(command_with_crc("OKAY"), "OKAYA896");
    }
}
