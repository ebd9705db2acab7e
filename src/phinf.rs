// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Parser for the `PHINF` reply.
//!
//! The `0021` reply option combines two field groups back to back: the
//! `0x01` ("TOOL INFORMATION") group first, then the `0x20` group that
//! carries the serial number and channel. Each group is decoded with its
//! own zeroed cursor, since the two groups are laid out independently
//! rather than sharing one continuous offset scheme.

use crate::error::BringupError;
use crate::frame::Cursor;

/// Decoded `PHINF 0021` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhinfReply {
    pub main_type: String,
    pub manufacturer_id: String,
    pub tool_revision: String,
    pub part_number: String,
    pub serial_number: String,
    pub channel: String,
    /// `true` when the raw serial number field was `"00000000"`, the
    /// documented transient Aurora USB fault.
    pub transient_zero_serial: bool,
}

const TOOL_INFO_BLOCK_LEN: usize = 2 + 1 + 1 + 2 + 2 + 12 + 3 + 8 + 2 + 20;
const IDENTITY_BLOCK_LEN: usize = 2 + 20 + 8 + 4 + 2;

/// Total payload length a `PHINF 0021` reply must have.
pub const PHINF_0021_PAYLOAD_LEN: usize = TOOL_INFO_BLOCK_LEN + IDENTITY_BLOCK_LEN;

/// Parse a `PHINF 0021` reply payload (CRC and `\r` already stripped).
pub fn parse_phinf_0021(payload: &[u8]) -> Result<PhinfReply, crate::error::WireError> {
    let mut c = Cursor::new(payload);

    // TOOL INFORMATION (0x01) block.
    let main_type = c.take_str(2)?.to_string();
    c.skip(1)?; // manufacturer id, high byte (unused)
    c.skip(1)?; // manufacturer id, low byte (unused)
    c.skip(2)?;
    c.skip(2)?;
    let manufacturer_id = c.take_str(12)?.trim_end().to_string();
    let tool_revision = c.take_str(3)?.to_string();
    c.skip(8)?;
    c.skip(2)?;
    let part_number = c.take_str(20)?.trim_end().to_string();

    // PHYSICAL PORT LOCATION (0x20) block: identity fields, independently offset.
    c.skip(2)?; // repeats main_type; the TOOL INFORMATION copy above is authoritative
    c.skip(20)?;
    let mut serial_number = c.take_str(8)?.to_string();
    c.skip(4)?;
    let channel = c.take_str(2)?.to_string();

    let transient_zero_serial = serial_number == "00000000";
    if !transient_zero_serial && channel == "01" {
        bump_last_char(&mut serial_number);
    }

    Ok(PhinfReply {
        main_type,
        manufacturer_id,
        tool_revision,
        part_number,
        serial_number,
        channel,
        transient_zero_serial,
    })
}

/// Increment the last character's byte value by one, to disambiguate the
/// second channel of a Dual 5-DoF Aurora tool.
fn bump_last_char(s: &mut String) {
    if let Some(last) = s.pop() {
        s.push((last as u8).wrapping_add(1) as char);
    }
}

/// Map a tool's `main_type` to the `PENA` mode byte.
pub fn pena_mode(main_type: &str) -> Result<char, BringupError> {
    match main_type.to_ascii_uppercase().as_str() {
        "01" => Ok('S'),
        "02" | "04" | "0A" => Ok('D'),
        "03" => Ok('B'),
        other => Err(BringupError::UnknownToolType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(main_type: &str, serial: &str, channel: &str) -> Vec<u8> {
        let mut s = String::new();
        s.push_str(main_type); // main_type (2)
        s.push_str("00"); // manufacturer hi/lo (2)
        s.push_str("00"); // skip (2)
        s.push_str("00"); // skip (2)
        s.push_str(&format!("{:<12}", "NDI")); // manufacturer_id (12)
        s.push_str("001"); // tool_revision (3)
        s.push_str("00000000"); // skip (8)
        s.push_str("00"); // skip (2)
        s.push_str(&format!("{:<20}", "PART-1")); // part_number (20)
        s.push_str(main_type); // repeated main_type in identity block (2)
        s.push_str(&"0".repeat(20)); // skip (20)
        s.push_str(serial); // serial_number (8)
        s.push_str("0000"); // skip (4)
        s.push_str(channel); // channel (2)
        s.into_bytes()
    }

    #[test]
    fn parses_s4_scenario() {
        // main_type "02" (probe), serial "12345678", channel "00".
        let payload = fixture("02", "12345678", "00");
        assert_eq!(payload.len(), PHINF_0021_PAYLOAD_LEN);
        let reply = parse_phinf_0021(&payload).unwrap();
        assert_eq!(reply.main_type, "02");
        assert_eq!(reply.serial_number, "12345678");
        assert_eq!(reply.channel, "00");
        assert!(!reply.transient_zero_serial);
    }

    #[test]
    fn channel_01_bumps_last_character_of_serial() {
        let payload = fixture("02", "1234567A", "01");
        let reply = parse_phinf_0021(&payload).unwrap();
        assert_eq!(reply.serial_number, "1234567B");
    }

    #[test]
    fn zero_serial_is_flagged_transient_and_not_bumped() {
        let payload = fixture("02", "00000000", "01");
        let reply = parse_phinf_0021(&payload).unwrap();
        assert!(reply.transient_zero_serial);
        assert_eq!(reply.serial_number, "00000000");
    }

    #[test]
    fn pena_mode_maps_known_types() {
        assert_eq!(pena_mode("01").unwrap(), 'S');
        assert_eq!(pena_mode("02").unwrap(), 'D');
        assert_eq!(pena_mode("04").unwrap(), 'D');
        assert_eq!(pena_mode("0A").unwrap(), 'D');
        assert_eq!(pena_mode("03").unwrap(), 'B');
        assert!(pena_mode("FF").is_err());
    }
}
