// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Port-handle lifecycle state machine (C8): `PHSR` enumeration, per-handle
//! `PHINF` query, `PENA` enable, and the passive-tool `PHRQ`/`PVWR` ROM
//! upload.

use std::time::Duration;

use crate::error::BringupError;
use crate::frame::{build_command, read_expected_response, CommandBuffer};
use crate::phinf::{parse_phinf_0021, pena_mode, PHINF_0021_PAYLOAD_LEN};
use crate::registry::ToolRegistry;
use crate::transport::TrackerLink;

/// `PHSR` reply-option codes used during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhsrQuery {
    /// `01`: handles to free, via `PHF`.
    ToFree,
    /// `02`: handles to initialize, via `PINIT`.
    ToInitialize,
    /// `03`: handles to enable, via `PENA`.
    ToEnable,
}

impl PhsrQuery {
    fn option_code(self) -> &'static str {
        match self {
            PhsrQuery::ToFree => "01",
            PhsrQuery::ToInitialize => "02",
            PhsrQuery::ToEnable => "03",
        }
    }
}

/// Parse a `PHSR` reply payload: a 2-hex-digit count followed by `count`
/// five-char records, each a 2-char port handle plus a 3-char status we
/// don't currently act on.
pub fn parse_phsr(payload: &[u8]) -> Result<Vec<String>, crate::error::WireError> {
    let mut c = crate::frame::Cursor::new(payload);
    let count = c.take_hex(2)?;
    let mut handles = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let handle = c.take_str(2)?.to_string();
        c.skip(3)?; // status, unused
        handles.push(handle);
    }
    Ok(handles)
}

/// Issue `PHSR <option>` and return the reported port handles.
pub fn query_port_handles(
    link: &mut dyn TrackerLink,
    buf: &mut CommandBuffer,
    timeout: Duration,
    query: PhsrQuery,
) -> Result<Vec<String>, BringupError> {
    build_command(buf, &format!("PHSR {}", query.option_code()))?;
    crate::frame::send_command(link, buf)?;
    let payload = read_expected_response(link, buf, timeout, "")?;
    Ok(parse_phsr(&payload)?)
}

/// Run `PHINF <handle>0021` and decode the reply, bounded-recursing through
/// the transient zero-serial workaround.
pub fn query_port_info(
    link: &mut dyn TrackerLink,
    buf: &mut CommandBuffer,
    timeout: Duration,
    handle: &str,
    max_retries: u32,
) -> Result<crate::phinf::PhinfReply, BringupError> {
    query_port_info_inner(link, buf, timeout, handle, max_retries, 0)
}

fn query_port_info_inner(
    link: &mut dyn TrackerLink,
    buf: &mut CommandBuffer,
    timeout: Duration,
    handle: &str,
    max_retries: u32,
    depth: u32,
) -> Result<crate::phinf::PhinfReply, BringupError> {
    build_command(buf, &format!("PHINF {}0021", handle))?;
    crate::frame::send_command(link, buf)?;
    let payload = read_expected_response(link, buf, timeout, "")?;
    if payload.len() != PHINF_0021_PAYLOAD_LEN {
        return Err(BringupError::Wire(crate::error::WireError::ResponseTooShort));
    }
    let reply = parse_phinf_0021(&payload)?;
    if reply.transient_zero_serial {
        if depth >= max_retries {
            return Err(BringupError::TransientZeroSerialExhausted {
                retries: max_retries,
            });
        }
        std::thread::sleep(Duration::from_millis(500));
        initialize_handle(link, buf, timeout, handle)?;
        return query_port_info_inner(link, buf, timeout, handle, max_retries, depth + 1);
    }
    Ok(reply)
}

/// `PINIT <handle>`: move a handle from free to initialized.
pub fn initialize_handle(
    link: &mut dyn TrackerLink,
    buf: &mut CommandBuffer,
    timeout: Duration,
    handle: &str,
) -> Result<(), BringupError> {
    build_command(buf, &format!("PINIT {}", handle))?;
    crate::frame::send_command(link, buf)?;
    read_expected_response(link, buf, timeout, "OKAY")?;
    Ok(())
}

/// `PENA <handle><mode>`: enable a handle for tracking, mode derived from
/// the tool's `main_type`.
pub fn enable_handle(
    link: &mut dyn TrackerLink,
    buf: &mut CommandBuffer,
    timeout: Duration,
    handle: &str,
    main_type: &str,
) -> Result<(), BringupError> {
    let mode = pena_mode(main_type)?;
    build_command(buf, &format!("PENA {}{}", handle, mode))?;
    crate::frame::send_command(link, buf)?;
    read_expected_response(link, buf, timeout, "OKAY")?;
    Ok(())
}

/// `PHF <handle>`: free a handle.
pub fn free_handle(
    link: &mut dyn TrackerLink,
    buf: &mut CommandBuffer,
    timeout: Duration,
    handle: &str,
) -> Result<(), BringupError> {
    build_command(buf, &format!("PHF {}", handle))?;
    crate::frame::send_command(link, buf)?;
    read_expected_response(link, buf, timeout, "OKAY")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Passive-tool ROM upload: PHRQ + chunked PVWR.
// ---------------------------------------------------------------------------

/// Tool definitions larger than this are rejected outright.
pub const MAX_DEFINITION_BYTES: u64 = 960;

/// Number of bytes hex-encoded per `PVWR` chunk.
const CHUNK_BYTES: usize = 64;

/// `PHRQ`: request a free handle for a passive tool about to be wired.
/// Returns the allocated 2-character handle.
pub fn request_passive_handle(
    link: &mut dyn TrackerLink,
    buf: &mut CommandBuffer,
    timeout: Duration,
) -> Result<String, BringupError> {
    build_command(buf, "PHRQ *********1****")?;
    crate::frame::send_command(link, buf)?;
    let payload = read_expected_response(link, buf, timeout, "")?;
    if payload.len() < 2 {
        return Err(BringupError::Wire(crate::error::WireError::ResponseTooShort));
    }
    let handle = std::str::from_utf8(&payload[..2])
        .map_err(|_| BringupError::Wire(crate::error::WireError::ResponseTooShort))?;
    Ok(handle.to_string())
}

/// Upload a tool definition ROM to `handle` via chunked `PVWR`: reject
/// anything over 960 bytes, split into `ceil(2*size/128)` chunks of
/// 64 raw bytes (128 hex characters) each.
pub fn upload_definition(
    link: &mut dyn TrackerLink,
    buf: &mut CommandBuffer,
    timeout: Duration,
    handle: &str,
    rom: &[u8],
) -> Result<(), BringupError> {
    if rom.len() as u64 > MAX_DEFINITION_BYTES {
        return Err(BringupError::DefinitionTooLarge {
            path: handle.to_string(),
            size: rom.len() as u64,
        });
    }
    for (chunk_index, chunk) in rom.chunks(CHUNK_BYTES).enumerate() {
        let addr = chunk_index * CHUNK_BYTES;
        let mut padded = [0u8; CHUNK_BYTES];
        padded[..chunk.len()].copy_from_slice(chunk);
        let mut hex = String::with_capacity(CHUNK_BYTES * 2);
        for byte in &padded {
            hex.push_str(&format!("{:02X}", byte));
        }
        let command = format!("PVWR {}{:04X}{}", handle, addr, hex);
        build_command(buf, &command)?;
        crate::frame::send_command(link, buf)?;
        read_expected_response(link, buf, timeout, "OKAY")?;
    }
    Ok(())
}

/// Number of `PVWR` chunks a ROM of `size` bytes will require.
pub fn chunk_count(size: usize) -> usize {
    (size + CHUNK_BYTES - 1) / CHUNK_BYTES
}

/// Drive the three `PHSR`-triggered transitions in order:
/// free any handles the device reports as freeable, initialize and query
/// metadata for any newly-allocated handles, then enable every handle the
/// device reports as ready. Registers discovered tools in `registry` and
/// returns the ids of tools newly initialized this sweep.
pub fn enumerate_and_enable(
    link: &mut dyn TrackerLink,
    buf: &mut CommandBuffer,
    timeout: Duration,
    registry: &mut ToolRegistry,
    max_zero_serial_retries: u32,
) -> Result<Vec<crate::registry::ToolId>, BringupError> {
    let to_free = query_port_handles(link, buf, timeout, PhsrQuery::ToFree)?;
    for handle in &to_free {
        free_handle(link, buf, timeout, handle)?;
        if let Some(id) = registry.tool_by_port_handle(handle) {
            registry.clear_port_handle(id);
        }
    }

    let to_initialize = query_port_handles(link, buf, timeout, PhsrQuery::ToInitialize)?;
    let mut discovered = Vec::new();
    for handle in &to_initialize {
        initialize_handle(link, buf, timeout, handle)?;
        let info = query_port_info(link, buf, timeout, handle, max_zero_serial_retries)?;

        let name = format!("{}-{}", info.main_type, info.serial_number);
        let id = registry.add_tool(&name, &info.serial_number, None)?;
        registry.assign_port_handle(id, handle);
        if let Some(tool) = registry.get_mut(id) {
            tool.main_type = info.main_type.clone();
            tool.manufacturer_id = info.manufacturer_id.clone();
            tool.tool_revision = info.tool_revision.clone();
            tool.part_number = info.part_number.clone();
        }
        discovered.push(id);
    }

    let to_enable = query_port_handles(link, buf, timeout, PhsrQuery::ToEnable)?;
    for handle in &to_enable {
        let Some(id) = registry.tool_by_port_handle(handle) else {
            continue;
        };
        let main_type = registry.get(id).map(|t| t.main_type.clone()).unwrap_or_default();
        match enable_handle(link, buf, timeout, handle, &main_type) {
            Ok(()) => {}
            Err(BringupError::UnknownToolType(main_type)) => {
                tracing::warn!(handle = %handle, main_type = %main_type, "skipping enable of unrecognized tool type");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(discovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackLink;

    fn ok_response(link: &mut LoopbackLink, payload: &str) {
        let full = crate::frame::command_with_crc(payload);
        link.push_inbound(full.as_bytes());
        link.push_inbound(b"\r");
    }

    #[test]
    fn parse_phsr_reads_handle_list() {
        // count=3, then 5-char records (2-char handle + 3-char status).
        let payload = b"0301ABC02DEFFF123";
        let handles = parse_phsr(payload).unwrap();
        assert_eq!(handles, vec!["01", "02", "FF"]);
    }

    #[test]
    fn parse_phsr_empty_list() {
        let handles = parse_phsr(b"00").unwrap();
        assert!(handles.is_empty());
    }

    #[test]
    fn query_port_handles_round_trips_over_loopback() {
        let mut link = LoopbackLink::new("mock0");
        ok_response(&mut link, "0201ABC03DEF");
        let mut buf = CommandBuffer::new();
        let handles = query_port_handles(
            &mut link,
            &mut buf,
            Duration::from_millis(100),
            PhsrQuery::ToFree,
        )
        .unwrap();
        assert_eq!(handles, vec!["01", "03"]);
        assert_eq!(link.outbound, b"PHSR 01\r");
    }

    #[test]
    fn chunk_count_matches_960_byte_limit() {
        assert_eq!(chunk_count(960), 15);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(64), 1);
        assert_eq!(chunk_count(65), 2);
    }

    #[test]
    fn upload_definition_rejects_oversized_rom() {
        let mut link = LoopbackLink::new("mock0");
        let mut buf = CommandBuffer::new();
        let rom = vec![0u8; 961];
        let err =
            upload_definition(&mut link, &mut buf, Duration::from_millis(100), "0A", &rom)
                .unwrap_err();
        assert!(matches!(err, BringupError::DefinitionTooLarge { .. }));
    }

    #[test]
    fn upload_definition_pads_final_chunk_to_full_width() {
        let mut link = LoopbackLink::new("mock0");
        let mut buf = CommandBuffer::new();
        let rom = vec![0xABu8; 70]; // one full 64-byte chunk + a 6-byte tail
        for _ in 0..2 {
            ok_response(&mut link, "OKAY");
        }
        upload_definition(&mut link, &mut buf, Duration::from_millis(100), "0A", &rom)
            .unwrap();
        let sent = String::from_utf8(link.outbound.clone()).unwrap();
        // Every PVWR command carries exactly 128 hex chars regardless of
        // how much real ROM data the final chunk held.
        for line in sent.split('\r') {
            if let Some(rest) = line.strip_prefix("PVWR ") {
                let hex = &rest[6..]; // skip 2-char handle + 4-char addr
                assert_eq!(hex.len(), 128);
            }
        }
    }

    #[test]
    fn upload_definition_sends_one_chunk_per_64_bytes() {
        let mut link = LoopbackLink::new("mock0");
        let mut buf = CommandBuffer::new();
        let rom = vec![0xABu8; 128];
        for _ in 0..2 {
            ok_response(&mut link, "OKAY");
        }
        upload_definition(&mut link, &mut buf, Duration::from_millis(100), "0A", &rom)
            .unwrap();
        let sent = String::from_utf8(link.outbound.clone()).unwrap();
        assert_eq!(sent.matches("PVWR").count(), 2);
        assert!(sent.contains("PVWR 0A0000"));
        assert!(sent.contains("PVWR 0A0040"));
    }
}
