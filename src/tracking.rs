// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The tracking loop (C9): `TX` issuance, per-tool pose row parsing, the
//! stray-marker block, and pose computation. One request/response round
//! per tick; parsed state is applied to the registry directly, nothing
//! pipelined.

use std::time::Duration;

use crate::error::WireError;
use crate::frame::{build_command, read_response, CommandBuffer, Cursor};
use crate::registry::{Pose, StrayMarkerTable, ToolRegistry};
use crate::transport::TrackerLink;

/// `TX` request bit selecting transformation data.
const TX_TRANSFORM: u32 = 0x0001;
/// `TX` request bit selecting the stray-marker block.
const TX_STRAY: u32 = 0x1000;

/// A single tool's decoded status within a `TX` reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolStatus {
    Missing,
    Disabled,
    Unoccupied,
    Tracking {
        rotation: [f64; 4],
        translation: [f64; 3],
        error_rms: f64,
    },
}

/// One per-handle row of a `TX` reply.
#[derive(Debug, Clone)]
pub struct TrackedRow {
    pub handle: String,
    pub status: ToolStatus,
    pub port_status: u32,
}

/// A fully decoded `TX` reply.
#[derive(Debug, Clone)]
pub struct TxFrame {
    pub rows: Vec<TrackedRow>,
    pub frame_number: u32,
    pub stray_markers: Option<StrayMarkerTable>,
}

/// Build the `TX` command for the current stray-marker setting.
fn tx_command(track_stray_markers: bool) -> String {
    let mut option = TX_TRANSFORM;
    if track_stray_markers {
        option |= TX_STRAY;
    }
    format!("TX {:04X}", option)
}

/// Parse one tool row: handle, shape, port status.
fn parse_row(c: &mut Cursor<'_>) -> Result<TrackedRow, WireError> {
    let handle = c.take_str(2)?.to_string();

    if c.peek(10) == Some(b"UNOCCUPIED") {
        c.skip(10)?;
        let port_status = c.take_hex(8)?;
        return Ok(TrackedRow {
            handle,
            status: ToolStatus::Unoccupied,
            port_status,
        });
    }
    if c.peek(8) == Some(b"DISABLED") {
        c.skip(8)?;
        let port_status = c.take_hex(8)?;
        return Ok(TrackedRow {
            handle,
            status: ToolStatus::Disabled,
            port_status,
        });
    }
    if c.peek(7) == Some(b"MISSING") {
        c.skip(7)?;
        let port_status = c.take_hex(8)?;
        return Ok(TrackedRow {
            handle,
            status: ToolStatus::Missing,
            port_status,
        });
    }

    let w = c.take_signed_fixed(6)? as f64 / 10_000.0;
    let x = c.take_signed_fixed(6)? as f64 / 10_000.0;
    let y = c.take_signed_fixed(6)? as f64 / 10_000.0;
    let z = c.take_signed_fixed(6)? as f64 / 10_000.0;
    // Sign plus 7 digits: 8 characters wide.
    let tx = c.take_signed_fixed(8)? as f64 / 100.0;
    let ty = c.take_signed_fixed(8)? as f64 / 100.0;
    let tz = c.take_signed_fixed(8)? as f64 / 100.0;
    let error_rms = c.take_signed_fixed(6)? as f64 / 10_000.0;
    let port_status = c.take_hex(8)?;

    Ok(TrackedRow {
        handle,
        status: ToolStatus::Tracking {
            rotation: [w, x, y, z],
            translation: [tx, ty, tz],
            error_rms,
        },
        port_status,
    })
}

/// Parse the packed out-of-volume flag bytes into `m` visibility bits.
fn parse_oov_flags(c: &mut Cursor<'_>, m: usize) -> Result<Vec<bool>, WireError> {
    let num_bytes = m.div_ceil(4);
    let garbage = num_bytes * 4 - m;
    let mut visibilities = Vec::with_capacity(m);
    let mut produced = 0usize;
    for _ in 0..num_bytes {
        let raw = c.take_byte()?;
        let nibble = !raw & 0x0F;
        for bit_pos in (0..4).rev() {
            let bit = (nibble >> bit_pos) & 1 == 1;
            if produced >= garbage {
                visibilities.push(bit);
            }
            produced += 1;
        }
    }
    Ok(visibilities)
}

/// Parse the stray-marker block: count, packed OOV flags, then positions.
fn parse_stray_block(c: &mut Cursor<'_>) -> Result<StrayMarkerTable, WireError> {
    let m = c.take_hex(2)? as usize;
    let visibilities = parse_oov_flags(c, m)?;
    let mut table = StrayMarkerTable::empty();
    for (i, visible) in visibilities.iter().enumerate() {
        let x = c.take_signed_fixed(8)? as f64 / 100.0;
        let y = c.take_signed_fixed(8)? as f64 / 100.0;
        let z = c.take_signed_fixed(8)? as f64 / 100.0;
        table.set_row(i, true, *visible, [x, y, z]);
    }
    Ok(table)
}

/// Parse a full `TX` reply payload.
pub fn parse_tx(payload: &[u8], stray_requested: bool) -> Result<TxFrame, WireError> {
    let mut c = Cursor::new(payload);
    let count = c.take_hex(2)?;
    let mut rows = Vec::with_capacity(count as usize);
    for _ in 0..count {
        rows.push(parse_row(&mut c)?);
    }

    let frame_number = c.take_hex(8)?;
    if c.take_byte()? != b'\n' {
        return Err(WireError::ProtocolFraming);
    }

    let stray_markers = if stray_requested {
        Some(parse_stray_block(&mut c)?)
    } else {
        None
    };

    c.skip(4)?; // system status

    Ok(TxFrame {
        rows,
        frame_number,
        stray_markers,
    })
}

/// Run one tracking tick: issue `TX`, parse the reply, and apply the
/// result to `registry`'s tools. Returns the decoded frame so the caller
/// can publish stray markers and events.
pub fn tick(
    link: &mut dyn TrackerLink,
    buf: &mut CommandBuffer,
    timeout: Duration,
    registry: &mut ToolRegistry,
    track_stray_markers: bool,
) -> Result<TxFrame, WireError> {
    build_command(buf, &tx_command(track_stray_markers))?;
    crate::frame::send_command(link, buf)?;
    let payload = read_response(link, buf, timeout)?;
    let frame = parse_tx(&payload, track_stray_markers)?;
    apply_frame(registry, &frame);
    Ok(frame)
}

/// Apply a decoded `TX` frame's per-tool rows onto the registry.
fn apply_frame(registry: &mut ToolRegistry, frame: &TxFrame) {
    for row in &frame.rows {
        let Some(id) = registry.tool_by_port_handle(&row.handle) else {
            continue;
        };
        let Some(tool) = registry.get_mut(id) else {
            continue;
        };
        tool.frame_number = frame.frame_number;
        match &row.status {
            ToolStatus::Tracking {
                rotation,
                translation,
                error_rms,
            } => {
                let marker_pose = Pose {
                    rotation: *rotation,
                    translation: *translation,
                    valid: true,
                }
                .normalized();
                tool.error_rms = *error_rms;
                tool.tooltip_pose = marker_pose.with_offset(tool.tooltip_offset);
                tool.marker_pose = marker_pose;
            }
            ToolStatus::Missing | ToolStatus::Disabled | ToolStatus::Unoccupied => {
                tool.marker_pose.valid = false;
                tool.tooltip_pose.valid = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_bytes(w: &str, x: &str, y: &str, z: &str, tx: &str, ty: &str, tz: &str, err: &str) -> String {
        format!("{}{}{}{}{}{}{}{}", w, x, y, z, tx, ty, tz, err)
    }

    #[test]
    fn parses_s5_track_one_probe_scenario() {
        let mut payload = String::new();
        payload.push_str("01"); // count
        payload.push_str("01"); // handle
        payload.push_str(&row_bytes(
            "+10000", "+00000", "+00000", "+00000", "+0010000", "+0000000", "+0000000", "+00100",
        ));
        payload.push_str("00000000"); // port status
        payload.push_str("00000001"); // frame number
        payload.push('\n');
        payload.push_str("0000"); // system status

        let frame = parse_tx(payload.as_bytes(), false).unwrap();
        assert_eq!(frame.frame_number, 1);
        assert_eq!(frame.rows.len(), 1);
        match &frame.rows[0].status {
            ToolStatus::Tracking {
                rotation,
                translation,
                error_rms,
            } => {
                assert_eq!(*rotation, [1.0, 0.0, 0.0, 0.0]);
                assert_eq!(*translation, [100.0, 0.0, 0.0]);
                assert!((*error_rms - 0.01).abs() < 1e-9);
            }
            other => panic!("expected tracking row, got {:?}", other),
        }

        let mut registry = ToolRegistry::new();
        let id = registry.add_tool("probe", "12345678", None).unwrap();
        registry.assign_port_handle(id, "01");
        registry.get_mut(id).unwrap().tooltip_offset = [0.0, 0.0, 5.0];
        apply_frame(&mut registry, &frame);
        let tool = registry.get(id).unwrap();
        assert_eq!(tool.tooltip_pose.translation, [100.0, 0.0, 5.0]);
        assert!(tool.marker_pose.valid);
    }

    #[test]
    fn parses_missing_disabled_unoccupied_shapes() {
        let mut payload = String::new();
        payload.push_str("03");
        payload.push_str("01MISSING00000000");
        payload.push_str("02DISABLED00000000");
        payload.push_str("03UNOCCUPIED00000000");
        payload.push_str("00000005");
        payload.push('\n');
        payload.push_str("0000");

        let frame = parse_tx(payload.as_bytes(), false).unwrap();
        assert_eq!(frame.rows.len(), 3);
        assert_eq!(frame.rows[0].status, ToolStatus::Missing);
        assert_eq!(frame.rows[1].status, ToolStatus::Disabled);
        assert_eq!(frame.rows[2].status, ToolStatus::Unoccupied);
    }

    #[test]
    fn missing_newline_is_protocol_framing_error() {
        let mut payload = String::new();
        payload.push_str("00");
        payload.push_str("00000001"); // frame number, no '\n' after
        payload.push_str("0000");

        let err = parse_tx(payload.as_bytes(), false).unwrap_err();
        assert_eq!(err, WireError::ProtocolFraming);
    }

    #[test]
    fn zero_tool_handles_parses_cleanly() {
        let mut payload = String::new();
        payload.push_str("00");
        payload.push_str("00000000");
        payload.push('\n');
        payload.push_str("0000");
        let frame = parse_tx(payload.as_bytes(), false).unwrap();
        assert!(frame.rows.is_empty());
    }

    #[test]
    fn parses_s6_stray_marker_scenario() {
        let mut payload = String::new();
        payload.push_str("01");
        payload.push_str("01");
        payload.push_str(&row_bytes(
            "+10000", "+00000", "+00000", "+00000", "+0010000", "+0000000", "+0000000", "+00100",
        ));
        payload.push_str("00000000");
        payload.push_str("00000001");
        payload.push('\n');

        // stray block: m=3, one packed OOV byte 0x0E.
        payload.push_str("03");
        payload.push(0x0Eu8 as char);
        payload.push_str("+0012345");
        payload.push_str("-0000050");
        payload.push_str("+0000000");
        payload.push_str("+0000100");
        payload.push_str("+0000200");
        payload.push_str("+0000300");
        payload.push_str("+0000400");
        payload.push_str("+0000500");
        payload.push_str("+0000600");
        payload.push_str("0000");

        let frame = parse_tx(payload.as_bytes(), true).unwrap();
        let table = frame.stray_markers.unwrap();
        assert_eq!(table.row(0), [1.0, 0.0, 123.45, -0.5, 0.0]);
        assert_eq!(table.row(1), [1.0, 0.0, 1.0, 2.0, 3.0]);
        assert_eq!(table.row(2), [1.0, 1.0, 4.0, 5.0, 6.0]);
        assert_eq!(table.row(3), [0.0; 5]);
        assert_eq!(table.row(49), [0.0; 5]);
    }
}
