// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Port discovery and reset (C5), and the bring-up sequencer (C6).
//!
//! Try each candidate port in order, validating that the device actually
//! responds before committing to it.

use std::time::Duration;

use crate::error::BringupError;
use crate::frame::{build_command, read_expected_response, CommandBuffer};
use crate::transport::{candidate_ports, FlowControl, Parity, SerialParams, StopBits, TrackerLink};

/// Duration of the reset break pulse.
const BREAK_DURATION: Duration = Duration::from_millis(500);

/// Read deadline while awaiting `RESET` after a break.
const RESET_TIMEOUT: Duration = Duration::from_secs(5);

/// The only firmware version string this driver supports.
const SUPPORTED_FIRMWARE: &str = "024";

/// Result of a successful reset handshake: which candidate responded.
pub struct ResetOutcome {
    pub port_name: String,
}

/// Assert a break on `link` and wait for a CRC-checked `RESET` reply.
fn attempt_reset(link: &mut dyn TrackerLink, buf: &mut CommandBuffer) -> Result<(), BringupError> {
    link.assert_break(BREAK_DURATION)
        .map_err(|e| BringupError::Wire(crate::error::WireError::Unexpected {
            expected: "break assertion to succeed".into(),
            got: e.to_string(),
        }))?;
    std::thread::sleep(BREAK_DURATION + Duration::from_millis(500));
    link.set_timeout(RESET_TIMEOUT)
        .map_err(|e| BringupError::Wire(crate::error::WireError::Unexpected {
            expected: "timeout reconfiguration to succeed".into(),
            got: e.to_string(),
        }))?;
    read_expected_response(link, buf, RESET_TIMEOUT, "RESET")?;
    Ok(())
}

/// Open each candidate port in turn at the power-on default and look for a
/// `RESET` reply to a break; return the first that answers.
///
/// `open_fn` is the seam that turns a candidate path into a live link,
/// kept generic so tests can substitute a [`crate::transport::LoopbackLink`]
/// without touching real hardware.
pub fn discover<F, L>(configured: Option<&str>, mut open_fn: F) -> Result<(L, ResetOutcome), BringupError>
where
    F: FnMut(&str) -> std::io::Result<L>,
    L: TrackerLink,
{
    let mut buf = CommandBuffer::new();
    for candidate in candidate_ports(configured) {
        let mut link = match open_fn(&candidate) {
            Ok(link) => link,
            Err(_) => continue,
        };
        if attempt_reset(&mut link, &mut buf).is_ok() {
            return Ok((
                link,
                ResetOutcome {
                    port_name: candidate,
                },
            ));
        }
    }
    Err(BringupError::NoDevice)
}

fn encode_baud(baud: u32) -> Option<u8> {
    Some(match baud {
        9600 => 0,
        19_200 => 2,
        38_400 => 3,
        57_600 => 4,
        115_200 => 5,
        _ => return None,
    })
}

fn encode_params(params: SerialParams) -> Result<String, BringupError> {
    let baud = encode_baud(params.baud).ok_or(BringupError::UnsupportedBaud(params.baud))?;
    let char_bits = match params.data_bits {
        crate::transport::DataBits::Eight => 0,
        crate::transport::DataBits::Seven => 1,
    };
    let parity = match params.parity {
        Parity::None => 0,
        Parity::Odd => 1,
        Parity::Even => 2,
    };
    let stop = match params.stop_bits {
        StopBits::One => 0,
        StopBits::Two => 1,
    };
    let flow = match params.flow {
        FlowControl::None => 0,
        FlowControl::Hardware => 1,
    };
    Ok(format!("{}{}{}{}{}", baud, char_bits, parity, stop, flow))
}

/// Firmware info surfaced during `VER` negotiation, one entry per informational
/// reply.
#[derive(Debug, Clone)]
pub struct FirmwareInfo {
    pub ver0: String,
    pub ver3: String,
    pub ver4: String,
    pub ver5: String,
}

/// Run the bring-up sequencer: negotiate `COMM`, `INIT`, then
/// `VER 0/3/4/5` with firmware validation. On return, `link` is already
/// reconfigured to `SerialParams::STEADY`. `timeout` is the configured
/// bring-up read deadline (`DriverConfig::bringup_read_timeout_ms`),
/// applied to every exchange in this sequence.
pub fn negotiate(
    link: &mut dyn TrackerLink,
    buf: &mut CommandBuffer,
    timeout: Duration,
) -> Result<FirmwareInfo, BringupError> {
    let comm_args = encode_params(SerialParams::STEADY)?;
    build_command(buf, &format!("COMM {}", comm_args))?;
    crate::frame::send_command(link, buf)?;
    read_expected_response(link, buf, timeout, "OKAY")?;

    std::thread::sleep(Duration::from_millis(200));
    link.configure(SerialParams::STEADY)
        .map_err(|e| BringupError::Wire(crate::error::WireError::Unexpected {
            expected: "link reconfiguration to succeed".into(),
            got: e.to_string(),
        }))?;
    std::thread::sleep(Duration::from_millis(200));

    build_command(buf, "INIT")?;
    crate::frame::send_command(link, buf)?;
    read_expected_response(link, buf, timeout, "OKAY")?;

    let ver0 = query_version(link, buf, "0", timeout)?;
    let ver3 = query_version(link, buf, "3", timeout)?;
    let ver4 = query_version(link, buf, "4", timeout)?;
    let ver5 = query_version(link, buf, "5", timeout)?;

    if !ver5.starts_with(SUPPORTED_FIRMWARE) {
        return Err(BringupError::UnsupportedFirmware {
            expected: SUPPORTED_FIRMWARE,
            got: ver5,
        });
    }

    Ok(FirmwareInfo {
        ver0,
        ver3,
        ver4,
        ver5,
    })
}

fn query_version(
    link: &mut dyn TrackerLink,
    buf: &mut CommandBuffer,
    option: &str,
    timeout: Duration,
) -> Result<String, BringupError> {
    build_command(buf, &format!("VER {}", option))?;
    crate::frame::send_command(link, buf)?;
    let payload = read_expected_response(link, buf, timeout, "")?;
    Ok(String::from_utf8_lossy(&payload).into_owned())
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
    fn encode_params_matches_steady_state_vector() {
        // 115200-8-N-1-NoFlow -> baud 5, char 0, parity 0, stop 0, flow 0.
        assert_eq!(encode_params(SerialParams::STEADY).unwrap(), "50000");
    }

    #[test]
    fn encode_params_rejects_unsupported_baud() {
        let params = SerialParams {
            baud: 4_800,
            ..SerialParams::STEADY
        };
        let err = encode_params(params).unwrap_err();
        assert!(matches!(err, BringupError::UnsupportedBaud(4_800)));
    }

    #[test]
    fn negotiate_sends_comm_init_and_version_queries() {
        let mut link = LoopbackLink::new("mock0");
        ok_response(&mut link, "OKAY"); // COMM
        ok_response(&mut link, "OKAY"); // INIT
        ok_response(&mut link, "0 NDI"); // VER 0
        ok_response(&mut link, "3 NDI"); // VER 3
        ok_response(&mut link, "4 NDI"); // VER 4
        ok_response(&mut link, "024"); // VER 5
        let mut buf = CommandBuffer::new();
        let info = negotiate(&mut link, &mut buf, Duration::from_millis(100)).unwrap();
        assert_eq!(info.ver5, "024");
        let sent = String::from_utf8(link.outbound.clone()).unwrap();
        assert!(sent.contains("COMM 50000"));
        assert!(sent.contains("INIT"));
        assert!(sent.contains("VER 5"));
    }

    #[test]
    fn negotiate_rejects_unsupported_firmware() {
        let mut link = LoopbackLink::new("mock0");
        ok_response(&mut link, "OKAY");
        ok_response(&mut link, "OKAY");
        ok_response(&mut link, "0 NDI");
        ok_response(&mut link, "3 NDI");
        ok_response(&mut link, "4 NDI");
        ok_response(&mut link, "023"); // unsupported firmware revision
        let mut buf = CommandBuffer::new();
        let err = negotiate(&mut link, &mut buf, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, BringupError::UnsupportedFirmware { .. }));
    }

    #[test]
    fn discover_latches_first_responsive_candidate() {
        let result = discover(Some("/dev/ttyUSB0"), |path| {
            let mut link = LoopbackLink::new(path);
            let reset = crate::frame::command_with_crc("RESET");
            link.push_inbound(reset.as_bytes());
            link.push_inbound(b"\r");
            Ok(link)
        });
        let (_, outcome) = result.unwrap();
        assert_eq!(outcome.port_name, "/dev/ttyUSB0");
    }
}
