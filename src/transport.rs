// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The serial link (C1) and platform port discovery (C5, enumeration half).
//!
//! `TrackerLink` is the narrow interface the rest of the driver requires
//! from a serial port: write, timed read, break assertion, and baud/framing
//! reconfiguration. The concrete implementation wraps the `serialport`
//! crate; tests substitute [`LoopbackLink`].

use std::io;
use std::time::Duration;

/// Character size, parity, stop bits and flow control, encoded on the wire
/// by `COMM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialParams {
    pub baud: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow: FlowControl,
}

impl SerialParams {
    /// The link's power-on default: 9600-8-N-1-NoFlow.
    pub const INITIAL: Self = Self {
        baud: 9600,
        data_bits: DataBits::Eight,
        parity: Parity::None,
        stop_bits: StopBits::One,
        flow: FlowControl::None,
    };

    /// The negotiated steady-state link: 115200-8-N-1-NoFlow.
    pub const STEADY: Self = Self {
        baud: 115_200,
        data_bits: DataBits::Eight,
        parity: Parity::None,
        stop_bits: StopBits::One,
        flow: FlowControl::None,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Seven,
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Hardware,
}

/// The serial port interface the driver depends on: open, read, write,
/// break assertion, and baud/framing reconfiguration. This trait is the
/// seam the implementation owns, with `SerialPortLink` as the real backing
/// and `LoopbackLink` for tests.
pub trait TrackerLink: Send {
    /// Write the full buffer, blocking until accepted by the OS.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read up to `buf.len()` bytes. Returns `Ok(0)` or
    /// `Err(ErrorKind::TimedOut)` when no data arrived within the
    /// configured read timeout; callers loop on this.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Change the read timeout without touching baud/framing.
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Reconfigure baud rate, character size, parity, stop bits and flow
    /// control.
    fn configure(&mut self, params: SerialParams) -> io::Result<()>;

    /// Assert a line break for `duration`.
    fn assert_break(&mut self, duration: Duration) -> io::Result<()>;

    /// The path or name this link was opened with.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Real serial port, backed by the `serialport` crate.
// ---------------------------------------------------------------------------

/// A [`TrackerLink`] backed by an OS serial port.
pub struct SerialPortLink {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl SerialPortLink {
    /// Open `path` at the link's power-on default (9600-8-N-1-NoFlow) with
    /// the given read timeout.
    pub fn open(path: &str, timeout: Duration) -> io::Result<Self> {
        let port = serialport::new(path, SerialParams::INITIAL.baud)
            .timeout(timeout)
            .data_bits(to_serialport_data_bits(SerialParams::INITIAL.data_bits))
            .parity(to_serialport_parity(SerialParams::INITIAL.parity))
            .stop_bits(to_serialport_stop_bits(SerialParams::INITIAL.stop_bits))
            .flow_control(to_serialport_flow(SerialParams::INITIAL.flow))
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Self {
            port,
            name: path.to_string(),
        })
    }
}

impl TrackerLink for SerialPortLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.port.write_all(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(e),
            Err(e) => Err(e),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn configure(&mut self, params: SerialParams) -> io::Result<()> {
        self.port
            .set_baud_rate(params.baud)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.port
            .set_data_bits(to_serialport_data_bits(params.data_bits))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.port
            .set_parity(to_serialport_parity(params.parity))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.port
            .set_stop_bits(to_serialport_stop_bits(params.stop_bits))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.port
            .set_flow_control(to_serialport_flow(params.flow))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn assert_break(&mut self, duration: Duration) -> io::Result<()> {
        self.port
            .set_break()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        std::thread::sleep(duration);
        self.port
            .clear_break()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn to_serialport_data_bits(d: DataBits) -> serialport::DataBits {
    match d {
        DataBits::Seven => serialport::DataBits::Seven,
        DataBits::Eight => serialport::DataBits::Eight,
    }
}

fn to_serialport_parity(p: Parity) -> serialport::Parity {
    match p {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn to_serialport_stop_bits(s: StopBits) -> serialport::StopBits {
    match s {
        StopBits::One => serialport::StopBits::One,
        StopBits::Two => serialport::StopBits::Two,
    }
}

fn to_serialport_flow(f: FlowControl) -> serialport::FlowControl {
    match f {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::Hardware => serialport::FlowControl::Hardware,
    }
}

// ---------------------------------------------------------------------------
// Port discovery (C5)
// ---------------------------------------------------------------------------

/// Build the ordered list of candidate device paths to probe. If `configured`
/// is set, it is the only candidate.
pub fn candidate_ports(configured: Option<&str>) -> Vec<String> {
    if let Some(p) = configured {
        return vec![p.to_string()];
    }
    platform_candidates()
}

#[cfg(target_os = "windows")]
fn platform_candidates() -> Vec<String> {
    (1..=256).map(|i| format!("COM{}", i)).collect()
}

#[cfg(target_os = "linux")]
fn platform_candidates() -> Vec<String> {
    glob_dev(&["ttyS", "ttyUSB"])
}

#[cfg(target_os = "macos")]
fn platform_candidates() -> Vec<String> {
    glob_dev(&["tty", "cu"])
}

#[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
fn platform_candidates() -> Vec<String> {
    Vec::new()
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn glob_dev(prefixes: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    if let Ok(entries) = std::fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if prefixes.iter().any(|p| name.starts_with(p)) {
                    out.push(format!("/dev/{}", name));
                }
            }
        }
    }
    out.sort();
    out
}

// ---------------------------------------------------------------------------
// Loopback link for tests.
// ---------------------------------------------------------------------------

/// An in-memory [`TrackerLink`] for tests: pre-load `inbound` with scripted
/// device replies, then inspect `outbound` for what the driver sent.
#[derive(Debug, Default)]
pub struct LoopbackLink {
    pub inbound: std::collections::VecDeque<u8>,
    pub outbound: Vec<u8>,
    pub name: String,
    pub breaks_asserted: u32,
    pub current_params: Option<SerialParams>,
    pub timeout: Duration,
}

impl LoopbackLink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Queue bytes the "device" will send back on the next reads.
    pub fn push_inbound(&mut self, data: &[u8]) {
        self.inbound.extend(data.iter().copied());
    }
}

impl TrackerLink for LoopbackLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.outbound.extend_from_slice(data);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.inbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data queued"));
        }
        let mut n = 0;
        while n < buf.len() {
            match self.inbound.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn configure(&mut self, params: SerialParams) -> io::Result<()> {
        self.current_params = Some(params);
        Ok(())
    }

    fn assert_break(&mut self, _duration: Duration) -> io::Result<()> {
        self.breaks_asserted += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_ports_honors_configured_override() {
        let candidates = candidate_ports(Some("/dev/ttyUSB7"));
        assert_eq!(candidates, vec!["/dev/ttyUSB7".to_string()]);
    }

    #[test]
    fn loopback_link_echoes_queued_inbound_and_records_outbound() {
        let mut link = LoopbackLink::new("mock0");
        link.push_inbound(b"RESETA896\r");
        let mut buf = [0u8; 32];
        let n = link.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"RESETA896\r");
        link.write_all(b"COMM 50000\r").unwrap();
        assert_eq!(link.outbound, b"COMM 50000\r");
    }

    #[test]
    fn loopback_link_times_out_when_empty() {
        let mut link = LoopbackLink::new("mock0");
        let mut buf = [0u8; 8];
        let err = link.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
