// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The top-level driver (C10): control surface, cooperative tick loop, and
//! published state. A blocking worker owns the serial link; a cheaply
//! `Clone`-able handle talks to it over an `mpsc` mailbox, and live state
//! is read through an `arc_swap::ArcSwap` snapshot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, oneshot};

use crate::bringup;
use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::frame::CommandBuffer;
use crate::registry::{Pose, StrayMarkerTable, ToolRegistry};
use crate::state_machine;
use crate::tracking;
use crate::transport::{SerialPortLink, TrackerLink};

/// Events surfaced to consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Connected(String),
    Tracking(bool),
    ToolsUpdated,
    /// One per informational `VER` reply during bring-up.
    FirmwareInfo { query: &'static str, value: String },
}

/// The driver's connection lifecycle: free -> initialize -> query ->
/// enable -> track, realized as one driver-wide state rather than
/// per-port-handle, since bring-up proceeds as a single ordered sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    /// Opening the serial link (discovery candidate scan).
    Opening,
    /// Break asserted, awaiting the device's `RESET` reply.
    Resetting,
    /// `COMM`/`INIT`/`VER` negotiation and `PHSR` tool enumeration/enable
    /// under way.
    Initializing,
    /// Connected, tools enumerated, tracking not yet started.
    Ready,
    /// `TSTART` succeeded; the tick loop is issuing `TX`.
    Tracking,
}

/// A single tool's published, per-tick state.
#[derive(Debug, Clone)]
pub struct ToolSnapshot {
    pub name: String,
    pub serial_number: String,
    pub tooltip_pose: Pose,
    pub marker_pose: Pose,
    pub frame_number: u32,
    pub error_rms: f64,
}

/// The driver's published state, swapped atomically once per completed
/// tick.
#[derive(Debug, Clone, Default)]
pub struct DriverState {
    pub session_state: SessionState,
    pub port_name: String,
    pub is_tracking: bool,
    pub track_stray_markers: bool,
    pub tool_names: Vec<String>,
    pub tools: Vec<ToolSnapshot>,
    pub stray_markers: StrayMarkerTable,
}

enum DriverCommand {
    Connect {
        port: Option<String>,
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
    Beep {
        count: u8,
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
    ToggleTracking {
        on: bool,
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
    ToggleStray {
        on: bool,
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
}

/// A cheaply cloneable handle to a running [`Driver`].
#[derive(Clone)]
pub struct DriverHandle {
    command_tx: mpsc::Sender<DriverCommand>,
    state: Arc<ArcSwap<DriverState>>,
}

impl DriverHandle {
    /// Read the most recently published state snapshot.
    pub fn snapshot(&self) -> Arc<DriverState> {
        self.state.load_full()
    }

    /// `connect(port?)`. `port` overrides configured discovery.
    pub async fn connect(&self, port: Option<String>) -> Result<(), DriverError> {
        let (reply, rx) = oneshot::channel();
        self.send(DriverCommand::Connect { port, reply }).await?;
        rx.await.map_err(|_| DriverError::NotConnected)?
    }

    pub async fn disconnect(&self) -> Result<(), DriverError> {
        let (reply, rx) = oneshot::channel();
        self.send(DriverCommand::Disconnect { reply }).await?;
        rx.await.map_err(|_| DriverError::NotConnected)?
    }

    /// `beep(n)`, `n` in `1..=9`.
    pub async fn beep(&self, count: u8) -> Result<(), DriverError> {
        if !(1..=9).contains(&count) {
            return Err(DriverError::InvalidBeepCount(count));
        }
        let (reply, rx) = oneshot::channel();
        self.send(DriverCommand::Beep { count, reply }).await?;
        rx.await.map_err(|_| DriverError::NotConnected)?
    }

    pub async fn toggle_tracking(&self, on: bool) -> Result<(), DriverError> {
        let (reply, rx) = oneshot::channel();
        self.send(DriverCommand::ToggleTracking { on, reply }).await?;
        rx.await.map_err(|_| DriverError::NotConnected)?
    }

    pub async fn toggle_stray(&self, on: bool) -> Result<(), DriverError> {
        let (reply, rx) = oneshot::channel();
        self.send(DriverCommand::ToggleStray { on, reply }).await?;
        rx.await.map_err(|_| DriverError::NotConnected)?
    }

    /// `report_stray_markers()`: a pure read of the last
    /// completed tick's published state, no wire round trip required.
    pub fn report_stray_markers(&self) -> StrayMarkerTable {
        self.snapshot().stray_markers
    }

    async fn send(&self, command: DriverCommand) -> Result<(), DriverError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| DriverError::NotConnected)
    }
}

/// Number of times `beep` retries on a `0`-prefixed "device busy" reply
/// before giving up.
const BEEP_BUSY_RETRIES: u32 = 20;

/// The driver's cooperative worker. Owns the serial link, the
/// tool registry, and the command buffer; runs the fixed-period tick loop.
pub struct Driver {
    config: DriverConfig,
    registry: ToolRegistry,
    link: Option<Box<dyn TrackerLink>>,
    buf: CommandBuffer,
    command_rx: mpsc::Receiver<DriverCommand>,
    state: Arc<ArcSwap<DriverState>>,
    events_tx: mpsc::Sender<DriverEvent>,
    is_tracking: bool,
    track_stray_markers: bool,
    port_name: String,
    last_stray_markers: StrayMarkerTable,
    session_state: SessionState,
}

impl Driver {
    /// Build a driver, the handle used to talk to it, and the event
    /// stream, seeded from `config.track_stray_markers`.
    pub fn new(config: DriverConfig) -> (Self, DriverHandle, mpsc::Receiver<DriverEvent>) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (events_tx, events_rx) = mpsc::channel(32);
        let state = Arc::new(ArcSwap::new(Arc::new(DriverState::default())));
        let track_stray_markers = config.track_stray_markers;
        let driver = Self {
            config,
            registry: ToolRegistry::new(),
            link: None,
            buf: CommandBuffer::new(),
            command_rx,
            state: state.clone(),
            events_tx,
            is_tracking: false,
            track_stray_markers,
            port_name: String::new(),
            last_stray_markers: StrayMarkerTable::empty(),
            session_state: SessionState::Disconnected,
        };
        let handle = DriverHandle { command_tx, state };
        (driver, handle, events_rx)
    }

    fn emit(&self, event: DriverEvent) {
        let _ = self.events_tx.try_send(event);
    }

    /// Run the tick loop on a dedicated blocking thread.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.run_blocking())
    }

    fn run_blocking(mut self) {
        let period = Duration::from_millis(self.config.tick_period_ms);
        loop {
            let tick_start = Instant::now();
            self.drain_mailbox();
            if self.is_tracking {
                self.run_tracking_tick();
            }
            self.publish_state();

            let elapsed = tick_start.elapsed();
            if elapsed < period {
                std::thread::sleep(period - elapsed);
            }
            // Else the deadline already passed: proceed immediately and
            // drop the overrun tick rather than accumulate a backlog.
        }
    }

    fn drain_mailbox(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                DriverCommand::Connect { port, reply } => {
                    let result = self.do_connect(port);
                    let _ = reply.send(result);
                }
                DriverCommand::Disconnect { reply } => {
                    let result = self.do_disconnect();
                    let _ = reply.send(result);
                }
                DriverCommand::Beep { count, reply } => {
                    let result = self.do_beep(count);
                    let _ = reply.send(result);
                }
                DriverCommand::ToggleTracking { on, reply } => {
                    let result = self.do_toggle_tracking(on);
                    let _ = reply.send(result);
                }
                DriverCommand::ToggleStray { on, reply } => {
                    self.track_stray_markers = on;
                    if !on {
                        self.last_stray_markers.clear();
                    }
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }

    fn do_connect(&mut self, port: Option<String>) -> Result<(), DriverError> {
        let configured = port.or_else(|| self.config.serial_port.clone());
        let timeout = Duration::from_millis(self.config.bringup_read_timeout_ms);

        // Opening: scanning candidate ports. discover() also drives the
        // break+RESET handshake (Resetting) internally for each candidate
        // it opens; there is no external hook mid-scan, so the state only
        // becomes externally observable once the whole call settles.
        self.session_state = SessionState::Opening;
        let discovery = bringup::discover(configured.as_deref(), |path| {
            SerialPortLink::open(path, timeout)
        });
        let (mut link, outcome): (Box<dyn TrackerLink>, _) = match discovery {
            Ok((link, outcome)) => (Box::new(link), outcome),
            Err(e) => {
                self.session_state = SessionState::Disconnected;
                self.emit(DriverEvent::Connected(String::new()));
                return Err(e.into());
            }
        };

        // Resetting completed as part of discover(); move on to negotiation.
        self.session_state = SessionState::Initializing;
        let firmware = match bringup::negotiate(link.as_mut(), &mut self.buf, timeout) {
            Ok(firmware) => firmware,
            Err(e) => {
                self.session_state = SessionState::Disconnected;
                self.emit(DriverEvent::Connected(String::new()));
                return Err(e.into());
            }
        };
        for (query, value) in [
            ("0", &firmware.ver0),
            ("3", &firmware.ver3),
            ("4", &firmware.ver4),
            ("5", &firmware.ver5),
        ] {
            self.emit(DriverEvent::FirmwareInfo {
                query,
                value: value.clone(),
            });
        }

        // Passive-tool definitions (PHRQ + chunked PVWR) must load first:
        // PHRQ allocates a fresh port handle for each passive tool, which
        // only then shows up in the PHSR 02/03 sweep below that
        // initializes and enables it.
        if let Err(e) = self.load_passive_tool_definitions(link.as_mut()) {
            self.session_state = SessionState::Disconnected;
            self.emit(DriverEvent::Connected(String::new()));
            return Err(e);
        }

        let enabled = match state_machine::enumerate_and_enable(
            link.as_mut(),
            &mut self.buf,
            timeout,
            &mut self.registry,
            self.config.max_zero_serial_retries,
        ) {
            Ok(enabled) => enabled,
            Err(e) => {
                self.session_state = SessionState::Disconnected;
                self.emit(DriverEvent::Connected(String::new()));
                return Err(e.into());
            }
        };

        self.link = Some(link);
        self.port_name = outcome.port_name.clone();
        self.session_state = SessionState::Ready;
        self.emit(DriverEvent::Connected(self.port_name.clone()));
        if !enabled.is_empty() {
            self.emit(DriverEvent::ToolsUpdated);
        }
        Ok(())
    }

    fn load_passive_tool_definitions(
        &mut self,
        link: &mut dyn TrackerLink,
    ) -> Result<(), DriverError> {
        let timeout = Duration::from_millis(self.config.bringup_read_timeout_ms);
        let tool_configs = self.config.tools.clone();
        for tool_config in &tool_configs {
            let Some(path) = self.config.resolve_definition(tool_config) else {
                continue;
            };
            let metadata = std::fs::metadata(&path).map_err(|e| {
                DriverError::Bringup(crate::error::BringupError::DefinitionIo {
                    path: path.display().to_string(),
                    source: std::sync::Arc::new(e),
                })
            })?;
            if metadata.len() > state_machine::MAX_DEFINITION_BYTES {
                tracing::warn!(
                    path = %path.display(),
                    size = metadata.len(),
                    "tool definition exceeds 960 bytes, skipping upload for this tool",
                );
                continue;
            }
            let rom = std::fs::read(&path).map_err(|e| {
                DriverError::Bringup(crate::error::BringupError::DefinitionIo {
                    path: path.display().to_string(),
                    source: std::sync::Arc::new(e),
                })
            })?;
            let handle = state_machine::request_passive_handle(link, &mut self.buf, timeout)?;
            state_machine::upload_definition(link, &mut self.buf, timeout, &handle, &rom)?;
            let id = self.registry.add_tool(
                &tool_config.name,
                &tool_config.serial_number,
                Some(path),
            )?;
            self.registry.assign_port_handle(id, &handle);
            if let Some(tool) = self.registry.get_mut(id) {
                tool.tooltip_offset = tool_config.tooltip_offset;
            }
        }
        Ok(())
    }

    fn do_disconnect(&mut self) -> Result<(), DriverError> {
        self.link = None;
        self.is_tracking = false;
        self.port_name.clear();
        self.session_state = SessionState::Disconnected;
        self.emit(DriverEvent::Connected(String::new()));
        Ok(())
    }

    fn do_beep(&mut self, count: u8) -> Result<(), DriverError> {
        let Some(link) = self.link.as_mut() else {
            return Err(DriverError::NotConnected);
        };
        let timeout = Duration::from_millis(self.config.steady_read_timeout_ms);
        for _ in 0..BEEP_BUSY_RETRIES {
            crate::frame::build_command(&mut self.buf, &format!("BEEP {}", count))?;
            crate::frame::send_command(link.as_mut(), &self.buf)?;
            let payload = crate::frame::read_response(link.as_mut(), &mut self.buf, timeout)?;
            if payload.starts_with(b"1") {
                return Ok(());
            }
            if payload.starts_with(b"0") {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            return Err(crate::error::WireError::Unexpected {
                expected: "\"0\" or \"1\"".into(),
                got: String::from_utf8_lossy(&payload).into_owned(),
            }
            .into());
        }
        Err(crate::error::WireError::Timeout.into())
    }

    fn do_toggle_tracking(&mut self, on: bool) -> Result<(), DriverError> {
        let Some(link) = self.link.as_mut() else {
            return Err(DriverError::NotConnected);
        };
        let timeout = Duration::from_millis(self.config.steady_read_timeout_ms);
        if on {
            crate::frame::build_command(&mut self.buf, "TSTART 80")?;
        } else {
            crate::frame::build_command(&mut self.buf, "TSTOP")?;
        }
        crate::frame::send_command(link.as_mut(), &self.buf)?;
        crate::frame::read_expected_response(link.as_mut(), &mut self.buf, timeout, "OKAY")?;
        std::thread::sleep(Duration::from_millis(500));
        self.is_tracking = on;
        self.session_state = if on {
            SessionState::Tracking
        } else {
            SessionState::Ready
        };
        self.emit(DriverEvent::Tracking(on));
        Ok(())
    }

    fn run_tracking_tick(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let timeout = Duration::from_millis(self.config.steady_read_timeout_ms);
        match tracking::tick(
            link.as_mut(),
            &mut self.buf,
            timeout,
            &mut self.registry,
            self.track_stray_markers,
        ) {
            Ok(frame) => {
                if let Some(table) = frame.stray_markers {
                    self.last_stray_markers = table;
                }
            }
            Err(_) => {
                // Timeout, bad CRC, or framing error: drop this tick.
            }
        }
    }

    fn publish_state(&mut self) {
        let tools: Vec<ToolSnapshot> = self
            .registry
            .iter()
            .map(|tool| ToolSnapshot {
                name: tool.name.clone(),
                serial_number: tool.serial_number.clone(),
                tooltip_pose: tool.tooltip_pose,
                marker_pose: tool.marker_pose,
                frame_number: tool.frame_number,
                error_rms: tool.error_rms,
            })
            .collect();
        let state = DriverState {
            session_state: self.session_state,
            port_name: self.port_name.clone(),
            is_tracking: self.is_tracking,
            track_stray_markers: self.track_stray_markers,
            tool_names: self.registry.tool_names(),
            tools,
            stray_markers: self.last_stray_markers,
        };
        self.state.store(Arc::new(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;

    // Boundary: beep(0) and beep(10) are rejected before any wire traffic;
    // beep(1) and beep(9) are accepted by the range check.
    #[tokio::test]
    async fn beep_rejects_out_of_range_counts() {
        let (_driver, handle, _events) = Driver::new(DriverConfig::default());
        for count in [0u8, 10] {
            let err = handle.beep(count).await.unwrap_err();
            assert!(matches!(err, DriverError::InvalidBeepCount(c) if c == count));
        }
    }

    #[test]
    fn default_state_has_no_tools_and_is_not_tracking() {
        let (_driver, handle, _events) = Driver::new(DriverConfig::default());
        let snapshot = handle.snapshot();
        assert!(!snapshot.is_tracking);
        assert!(snapshot.tool_names.is_empty());
        assert_eq!(snapshot.stray_markers.row(0), [0.0; 5]);
        assert_eq!(snapshot.session_state, SessionState::Disconnected);
    }

    // do_toggle_tracking drives session_state between Ready and Tracking;
    // it requires a connected link but not a full bring-up.
    #[test]
    fn toggle_tracking_drives_session_state_between_ready_and_tracking() {
        use crate::transport::LoopbackLink;

        let (mut driver, _handle, _events) = Driver::new(DriverConfig::default());
        driver.session_state = SessionState::Ready;

        let mut link = LoopbackLink::new("mock0");
        link.push_inbound(crate::frame::command_with_crc("OKAY").as_bytes());
        link.push_inbound(b"\r");
        driver.link = Some(Box::new(link));
        driver.do_toggle_tracking(true).unwrap();
        assert_eq!(driver.session_state, SessionState::Tracking);
        assert!(driver.is_tracking);

        let mut link = LoopbackLink::new("mock0");
        link.push_inbound(crate::frame::command_with_crc("OKAY").as_bytes());
        link.push_inbound(b"\r");
        driver.link = Some(Box::new(link));
        driver.do_toggle_tracking(false).unwrap();
        assert_eq!(driver.session_state, SessionState::Ready);
        assert!(!driver.is_tracking);
    }

    #[test]
    fn disconnect_resets_session_state() {
        let (mut driver, _handle, _events) = Driver::new(DriverConfig::default());
        driver.session_state = SessionState::Tracking;
        driver.do_disconnect().unwrap();
        assert_eq!(driver.session_state, SessionState::Disconnected);
    }

    // Boundary: beep(1) and beep(9) succeed once the device replies "1".
    #[test]
    fn do_beep_succeeds_on_one_reply() {
        use crate::transport::LoopbackLink;

        let (mut driver, _handle, _events) = Driver::new(DriverConfig::default());

        for count in [1u8, 9] {
            driver.link = Some({
                let mut link = LoopbackLink::new("mock0");
                let full = crate::frame::command_with_crc("1");
                link.push_inbound(full.as_bytes());
                link.push_inbound(b"\r");
                Box::new(link)
            });
            driver.do_beep(count).unwrap();
        }
    }

    // A "0"-prefixed reply means the device was busy; the driver retries
    // until a "1" reply arrives.
    #[test]
    fn do_beep_retries_on_busy_reply() {
        use crate::transport::LoopbackLink;

        let (mut driver, _handle, _events) = Driver::new(DriverConfig::default());
        let mut link = LoopbackLink::new("mock0");
        link.push_inbound(crate::frame::command_with_crc("0").as_bytes());
        link.push_inbound(b"\r");
        link.push_inbound(crate::frame::command_with_crc("1").as_bytes());
        link.push_inbound(b"\r");
        driver.link = Some(Box::new(link));
        driver.do_beep(5).unwrap();
    }
}
