//! HID transport for the telephone adapter.
//!
//! Two generations of hardware exist. Modern units deliver hook and key changes as
//! async input reports. Legacy ("silver") units only expose a feature report that has
//! to be polled, and any command sent to them changes what the next poll returns,
//! so commands are interleaved with polling on the line's own thread.

use std::sync::mpsc::{self, TryRecvError};
use std::thread;
use std::time::Duration;
use log::{debug, info, warn};
use thread_priority::{set_current_thread_priority, ThreadPriority};
use crate::error::{Error, Result};

pub const VENDOR_ID: u16 = 1766;
pub const PRODUCT_ID: u16 = 49664;

const MODERN_REPORT_LEN: usize = 65;
const LEGACY_REPORT_LEN: usize = 33;

/// How long a modern line blocks on an input report before checking its command queue.
const MODERN_READ_TIMEOUT_MS: i32 = 20;
/// Delay between legacy feature-report polls.
const LEGACY_POLL_INTERVAL: Duration = Duration::from_millis(5);

const fn report<const N: usize>(prefix: &[u8]) -> [u8; N] {
    let mut report = [0u8; N];
    let mut i = 0;
    while i < prefix.len() {
        report[i] = prefix[i];
        i += 1;
    }
    report
}

pub const START_RINGING_REPORT: [u8; MODERN_REPORT_LEN] = report(&[0x00, 0x20, 0x00, 0x00, 0x01, 0x01, 0x03]);
pub const STOP_RINGING_REPORT: [u8; MODERN_REPORT_LEN] = report(&[0x00, 0x20, 0x00, 0x00, 0x01, 0x01, 0x00]);
pub const START_RINGING_LEGACY_REPORT: [u8; LEGACY_REPORT_LEN] = report(&[0x00, 0x04, 0x3d, 0x20, 0x01, 0x30]);
pub const STOP_RINGING_LEGACY_REPORT: [u8; LEGACY_REPORT_LEN] = report(&[0x00, 0x04, 0x3d, 0x20, 0x01, 0x00]);
pub const RESET_LEGACY_REPORT: [u8; LEGACY_REPORT_LEN] = report(&[0x00, 0x04]);
/// Without this the legacy ringer drowns out off-hook detection.
pub const REDUCE_RINGER_SENSITIVITY_LEGACY_REPORT: [u8; LEGACY_REPORT_LEN] = report(&[0x00, 0x04, 0x2f, 0x40, 0x01, 0x14]);

/// Raw byte-level access to one adapter.
pub trait HidTransport: Send {
    fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize>;
    fn send_feature_report(&self, data: &[u8]) -> Result<()>;
    /// Reads one input report. Returns 0 when `timeout_ms` elapses first.
    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize>;
}

impl HidTransport for hidapi::HidDevice {
    fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(hidapi::HidDevice::get_feature_report(self, buf)?)
    }

    fn send_feature_report(&self, data: &[u8]) -> Result<()> {
        Ok(hidapi::HidDevice::send_feature_report(self, data)?)
    }

    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        Ok(hidapi::HidDevice::read_timeout(self, buf, timeout_ms)?)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    Modern,
    /// Older "silver" hardware, polled through 33-byte feature reports.
    Legacy,
}

/// Commands queued for a line's polling thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HidCommand {
    RingerOn,
    RingerOff,
}

/// Hook state and key code decoded from one report. A code of 0 means no key.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HookReport {
    pub off_hook: bool,
    pub code: u8,
}

/// Maps a raw key index to the 1-based keypad code (`1..=10` = digits 0-9, 11 = `*`, 12 = `#`).
pub fn normalize_key(raw: u8) -> u8 {
    let n = raw.wrapping_add(1);
    if n == 11 {
        1
    } else if n > 11 {
        n - 1
    } else {
        n
    }
}

pub fn read_modern_report(report: &[u8]) -> HookReport {
    let off_hook = report.get(24).map_or(false, |b| b & 0x80 == 0x80);
    let code = match (report.get(23), report.get(24)) {
        (Some(1), Some(key)) => normalize_key(key & 0x7f),
        _ => 0
    };
    HookReport { off_hook, code }
}

pub fn read_legacy_report(report: &[u8]) -> HookReport {
    let off_hook = report.get(10) == Some(&0x80);
    let code = match report.get(22) {
        Some(key) if key & 0xc0 == 0xc0 => normalize_key(key ^ 0xc0),
        _ => 0
    };
    HookReport { off_hook, code }
}

/// Probes the adapter, performs the protocol's activation sequence and returns
/// the protocol together with the initial hook state.
pub fn detect(transport: &dyn HidTransport) -> Result<(Protocol, HookReport)> {
    let mut buf = [0u8; MODERN_REPORT_LEN];
    if transport.get_feature_report(&mut buf).is_ok() {
        // Some units stay silent until they receive a stop-ringing report.
        transport.send_feature_report(&STOP_RINGING_REPORT)?;
        return Ok((Protocol::Modern, read_modern_report(&buf)))
    }

    let mut buf = [0u8; LEGACY_REPORT_LEN];
    transport.get_feature_report(&mut buf)
        .map_err(|err| Error::DeviceIo(format!("unrecognized adapter: {}", err)))?;
    transport.send_feature_report(&REDUCE_RINGER_SENSITIVITY_LEGACY_REPORT)?;
    transport.send_feature_report(&RESET_LEGACY_REPORT)?;
    Ok((Protocol::Legacy, read_legacy_report(&buf)))
}

/// Applies a command. Legacy commands are always followed by a reset report.
pub fn send_command(transport: &dyn HidTransport, protocol: Protocol, command: HidCommand) -> Result<()> {
    match (protocol, command) {
        (Protocol::Modern, HidCommand::RingerOn) => transport.send_feature_report(&START_RINGING_REPORT),
        (Protocol::Modern, HidCommand::RingerOff) => transport.send_feature_report(&STOP_RINGING_REPORT),
        (Protocol::Legacy, command) => {
            let report = match command {
                HidCommand::RingerOn => &START_RINGING_LEGACY_REPORT,
                HidCommand::RingerOff => &STOP_RINGING_LEGACY_REPORT,
            };
            transport.send_feature_report(report)?;
            transport.send_feature_report(&RESET_LEGACY_REPORT)
        }
    }
}

/// Owns a line's transport and command queue for the lifetime of its polling thread.
pub struct LinePoller {
    serial: String,
    transport: Box<dyn HidTransport>,
    protocol: Protocol,
    commands: mpsc::Receiver<HidCommand>,
}

impl LinePoller {
    pub fn new(serial: impl Into<String>, transport: Box<dyn HidTransport>, protocol: Protocol, commands: mpsc::Receiver<HidCommand>) -> Self {
        Self {
            serial: serial.into(),
            transport,
            protocol,
            commands,
        }
    }

    /// Sends every queued command. Returns `false` once the queue's senders are gone.
    fn drain_commands(&self) -> Result<bool> {
        loop {
            match self.commands.try_recv() {
                Ok(command) => {
                    debug!("[{}] HID command: {:?}", self.serial, command);
                    send_command(self.transport.as_ref(), self.protocol, command)?;
                },
                Err(TryRecvError::Empty) => return Ok(true),
                Err(TryRecvError::Disconnected) => return Ok(false),
            }
        }
    }

    /// Polls the adapter until an error occurs or the command queue is closed,
    /// invoking `on_change` with every hook/key change.
    pub fn run<F>(self, initial: HookReport, mut on_change: F) -> Result<()>
    where F: FnMut(HookReport) -> Result<()> {
        if let Err(err) = set_current_thread_priority(ThreadPriority::Max) {
            warn!("[{}] Unable to raise polling thread priority: {:?}", self.serial, err);
        }
        info!("[{}] Polling {:?} adapter", self.serial, self.protocol);

        on_change(initial)?;
        let mut current = initial;

        match self.protocol {
            Protocol::Modern => {
                let mut buf = [0u8; 2];
                while self.drain_commands()? {
                    if self.transport.read_timeout(&mut buf, MODERN_READ_TIMEOUT_MS)? == 0 {
                        continue
                    }
                    on_change(HookReport { off_hook: buf[1] == 0x80, code: buf[0] })?;
                }
            },
            Protocol::Legacy => {
                let mut buf = [0u8; LEGACY_REPORT_LEN];
                while self.drain_commands()? {
                    buf.fill(0);
                    self.transport.get_feature_report(&mut buf)?;
                    let next = read_legacy_report(&buf);
                    if next != current {
                        on_change(next)?;
                        current = next;
                    }
                    thread::sleep(LEGACY_POLL_INTERVAL);
                }
            }
        }

        info!("[{}] Command queue closed, polling stopped", self.serial);
        Ok(())
    }
}
