use std::fmt;
use std::sync::{mpsc, Arc};
use log::{debug, info, warn};
use crate::audio::{AudioPipeline, DeviceIds, ToneSource};
use crate::config::LineConfig;
use crate::hid::{HidCommand, Protocol};
use super::timer::{RingerCadence, ScheduledTask, LEGACY_RING_OFF, LEGACY_RING_ON};

/// Index of a line in the exchange.
pub type LineId = usize;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineState {
    /// The phone is on-hook. May be ringing.
    Idle,
    /// The phone is off-hook and waiting for digits.
    DialTone,
    /// Digits are being entered.
    Dialing,
    /// A client has taken the call.
    Connected,
    /// The phone is off-hook and the other party hung up.
    Busy,
}

impl fmt::Display for LineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Keypad symbol for a normalized key code: 11 is `*`, 12 is `#`, otherwise the digit `code - 1`.
pub fn digit_symbol(code: u8) -> Option<char> {
    match code {
        1..=10 => char::from_digit(code as u32 - 1, 10),
        11 => Some('*'),
        12 => Some('#'),
        _ => None
    }
}

/// One physical phone port.
pub struct Line {
    pub serial: String,
    pub protocol: Protocol,
    pub device: DeviceIds,
    pub config: LineConfig,
    pub audio: Arc<AudioPipeline>,
    pub(crate) off_hook: bool,
    state: LineState,
    /// Dialer receiving digits. `None` once a number has been handed off.
    pub(crate) dialer: Option<String>,
    pub(crate) digits: String,
    pub(crate) dial_tone: bool,
    pub(crate) ringing: bool,
    /// Type name of the client handling the current call.
    pub(crate) client: Option<String>,
    commands: mpsc::Sender<HidCommand>,
    cadence: Option<RingerCadence>,
    pub(crate) caller_id_task: Option<ScheduledTask>,
}

impl Line {
    pub fn new(serial: impl Into<String>, protocol: Protocol, device: DeviceIds, config: LineConfig, audio: Arc<AudioPipeline>, commands: mpsc::Sender<HidCommand>) -> Self {
        Self {
            serial: serial.into(),
            protocol,
            device,
            config,
            audio,
            off_hook: false,
            state: LineState::Idle,
            dialer: None,
            digits: String::new(),
            dial_tone: false,
            ringing: false,
            client: None,
            commands,
            cadence: None,
            caller_id_task: None,
        }
    }

    pub fn state(&self) -> LineState {
        self.state
    }

    pub fn is_ringing(&self) -> bool {
        self.ringing
    }

    pub fn dialer(&self) -> Option<&str> {
        self.dialer.as_deref()
    }

    pub fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }

    pub fn set_state(&mut self, state: LineState) {
        if self.state == state {
            return
        }
        info!("[{}] {} --> {}", self.serial, self.state, state);
        self.state = state;
    }

    /// Plays a continuous dial tone. Nothing is played for an empty tone.
    pub fn play_dial_tone(&mut self, frequencies: &[f32]) {
        if frequencies.is_empty() {
            return
        }
        self.audio.play(ToneSource::continuous(frequencies));
        self.dial_tone = true;
    }

    pub fn stop_dial_tone(&mut self) {
        if self.dial_tone {
            self.audio.stop();
            self.dial_tone = false;
        }
    }

    pub fn play_busy(&mut self) {
        self.dial_tone = false;
        self.audio.play(ToneSource::busy());
    }

    /// Makes `name` the active dialer with an empty digit buffer.
    pub fn enter_dialer(&mut self, name: &str, dial_tone: &[f32]) {
        debug!("[{}] Dialer '{}'", self.serial, name);
        self.dialer = Some(name.to_owned());
        self.digits.clear();
        self.stop_dial_tone();
        self.play_dial_tone(dial_tone);
    }

    fn send_command(&self, command: HidCommand) {
        if self.commands.send(command).is_err() {
            warn!("[{}] Polling thread is gone; {:?} dropped", self.serial, command);
        }
    }

    /// Switches the hardware ringer on.
    pub(crate) fn start_ringer(&mut self) {
        debug!("[{}] Ringer on", self.serial);
        match self.protocol {
            Protocol::Modern => self.send_command(HidCommand::RingerOn),
            Protocol::Legacy => {
                if self.cadence.is_none() {
                    self.cadence = Some(RingerCadence::start(self.commands.clone(), LEGACY_RING_ON, LEGACY_RING_OFF));
                }
            }
        }
    }

    pub(crate) fn stop_ringer(&mut self) {
        debug!("[{}] Ringer off", self.serial);
        match self.protocol {
            Protocol::Modern => self.send_command(HidCommand::RingerOff),
            Protocol::Legacy => self.cadence = None,
        }
    }

    pub(crate) fn cancel_caller_id(&mut self) {
        if let Some(task) = self.caller_id_task.take() {
            debug!("[{}] Pending Caller-ID cancelled", self.serial);
            task.cancel();
        }
    }
}
