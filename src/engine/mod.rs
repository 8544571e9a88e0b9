//! The telephone exchange: lines, inbound offers and registered clients,
//! all owned by one [`Exchange`] behind one lock.

mod dialer;
mod line;
mod ring;
mod timer;

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::time::Duration;
use log::{debug, info, warn};
use crate::audio::{AudioPipeline, CallerIdAssets, DeviceIds, ToneSource};
use crate::clients::*;
use crate::config::{ClientMode, HidphoneConfig};
use crate::error::{Error, Result};
use crate::hid::{HidCommand, HookReport, Protocol};

pub use self::dialer::*;
pub use self::line::*;
pub use self::ring::*;
pub use self::timer::*;

/// Delay between the first ring and the Caller-ID burst.
pub const CALLER_ID_DELAY: Duration = Duration::from_millis(2250);

pub type SharedExchange = Arc<Mutex<Exchange>>;

pub struct Exchange {
    config: HidphoneConfig,
    lines: Vec<Line>,
    /// Live offers in arrival order.
    offers: Vec<RingOffer>,
    clients: HashMap<String, Client>,
    dialers: DialerTable,
    caller_id: Arc<CallerIdAssets>,
    caller_id_delay: Duration,
    next_connection: ConnectionId,
    /// Handle given to scheduled tasks.
    me: Weak<Mutex<Exchange>>,
}

impl Exchange {
    pub fn new(config: HidphoneConfig, caller_id: CallerIdAssets) -> SharedExchange {
        let mut clients = HashMap::new();
        clients.insert(DIALER_CLIENT.to_owned(), Client::Dialer);
        for (name, player) in &config.players {
            clients.insert(name.clone(), Client::Player(Player { directory: player.directory.clone() }));
        }
        let dialers = DialerTable::new(config.dialers.clone());

        Arc::new_cyclic(|me| Mutex::new(Self {
            config,
            lines: Vec::new(),
            offers: Vec::new(),
            clients,
            dialers,
            caller_id: Arc::new(caller_id),
            caller_id_delay: CALLER_ID_DELAY,
            next_connection: 1,
            me: me.clone(),
        }))
    }

    #[cfg(test)]
    pub(crate) fn set_caller_id_delay(&mut self, delay: Duration) {
        self.caller_id_delay = delay;
    }

    pub fn add_line(&mut self, serial: &str, protocol: Protocol, device: DeviceIds, audio: Arc<AudioPipeline>, commands: mpsc::Sender<HidCommand>) -> LineId {
        let config = self.config.line(serial);
        info!("[{}] Line added ({:?}, dialer '{}', Caller-ID {:?})", serial, protocol, config.dialer, config.caller_id);
        self.lines.push(Line::new(serial, protocol, device, config, audio, commands));
        self.lines.len() - 1
    }

    pub fn line(&self, id: LineId) -> Option<&Line> {
        self.lines.get(id)
    }

    pub fn is_registered(&self, client: &str) -> bool {
        self.clients.contains_key(client)
    }

    /// Applies a hook/key report from a line's polling thread.
    pub fn on_hid_change(&mut self, id: LineId, report: HookReport) -> Result<()> {
        let Some(line) = self.lines.get(id) else {
            warn!("HID report for unknown line {}", id);
            return Ok(())
        };
        match (report.off_hook, line.off_hook) {
            (true, false) => self.off_hook(id)?,
            (false, true) => self.on_hook(id),
            _ => {}
        }
        if report.code > 0 && self.lines[id].dialer.is_some() {
            self.dial(id, report.code)?;
        }
        Ok(())
    }

    fn off_hook(&mut self, id: LineId) -> Result<()> {
        let line = &mut self.lines[id];
        line.off_hook = true;
        debug!("[{}] Off-hook", line.serial);
        line.audio.stop();
        self.silence_line(id);

        if let Some(offer) = self.answer(id) {
            let line = &mut self.lines[id];
            match self.clients.get_mut(&offer.client) {
                Some(client) => {
                    line.client = Some(offer.client.clone());
                    line.dialer = None;
                    let data = AnswerData { id: offer.id.clone(), device: line.device.clone(), connection: offer.connection };
                    match client.answer(id, line, data) {
                        Ok(()) => info!("[{}] Answering call '{}' from client {}", line.serial, offer.id, offer.client),
                        Err(err) => {
                            warn!("[{}] Unable to answer '{}': {}", line.serial, offer.id, err);
                            line.client = None;
                        }
                    }
                },
                None => info!("[{}] Client {} left before '{}' was answered", line.serial, offer.client, offer.id),
            }
        }

        let line = &mut self.lines[id];
        if line.client.is_none() {
            let rule = self.dialers.rule(&line.config.dialer)?;
            line.enter_dialer(&rule.name, &rule.dial_tone);
            line.set_state(LineState::DialTone);
        }
        Ok(())
    }

    fn on_hook(&mut self, id: LineId) {
        let line = &mut self.lines[id];
        line.off_hook = false;
        line.digits.clear();
        line.dialer = None;
        line.dial_tone = false;
        line.audio.stop();
        debug!("[{}] On-hook", line.serial);

        if let Some(name) = line.client.take() {
            if let Some(client) = self.clients.get_mut(&name) {
                client.end(id);
            }
        }
        line.set_state(LineState::Idle);

        let waiting = self.offers.iter()
            .find(|offer| offer.lines.contains(&id))
            .map(|offer| offer.caller_id.clone());
        if let Some(caller_id) = waiting {
            self.ring_line(id, caller_id);
        }
    }

    fn dial(&mut self, id: LineId, code: u8) -> Result<()> {
        let Some(symbol) = digit_symbol(code) else {
            debug!("Ignoring key code {}", code);
            return Ok(())
        };
        let line = &mut self.lines[id];
        let Some(dialer) = line.dialer.clone() else { return Ok(()) };

        line.stop_dial_tone();
        if line.state() == LineState::DialTone {
            line.set_state(LineState::Dialing);
        }
        line.digits.push(symbol);
        debug!("[{}] Dialpad: {} ({})", line.serial, symbol, line.digits);

        let mut rule = self.dialers.rule(&dialer)?;
        if matches!(rule.action, DialerAction::Switch) && self.dialers.contains(&line.digits) {
            rule = self.dialers.rule(&line.digits)?;
            line.enter_dialer(&rule.name, &rule.dial_tone);
            line.set_state(LineState::DialTone);
        }
        if line.digits.is_empty() {
            return Ok(())
        }

        if let Some((client, number)) = rule.resolve(&line.digits) {
            self.call(id, &client, number)?;
        }
        Ok(())
    }

    /// Hands the line to `client_type`. A missing or busy client gets a busy tone and
    /// leaves the line as it was.
    fn call(&mut self, id: LineId, client_type: &str, number: String) -> Result<()> {
        let line = &mut self.lines[id];
        let previous_dialer = line.dialer.take().unwrap_or_default();

        let Some(client) = self.clients.get_mut(client_type) else {
            info!("[{}] Calling {} on client {} via dialer {} failed because the client does not exist", line.serial, number, client_type, previous_dialer);
            line.play_busy();
            return Ok(())
        };
        if client.in_use() {
            info!("[{}] Calling {} on client {} via dialer {} failed because the client is busy", line.serial, number, client_type, previous_dialer);
            line.play_busy();
            return Ok(())
        }

        line.client = Some(client_type.to_owned());
        let data = CallData { number: number.clone(), device: line.device.clone() };
        match client.call(id, line, &mut self.dialers, data, &previous_dialer) {
            Ok(()) => {
                info!("[{}] Calling {} on client {} via dialer {}", line.serial, number, client_type, previous_dialer);
                Ok(())
            },
            Err(Error::Routing(reason)) => {
                info!("[{}] Calling {} on client {} failed: {}", line.serial, number, client_type, reason);
                line.client = None;
                line.play_busy();
                Ok(())
            },
            Err(err) => Err(err)
        }
    }

    /// Registers a network connection under `client_type`.
    ///
    /// Pool clients gain a connection. Anything else is replaced if the current
    /// instance agrees to disconnect.
    pub fn register(&mut self, client_type: &str, outbound: mpsc::Sender<Outbound>) -> Result<ConnectionId> {
        let mode = self.config.client_mode(client_type);
        let id = self.next_connection;

        let replaced = match self.clients.get_mut(client_type) {
            Some(Client::Pool(connections)) if mode == ClientMode::Pool => {
                connections.push(Connection::new(id, outbound));
                self.next_connection += 1;
                info!("Client {} joined pool as connection {} ({} total)", client_type, id, connections.len());
                return Ok(id)
            },
            Some(existing) => {
                if !existing.disconnect() {
                    return Err(Error::Rejected("unable to register as this client type".into()))
                }
                existing.connection_ids()
            },
            None => Vec::new()
        };
        for old in replaced {
            self.disconnect(client_type, old);
        }

        let connection = Connection::new(id, outbound);
        let client = match mode {
            ClientMode::Single => Client::Peer(connection),
            ClientMode::Pool => Client::Pool(vec![connection]),
        };
        self.clients.insert(client_type.to_owned(), client);
        self.next_connection += 1;
        info!("Client {} registered as connection {}", client_type, id);
        Ok(id)
    }

    /// Cleans up after a connection: its offers are withdrawn, its line is
    /// released as if the peer hung up, and the client is unregistered once empty.
    pub fn disconnect(&mut self, client_type: &str, connection: ConnectionId) {
        self.withdraw_offers(client_type, connection);

        let Some(client) = self.clients.get_mut(client_type) else { return };
        if !client.has_connection(connection) {
            return
        }
        let line = client.remove_connection(connection);
        if matches!(client, Client::Peer(_)) || client.is_vacant() {
            self.clients.remove(client_type);
            info!("Client {} unregistered", client_type);
        } else {
            info!("Connection {} left pool {}", connection, client_type);
        }
        if let Some(line) = line {
            self.remote_hang_up(line);
        }
    }

    /// The far end ended the call on `line`.
    fn remote_hang_up(&mut self, id: LineId) {
        let line = &mut self.lines[id];
        line.client = None;
        if line.off_hook {
            line.set_state(LineState::Busy);
            line.play_busy();
        }
    }

    /// Applies a control message received on `connection`.
    pub fn handle(&mut self, client_type: &str, connection: ConnectionId, message: Inbound) -> Result<()> {
        match message {
            Inbound::Ring(request) => {
                let offer = RingOffer::new(request.id, request.caller_id, client_type, connection);
                self.start_ringing(offer);
            },
            Inbound::StopRinging(id) => {
                if !self.stop_ringing(client_type, connection, &id) {
                    debug!("stopRinging for unknown offer '{}' from {}", id, client_type);
                }
            },
            Inbound::Dialing(dialing) => {
                let line = self.owned_line(client_type, connection)
                    .ok_or_else(|| Error::Rejected("dialing without a line".into()))?;
                let line = &self.lines[line];
                if dialing {
                    line.audio.play(ToneSource::ringback());
                } else {
                    line.audio.stop();
                }
            },
            Inbound::End => {
                let line = self.owned_line(client_type, connection)
                    .ok_or_else(|| Error::Rejected("end without a line".into()))?;
                if let Some(client) = self.clients.get_mut(client_type) {
                    client.release(line);
                }
                info!("[{}] Remote party ended the call", self.lines[line].serial);
                self.remote_hang_up(line);
            },
        }
        Ok(())
    }

    fn owned_line(&self, client_type: &str, connection: ConnectionId) -> Option<LineId> {
        self.clients.get(client_type)?.line_of(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use crate::config::ModemConfig;
    use crate::error::lock;

    const CONFIG: &str = r#"
        secret = "s3cret"

        [dialers.default]
        dial-tone = [350, 440]

        [dialers.1]
        dial-tone = [350, 440]
        client = "ws1"
        client-number-format = "phone"
        client-number-region = "US"

        [dialers.2]
        client = "ws1"
        client-number-format = '9(\d{3})'

        [dialers.3]
        map = { "0" = ["dialer", "1"], "5" = ["nobody", "5"] }

        [dialers.4]
        client = "pool"
        client-number-format = '(\d)'

        [lines.default]
        caller-id = "after-first-ring"

        [lines.WHITE]
        ring-list-type = "whitelist"
        ring-list = [["ws2"]]

        [lines.EARLY]
        caller-id = "before-first-ring"

        [lines.BROKEN]
        dialer = "missing"

        [clients.pool]
        mode = "pool"
    "#;

    struct Harness {
        exchange: SharedExchange,
        commands: Vec<mpsc::Receiver<HidCommand>>,
    }

    impl Harness {
        fn new(serials: &[&str]) -> Self {
            let config = HidphoneConfig::parse(CONFIG).unwrap();
            let assets = CallerIdAssets::load(&ModemConfig::default()).unwrap();
            let exchange = Exchange::new(config, assets);
            let mut commands = Vec::new();
            {
                let mut ex = lock(&exchange);
                for serial in serials {
                    let (tx, rx) = mpsc::channel();
                    ex.add_line(serial, Protocol::Modern, DeviceIds { serial: serial.to_string(), ..Default::default() }, Arc::new(AudioPipeline::new()), tx);
                    commands.push(rx);
                }
            }
            Self { exchange, commands }
        }

        fn ex(&self) -> std::sync::MutexGuard<'_, Exchange> {
            lock(&self.exchange)
        }

        fn connect(&self, client: &str) -> (ConnectionId, mpsc::Receiver<Outbound>) {
            let (tx, rx) = mpsc::channel();
            let id = self.ex().register(client, tx).unwrap();
            (id, rx)
        }

        fn hook(&self, line: LineId, off_hook: bool) {
            self.ex().on_hid_change(line, HookReport { off_hook, code: 0 }).unwrap();
        }

        fn press(&self, line: LineId, digits: &str) {
            for c in digits.chars() {
                let code = match c {
                    '*' => 11,
                    '#' => 12,
                    d => d.to_digit(10).unwrap() as u8 + 1,
                };
                self.ex().on_hid_change(line, HookReport { off_hook: true, code }).unwrap();
                self.ex().on_hid_change(line, HookReport { off_hook: true, code: 0 }).unwrap();
            }
        }

        fn ring(&self, client: &str, connection: ConnectionId, id: &str, number: Option<&str>) {
            let caller_id = number.map(|n| crate::callerid::CallerIdPayload { number: Some(n.into()), ..Default::default() });
            self.ex().handle(client, connection, Inbound::Ring(RingRequest { id: id.into(), caller_id })).unwrap();
        }

        fn ringer(&self, line: LineId) -> Vec<HidCommand> {
            self.commands[line].try_iter().collect()
        }
    }

    #[test]
    fn off_hook_plays_default_dial_tone() {
        let h = Harness::new(&["L1"]);
        h.hook(0, true);
        let ex = h.ex();
        let line = ex.line(0).unwrap();
        assert_eq!(line.state(), LineState::DialTone);
        assert_eq!(line.dialer(), Some("default"));
        assert!(line.audio.is_playing());
    }

    #[test]
    fn on_hook_is_idle_and_silent() {
        let h = Harness::new(&["L1"]);
        h.hook(0, true);
        h.hook(0, false);
        let ex = h.ex();
        let line = ex.line(0).unwrap();
        assert_eq!(line.state(), LineState::Idle);
        assert_eq!(line.dialer(), None);
        assert!(!line.audio.is_playing());
    }

    #[test]
    fn switches_dialer_then_calls_once_with_valid_number() {
        let h = Harness::new(&["L1"]);
        let (_, rx) = h.connect("ws1");
        h.hook(0, true);
        h.press(0, "1");
        {
            let ex = h.ex();
            let line = ex.line(0).unwrap();
            assert_eq!(line.dialer(), Some("1"));
            assert_eq!(line.state(), LineState::DialTone);
            assert!(line.audio.is_playing());
        }
        h.press(0, "202555123");
        assert!(rx.try_recv().is_err());
        assert!(!h.ex().line(0).unwrap().audio.is_playing());
        h.press(0, "4");
        match rx.try_recv() {
            Ok(Outbound::Call { number, device }) => {
                assert_eq!(number, "+12025551234");
                assert_eq!(device.serial, "L1");
            },
            other => panic!("expected a call, got {:?}", other),
        }
        h.press(0, "5");
        assert!(rx.try_recv().is_err());
        let ex = h.ex();
        assert_eq!(ex.line(0).unwrap().state(), LineState::Connected);
        assert_eq!(ex.line(0).unwrap().client(), Some("ws1"));
    }

    #[test]
    fn pattern_dialer_forwards_capture() {
        let h = Harness::new(&["L1"]);
        let (_, rx) = h.connect("ws1");
        h.hook(0, true);
        h.press(0, "2");
        h.press(0, "9123");
        assert!(matches!(rx.try_recv(), Ok(Outbound::Call { number, .. }) if number == "123"));
    }

    #[test]
    fn unregistered_client_gets_busy_tone_without_state_change() {
        let h = Harness::new(&["L1"]);
        h.hook(0, true);
        h.press(0, "35");
        let ex = h.ex();
        let line = ex.line(0).unwrap();
        assert_eq!(line.state(), LineState::Dialing);
        assert_eq!(line.client(), None);
        assert_eq!(line.dialer(), None);
        assert!(line.audio.is_playing());
    }

    #[test]
    fn busy_client_gets_busy_tone() {
        let h = Harness::new(&["L1", "L2"]);
        let (_, rx) = h.connect("ws1");
        h.hook(0, true);
        h.press(0, "29123");
        assert!(rx.try_recv().is_ok());
        h.hook(1, true);
        h.press(1, "29456");
        assert!(rx.try_recv().is_err());
        assert_eq!(h.ex().line(1).unwrap().state(), LineState::Dialing);
    }

    #[test]
    fn map_can_loop_back_into_another_dialer() {
        let h = Harness::new(&["L1"]);
        h.hook(0, true);
        h.press(0, "30");
        let ex = h.ex();
        let line = ex.line(0).unwrap();
        assert_eq!(line.dialer(), Some("1"));
        assert_eq!(line.client(), None);
        assert_eq!(line.state(), LineState::DialTone);
    }

    #[test]
    fn hanging_up_ends_the_call() {
        let h = Harness::new(&["L1"]);
        let (_, rx) = h.connect("ws1");
        h.hook(0, true);
        h.press(0, "29123");
        assert!(rx.try_recv().is_ok());
        h.hook(0, false);
        assert_eq!(rx.try_recv(), Ok(Outbound::End));
        assert!(!h.ex().clients["ws1"].in_use());
    }

    #[test]
    fn malformed_dialer_fails_on_first_use() {
        let h = Harness::new(&["BROKEN"]);
        let result = h.ex().on_hid_change(0, HookReport { off_hook: true, code: 0 });
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn ring_starts_and_stops_ringer() {
        let h = Harness::new(&["L1"]);
        let (conn, _rx) = h.connect("ws1");
        h.ring("ws1", conn, "A", None);
        assert!(h.ex().line(0).unwrap().is_ringing());
        assert_eq!(h.ringer(0), vec![HidCommand::RingerOn]);
        h.ex().handle("ws1", conn, Inbound::StopRinging("A".into())).unwrap();
        assert!(!h.ex().line(0).unwrap().is_ringing());
        assert_eq!(h.ringer(0), vec![HidCommand::RingerOff]);
        assert!(h.ex().offers().is_empty());
    }

    #[test]
    fn stop_ringing_requires_the_offering_connection() {
        let h = Harness::new(&["L1"]);
        let (a, _rx_a) = h.connect("ws1");
        let (b, _rx_b) = h.connect("ws2");
        h.ring("ws1", a, "A", None);
        h.ex().handle("ws2", b, Inbound::StopRinging("A".into())).unwrap();
        assert!(h.ex().line(0).unwrap().is_ringing());
        assert_eq!(h.ex().offers().len(), 1);
    }

    #[test]
    fn whitelist_limits_ringing_lines() {
        let h = Harness::new(&["L1", "WHITE"]);
        let (a, _rx_a) = h.connect("ws1");
        let (b, _rx_b) = h.connect("ws2");
        h.ring("ws1", a, "A", None);
        assert!(h.ex().line(0).unwrap().is_ringing());
        assert!(!h.ex().line(1).unwrap().is_ringing());
        h.ring("ws2", b, "B", None);
        assert!(h.ex().line(1).unwrap().is_ringing());
        assert_eq!(h.ex().offers()[0].lines, vec![0]);
        assert_eq!(h.ex().offers()[1].lines, vec![0, 1]);
    }

    #[test]
    fn cancelled_offer_suppresses_caller_id() {
        let h = Harness::new(&["L1"]);
        h.ex().set_caller_id_delay(Duration::from_millis(150));
        let (conn, _rx) = h.connect("ws1");
        h.ring("ws1", conn, "A", Some("2025551234"));
        assert!(h.ex().line(0).unwrap().is_ringing());
        h.ex().handle("ws1", conn, Inbound::StopRinging("A".into())).unwrap();
        thread::sleep(Duration::from_millis(400));
        let ex = h.ex();
        let line = ex.line(0).unwrap();
        assert!(!line.is_ringing());
        assert!(!line.audio.is_playing());
    }

    #[test]
    fn caller_id_follows_first_ring() {
        let h = Harness::new(&["L1"]);
        h.ex().set_caller_id_delay(Duration::from_millis(100));
        let (conn, _rx) = h.connect("ws1");
        h.ring("ws1", conn, "A", Some("2025551234"));
        assert!(!h.ex().line(0).unwrap().audio.is_playing());
        thread::sleep(Duration::from_millis(400));
        assert!(h.ex().line(0).unwrap().audio.is_playing());
        h.hook(0, true);
        assert_eq!(h.ex().line(0).unwrap().state(), LineState::Connected);
    }

    #[test]
    fn caller_id_precedes_first_ring() {
        let h = Harness::new(&["EARLY"]);
        let (conn, _rx) = h.connect("ws1");
        h.ring("ws1", conn, "A", Some("2025551234"));
        assert!(h.ringer(0).is_empty());

        let audio = Arc::clone(&h.ex().line(0).unwrap().audio);
        wait_until_playing(&audio);
        assert!(h.ringer(0).is_empty());
        let mut buf = [0i16; crate::audio::BLOCK_SIZE];
        while audio.is_playing() {
            audio.fill(&mut buf);
        }
        assert_eq!(h.commands[0].recv_timeout(Duration::from_secs(1)), Ok(HidCommand::RingerOn));
    }

    fn wait_until_playing(audio: &AudioPipeline) {
        for _ in 0..200 {
            if audio.is_playing() {
                return
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("Caller-ID never started");
    }

    #[test]
    fn withdrawn_offer_never_rings_after_caller_id() {
        let h = Harness::new(&["EARLY"]);
        let (conn, _rx) = h.connect("ws1");
        h.ring("ws1", conn, "A", Some("2025551234"));
        let audio = Arc::clone(&h.ex().line(0).unwrap().audio);
        wait_until_playing(&audio);

        h.ex().handle("ws1", conn, Inbound::StopRinging("A".into())).unwrap();
        assert!(!audio.is_playing());
        thread::sleep(Duration::from_millis(200));
        assert!(!h.ringer(0).contains(&HidCommand::RingerOn));
        assert!(!h.ex().line(0).unwrap().is_ringing());
    }

    #[test]
    fn answering_during_caller_id_never_rings() {
        let h = Harness::new(&["EARLY"]);
        let (conn, rx) = h.connect("ws1");
        h.ring("ws1", conn, "A", Some("2025551234"));
        let audio = Arc::clone(&h.ex().line(0).unwrap().audio);
        wait_until_playing(&audio);

        h.hook(0, true);
        assert!(matches!(rx.try_recv(), Ok(Outbound::Answer { id, .. }) if id == "A"));
        thread::sleep(Duration::from_millis(200));
        assert!(!h.ringer(0).contains(&HidCommand::RingerOn));
        assert_eq!(h.ex().line(0).unwrap().state(), LineState::Connected);
    }

    #[test]
    fn connection_on_a_call_cannot_answer_another_line() {
        let h = Harness::new(&["L1", "L2"]);
        let (a, rx) = h.connect("ws1");
        h.hook(0, true);
        h.press(0, "29123");
        assert!(matches!(rx.try_recv(), Ok(Outbound::Call { .. })));

        h.ring("ws1", a, "B", None);
        assert!(!h.ex().line(0).unwrap().is_ringing());
        assert!(h.ex().line(1).unwrap().is_ringing());
        h.hook(1, true);
        assert!(rx.try_recv().is_err());
        {
            let ex = h.ex();
            assert_eq!(ex.line(1).unwrap().state(), LineState::DialTone);
            assert_eq!(ex.line(1).unwrap().client(), None);
            assert_eq!(ex.line(0).unwrap().state(), LineState::Connected);
            assert_eq!(ex.clients["ws1"].line_of(a), Some(0));
        }

        h.hook(0, false);
        assert_eq!(rx.try_recv(), Ok(Outbound::End));
        assert!(!h.ex().clients["ws1"].in_use());
    }

    #[test]
    fn first_offer_wins_and_second_keeps_ringing_elsewhere() {
        let h = Harness::new(&["L1", "L2"]);
        let (a, rx_a) = h.connect("ws1");
        let (b, rx_b) = h.connect("ws2");
        h.ring("ws1", a, "A", None);
        h.ring("ws2", b, "B", None);
        h.hook(0, true);

        assert!(matches!(rx_a.try_recv(), Ok(Outbound::Answer { id, .. }) if id == "A"));
        assert!(rx_b.try_recv().is_err());
        let ex = h.ex();
        assert_eq!(ex.offers().len(), 1);
        assert_eq!(ex.offers()[0].id, "B");
        assert_eq!(ex.line(0).unwrap().state(), LineState::Connected);
        assert!(ex.line(1).unwrap().is_ringing());
    }

    #[test]
    fn answer_silences_other_lines() {
        let h = Harness::new(&["L1", "L2"]);
        let (a, rx_a) = h.connect("ws1");
        h.ring("ws1", a, "A", None);
        h.ringer(1);
        h.hook(0, true);
        assert!(rx_a.try_recv().is_ok());
        assert!(!h.ex().line(1).unwrap().is_ringing());
        assert_eq!(h.ringer(1), vec![HidCommand::RingerOff]);

        // The second line finds nothing left to answer.
        h.hook(1, true);
        let ex = h.ex();
        assert_eq!(ex.line(1).unwrap().state(), LineState::DialTone);
        assert_eq!(ex.line(1).unwrap().client(), None);
    }

    #[test]
    fn hanging_up_rings_again_for_waiting_offer() {
        let h = Harness::new(&["L1"]);
        let (a, _rx_a) = h.connect("ws1");
        h.hook(0, true);
        h.ring("ws1", a, "A", None);
        assert!(!h.ex().line(0).unwrap().is_ringing());
        h.hook(0, false);
        assert!(h.ex().line(0).unwrap().is_ringing());
    }

    #[test]
    fn superseded_offer_keeps_ringing() {
        let h = Harness::new(&["L1"]);
        let (a, _rx_a) = h.connect("ws1");
        h.ring("ws1", a, "A", None);
        h.ring("ws1", a, "A", Some("5551234"));
        assert_eq!(h.ringer(0), vec![HidCommand::RingerOn]);
        let ex = h.ex();
        assert_eq!(ex.offers().len(), 1);
        assert_eq!(ex.offers()[0].number(), "5551234");
        assert!(ex.line(0).unwrap().is_ringing());
    }

    #[test]
    fn remote_end_leaves_line_busy() {
        let h = Harness::new(&["L1"]);
        let (a, rx_a) = h.connect("ws1");
        h.ring("ws1", a, "A", None);
        h.hook(0, true);
        assert!(rx_a.try_recv().is_ok());
        h.ex().handle("ws1", a, Inbound::End).unwrap();
        {
            let ex = h.ex();
            let line = ex.line(0).unwrap();
            assert_eq!(line.state(), LineState::Busy);
            assert_eq!(line.client(), None);
            assert!(line.audio.is_playing());
        }
        h.hook(0, false);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn dialing_plays_ringback_on_owned_line() {
        let h = Harness::new(&["L1"]);
        let (a, _rx_a) = h.connect("ws1");
        assert!(matches!(h.ex().handle("ws1", a, Inbound::Dialing(true)), Err(Error::Rejected(_))));
        h.hook(0, true);
        h.press(0, "29123");
        h.ex().handle("ws1", a, Inbound::Dialing(true)).unwrap();
        assert!(h.ex().line(0).unwrap().audio.is_playing());
        h.ex().handle("ws1", a, Inbound::Dialing(false)).unwrap();
        assert!(!h.ex().line(0).unwrap().audio.is_playing());
    }

    #[test]
    fn disconnect_withdraws_offers_and_releases_lines() {
        let h = Harness::new(&["L1", "L2"]);
        let (a, _rx_a) = h.connect("ws1");
        h.hook(0, true);
        h.press(0, "29123");
        h.ring("ws1", a, "A", None);
        assert!(h.ex().line(1).unwrap().is_ringing());

        h.ex().disconnect("ws1", a);
        let ex = h.ex();
        assert!(!ex.is_registered("ws1"));
        assert!(ex.offers().is_empty());
        assert!(!ex.line(1).unwrap().is_ringing());
        assert_eq!(ex.line(0).unwrap().state(), LineState::Busy);
    }

    #[test]
    fn reconnect_replaces_single_peer() {
        let h = Harness::new(&["L1"]);
        let (a, rx_a) = h.connect("ws1");
        h.ring("ws1", a, "A", None);
        let (b, _rx_b) = h.connect("ws1");
        assert_ne!(a, b);
        assert_eq!(rx_a.try_recv(), Ok(Outbound::Close));
        assert!(h.ex().offers().is_empty());

        // The old session's cleanup must not unregister the new connection.
        h.ex().disconnect("ws1", a);
        assert!(h.ex().is_registered("ws1"));
    }

    #[test]
    fn pool_routes_calls_and_answers_per_connection() {
        let h = Harness::new(&["L1", "L2", "L3"]);
        let (a, rx_a) = h.connect("pool");
        let (b, rx_b) = h.connect("pool");
        h.ring("pool", b, "B", None);
        h.hook(0, true);
        assert!(matches!(rx_b.try_recv(), Ok(Outbound::Answer { id, .. }) if id == "B"));
        assert!(rx_a.try_recv().is_err());

        h.hook(1, true);
        h.press(1, "4");
        h.press(1, "7");
        assert!(matches!(rx_a.try_recv(), Ok(Outbound::Call { number, .. }) if number == "7"));
        assert!(h.ex().clients["pool"].in_use());

        h.hook(2, true);
        h.press(2, "47");
        assert_eq!(h.ex().line(2).unwrap().client(), None);

        h.ex().disconnect("pool", a);
        assert!(h.ex().is_registered("pool"));
        assert_eq!(h.ex().line(1).unwrap().state(), LineState::Busy);
        h.ex().disconnect("pool", b);
        assert!(!h.ex().is_registered("pool"));
    }

    #[test]
    fn built_in_clients_cannot_be_replaced() {
        let h = Harness::new(&[]);
        let (tx, _rx) = mpsc::channel();
        assert!(matches!(h.ex().register(DIALER_CLIENT, tx), Err(Error::Rejected(_))));
    }
}
