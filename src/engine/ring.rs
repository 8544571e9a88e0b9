use std::sync::Arc;
use log::{debug, info, warn};
use crate::audio::CallerIdSource;
use crate::callerid::CallerIdPayload;
use crate::clients::ConnectionId;
use crate::config::CallerIdPolicy;
use crate::error::Result;
use super::{Exchange, LineId, ScheduledTask};

/// An inbound call presented to every line that admits it.
#[derive(Clone, Debug)]
pub struct RingOffer {
    /// Id chosen by the offering client.
    pub id: String,
    pub caller_id: Option<CallerIdPayload>,
    /// Type name of the offering client.
    pub client: String,
    pub connection: ConnectionId,
    /// Attached lines, in line order.
    pub lines: Vec<LineId>,
}

impl RingOffer {
    pub fn new(id: impl Into<String>, caller_id: Option<CallerIdPayload>, client: impl Into<String>, connection: ConnectionId) -> Self {
        Self {
            id: id.into(),
            caller_id,
            client: client.into(),
            connection,
            lines: Vec::new(),
        }
    }

    pub fn number(&self) -> &str {
        self.caller_id.as_ref().map_or("", CallerIdPayload::number)
    }

    fn is_from(&self, client: &str, connection: ConnectionId) -> bool {
        self.client == client && self.connection == connection
    }
}

impl Exchange {
    pub fn offers(&self) -> &[RingOffer] {
        &self.offers
    }

    fn is_attached(&self, line: LineId) -> bool {
        self.offers.iter().any(|offer| offer.lines.contains(&line))
    }

    /// Records `offer`, attaches it to every admitting line and rings the idle ones.
    /// An offer with the same id from the same connection is replaced.
    pub fn start_ringing(&mut self, mut offer: RingOffer) {
        let superseded = self.offers.iter()
            .position(|o| o.id == offer.id && o.is_from(&offer.client, offer.connection))
            .map(|index| self.offers.remove(index));

        offer.lines = self.lines.iter()
            .enumerate()
            .filter(|(_, line)| line.config.admits(&offer.client, offer.number()))
            .map(|(id, _)| id)
            .collect();
        info!("Offer '{}' from {} ({} line(s))", offer.id, offer.client, offer.lines.len());

        for &id in &offer.lines {
            let line = &self.lines[id];
            if !line.off_hook && !line.ringing {
                self.ring_line(id, offer.caller_id.clone());
            }
        }
        self.offers.push(offer);

        if let Some(old) = superseded {
            debug!("Offer '{}' superseded", old.id);
            for id in old.lines {
                if !self.is_attached(id) {
                    self.silence_line(id);
                }
            }
        }
    }

    fn remove_offer(&mut self, index: usize) -> RingOffer {
        let offer = self.offers.remove(index);
        for &id in &offer.lines {
            if !self.is_attached(id) {
                self.silence_line(id);
            }
        }
        offer
    }

    /// Withdraws the offer `id` raised by the given connection. Returns `false` if there is none.
    pub fn stop_ringing(&mut self, client: &str, connection: ConnectionId, id: &str) -> bool {
        match self.offers.iter().position(|o| o.id == id && o.is_from(client, connection)) {
            Some(index) => {
                info!("Offer '{}' from {} withdrawn", id, client);
                self.remove_offer(index);
                true
            },
            None => false
        }
    }

    /// Withdraws every offer raised by a connection.
    pub(super) fn withdraw_offers(&mut self, client: &str, connection: ConnectionId) {
        while let Some(index) = self.offers.iter().position(|o| o.is_from(client, connection)) {
            let offer = self.remove_offer(index);
            debug!("Offer '{}' withdrawn with its connection", offer.id);
        }
    }

    /// Takes the oldest live offer attached to `line`, if any.
    pub fn answer(&mut self, line: LineId) -> Option<RingOffer> {
        let index = self.offers.iter().position(|offer| offer.lines.contains(&line))?;
        Some(self.remove_offer(index))
    }

    /// Starts ringing an idle line, announcing Caller-ID according to the line's policy.
    pub(super) fn ring_line(&mut self, id: LineId, caller_id: Option<CallerIdPayload>) {
        let policy = self.lines[id].config.caller_id;
        let source = match caller_id {
            Some(payload) if policy != CallerIdPolicy::Off => {
                match CallerIdSource::new(&self.caller_id, &payload) {
                    Ok(source) => Some(source),
                    Err(err) => {
                        warn!("[{}] Caller-ID skipped: {}", self.lines[id].serial, err);
                        None
                    }
                }
            },
            _ => None
        };

        let me = self.me.clone();
        let delay = self.caller_id_delay;
        let line = &mut self.lines[id];
        line.ringing = true;
        debug!("[{}] Started ringing", line.serial);

        match (policy, source) {
            (CallerIdPolicy::BeforeFirstRing, Some(source)) => {
                let audio = Arc::clone(&line.audio);
                line.caller_id_task = Some(ScheduledTask::spawn(
                    me,
                    move |_| {
                        audio.play_and_wait(source);
                        true
                    },
                    move |exchange| exchange.caller_id_sent(id),
                ));
            },
            (CallerIdPolicy::AfterFirstRing, Some(source)) => {
                line.start_ringer();
                line.caller_id_task = Some(ScheduledTask::after(me, delay, move |exchange| exchange.send_caller_id(id, source)));
            },
            _ => line.start_ringer()
        }
    }

    fn caller_id_sent(&mut self, id: LineId) {
        let line = &mut self.lines[id];
        line.caller_id_task = None;
        if line.ringing && !line.off_hook {
            line.start_ringer();
        }
    }

    fn send_caller_id(&mut self, id: LineId, source: CallerIdSource) {
        let line = &mut self.lines[id];
        line.caller_id_task = None;
        if line.ringing && !line.off_hook {
            info!("[{}] Sending Caller-ID", line.serial);
            line.audio.play(source);
        }
    }

    /// Plays a Caller-ID burst on every line, outside of any ring offer.
    /// Returns the number of lines it was sent to.
    pub fn announce_caller_id(&self, payload: &CallerIdPayload) -> Result<usize> {
        payload.encode()?;
        for line in &self.lines {
            let source = CallerIdSource::new(&self.caller_id, payload)?;
            info!("[{}] Sending Caller-ID", line.serial);
            line.audio.play(source);
        }
        Ok(self.lines.len())
    }

    /// Stops the ringer and any Caller-ID on a line that no longer has a live offer.
    pub(super) fn silence_line(&mut self, id: LineId) {
        let line = &mut self.lines[id];
        line.cancel_caller_id();
        if line.ringing {
            line.ringing = false;
            line.stop_ringer();
            debug!("[{}] Stopped ringing", line.serial);
        }
        if !line.off_hook {
            line.audio.stop();
        }
    }
}
