//! Call routing targets.
//!
//! Every destination a line can reach, local or remote, is a [`Client`]
//! registered under a type name. Network clients are backed by one
//! connection, or by a pool of connections sharing a type name.

mod protocol;

use std::path::PathBuf;
use std::sync::mpsc;
use log::{debug, info};
use crate::audio::{DeviceIds, FileSource, ToneSource};
use crate::engine::{DialerTable, Line, LineId, LineState};
use crate::error::{Error, Result};

pub use self::protocol::*;

/// Name of the built-in loopback client that switches dialers.
pub const DIALER_CLIENT: &str = "dialer";

pub type ConnectionId = u64;

#[derive(Clone, Debug)]
pub struct CallData {
    pub number: String,
    pub device: DeviceIds,
}

#[derive(Clone, Debug)]
pub struct AnswerData {
    /// Offer id chosen by the client that raised it.
    pub id: String,
    pub device: DeviceIds,
    /// Connection that raised the offer.
    pub connection: ConnectionId,
}

/// One control-channel connection and the line it currently owns.
pub struct Connection {
    pub id: ConnectionId,
    outbound: mpsc::Sender<Outbound>,
    line: Option<LineId>,
}

impl Connection {
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<Outbound>) -> Self {
        Self { id, outbound, line: None }
    }

    pub fn line(&self) -> Option<LineId> {
        self.line
    }

    fn send(&self, message: Outbound) {
        if self.outbound.send(message).is_err() {
            debug!("Connection {} is gone; message dropped", self.id);
        }
    }
}

/// Plays `<directory>/<number>.wav` on the calling line.
pub struct Player {
    pub directory: PathBuf,
}

pub enum Client {
    /// Loopback client: the dialed number names the next dialer.
    Dialer,
    Player(Player),
    /// A single network connection, replaced when the client reconnects.
    Peer(Connection),
    /// Any number of network connections under one client type.
    Pool(Vec<Connection>),
}

impl Client {
    /// Starts a call from `line`. Fails with [`Error::Routing`] when no connection can take it.
    pub fn call(&mut self, line_id: LineId, line: &mut Line, dialers: &mut DialerTable, data: CallData, previous_dialer: &str) -> Result<()> {
        match self {
            Client::Dialer => {
                line.client = None;
                if !dialers.contains(&data.number) {
                    info!("[{}] No dialer named '{}'", line.serial, data.number);
                    line.play_busy();
                    return Ok(())
                }
                let rule = dialers.rule(&data.number)?;
                line.enter_dialer(&rule.name, &rule.dial_tone);
                line.set_state(LineState::DialTone);
            },
            Client::Player(player) => {
                let path = player.directory.join(format!("{}.wav", data.number));
                if !path.is_file() {
                    return Err(Error::Routing(format!("no sound file at {}", path.display())))
                }
                debug!("[{}] Playing {} (dialed via '{}')", line.serial, path.display(), previous_dialer);
                line.audio.play(FileSource::new(path));
                line.set_state(LineState::Connected);
            },
            Client::Peer(connection) => {
                if connection.line.is_some() {
                    return Err(Error::Routing(format!("connection {} already owns a line", connection.id)))
                }
                connection.line = Some(line_id);
                connection.send(Outbound::Call { number: data.number, device: data.device });
                line.set_state(LineState::Connected);
            },
            Client::Pool(connections) => {
                let connection = connections.iter_mut()
                    .find(|c| c.line.is_none())
                    .ok_or_else(|| Error::Routing("every pooled connection is busy".into()))?;
                connection.line = Some(line_id);
                connection.send(Outbound::Call { number: data.number, device: data.device });
                line.set_state(LineState::Connected);
            },
        }
        Ok(())
    }

    /// Releases `line`. Does nothing if no connection owns it.
    pub fn end(&mut self, line_id: LineId) {
        for connection in self.connections_mut() {
            if connection.line == Some(line_id) {
                connection.line = None;
                connection.send(Outbound::End);
            }
        }
    }

    /// Accepts an offer on `line`, on the connection that raised it.
    pub fn answer(&mut self, line_id: LineId, line: &mut Line, data: AnswerData) -> Result<()> {
        let connection = match self {
            Client::Peer(connection) if connection.id == data.connection => connection,
            Client::Pool(connections) => connections.iter_mut()
                .find(|c| c.id == data.connection)
                .ok_or_else(|| Error::Routing(format!("connection {} left the pool", data.connection)))?,
            Client::Peer(_) => return Err(Error::Routing(format!("connection {} was replaced", data.connection))),
            Client::Dialer | Client::Player(_) => return Err(Error::Routing("client cannot answer calls".into())),
        };
        if let Some(other) = connection.line.filter(|other| *other != line_id) {
            return Err(Error::Routing(format!("connection {} is already on line {}", connection.id, other)))
        }
        connection.line = Some(line_id);
        connection.send(Outbound::Answer { id: data.id, device: data.device });
        line.set_state(LineState::Connected);
        Ok(())
    }

    /// Whether the client has no spare capacity for another call.
    pub fn in_use(&self) -> bool {
        match self {
            Client::Dialer | Client::Player(_) => false,
            Client::Peer(connection) => connection.line.is_some(),
            Client::Pool(connections) => connections.iter().all(|c| c.line.is_some()),
        }
    }

    /// Asks the current instance to make way for a new registration.
    /// Local clients never give way.
    pub fn disconnect(&mut self) -> bool {
        match self {
            Client::Dialer | Client::Player(_) => false,
            Client::Peer(connection) => {
                connection.send(Outbound::Close);
                true
            },
            Client::Pool(connections) => {
                for connection in connections.iter() {
                    connection.send(Outbound::Close);
                }
                true
            },
        }
    }

    fn connections(&self) -> &[Connection] {
        match self {
            Client::Peer(connection) => std::slice::from_ref(connection),
            Client::Pool(connections) => connections,
            Client::Dialer | Client::Player(_) => &[],
        }
    }

    fn connections_mut(&mut self) -> &mut [Connection] {
        match self {
            Client::Peer(connection) => std::slice::from_mut(connection),
            Client::Pool(connections) => connections,
            Client::Dialer | Client::Player(_) => &mut [],
        }
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections().iter().map(|c| c.id).collect()
    }

    pub fn has_connection(&self, id: ConnectionId) -> bool {
        self.connections().iter().any(|c| c.id == id)
    }

    /// Line owned by the given connection.
    pub fn line_of(&self, id: ConnectionId) -> Option<LineId> {
        self.connections().iter().find(|c| c.id == id).and_then(Connection::line)
    }

    /// Detaches `line` from whichever connection owns it, without notifying the peer.
    pub fn release(&mut self, line_id: LineId) {
        for connection in self.connections_mut() {
            if connection.line == Some(line_id) {
                connection.line = None;
            }
        }
    }

    /// Removes a connection and returns the line it owned.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Option<LineId> {
        match self {
            Client::Peer(connection) if connection.id == id => connection.line.take(),
            Client::Pool(connections) => {
                let index = connections.iter().position(|c| c.id == id)?;
                connections.remove(index).line
            },
            _ => None
        }
    }

    /// Whether a network client has lost all of its connections.
    pub fn is_vacant(&self) -> bool {
        matches!(self, Client::Pool(connections) if connections.is_empty())
    }
}
