use serde::Deserialize;
use serde_json::{json, Value};
use crate::audio::DeviceIds;
use crate::callerid::CallerIdPayload;
use crate::error::{Error, Result};

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RingRequest {
    pub id: String,
    #[serde(default)]
    pub caller_id: Option<CallerIdPayload>,
}

/// Control messages received from a network client.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Ring(RingRequest),
    StopRinging(String),
    Dialing(bool),
    End,
}

impl Inbound {
    /// Parses a `[type, payload]` message.
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts: Vec<Value> = serde_json::from_str(text)?;
        if parts.is_empty() || parts.len() > 2 {
            return Err(Error::Rejected(format!("expected [type, payload], got {} elements", parts.len())))
        }
        let payload = if parts.len() == 2 { parts.pop() } else { None };
        let kind = parts.pop().and_then(|v| v.as_str().map(str::to_owned)).unwrap_or_default();
        let require_payload = || payload.clone().ok_or_else(|| Error::Rejected(format!("'{}' requires a payload", kind)));

        Ok(match kind.as_str() {
            "ring" => {
                let request: RingRequest = serde_json::from_value(require_payload()?)?;
                if let Some(caller_id) = &request.caller_id {
                    caller_id.validate()?;
                }
                Inbound::Ring(request)
            },
            "stopRinging" => Inbound::StopRinging(serde_json::from_value(require_payload()?)?),
            "dialing" => Inbound::Dialing(serde_json::from_value(require_payload()?)?),
            "end" => Inbound::End,
            _ => return Err(Error::Rejected(format!("unknown message type '{}'", kind)))
        })
    }
}

/// Messages sent to a network client.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Call { number: String, device: DeviceIds },
    End,
    Answer { id: String, device: DeviceIds },
    /// Closes the connection. Not sent on the wire.
    Close,
}

impl Outbound {
    pub fn to_json(&self) -> Option<String> {
        let value = match self {
            Outbound::Call { number, device } => json!(["call", { "number": number, "device": device }]),
            Outbound::End => json!(["end"]),
            Outbound::Answer { id, device } => json!(["answer", { "id": id, "device": device }]),
            Outbound::Close => return None,
        };
        Some(value.to_string())
    }
}
