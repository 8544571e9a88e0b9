//! Multiple Data Message Format (MDMF) encoding of Caller-ID payloads.
//!
//! The encoded message is fed to the FSK modem, which turns it into the
//! Bell-202 burst sent between the first and second ring.

use std::fmt::Display;
use chrono::{DateTime, FixedOffset, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use crate::error::{Error, Result};

/// Message type byte for an MDMF call setup message.
const MDMF_CALL_SETUP: u8 = 0x80;

/// Parameter type identifiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldId {
    Timestamp = 1,
    Number = 2,
    NumberNotPresent = 4,
    Name = 7,
    NameNotPresent = 8,
}

/// Reason a number or name is withheld.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum Absence {
    #[serde(rename = "O")]
    OutOfArea,
    #[serde(rename = "P")]
    Private,
}

impl Absence {
    pub fn code(self) -> &'static str {
        match self {
            Absence::OutOfArea => "O",
            Absence::Private => "P",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "O" => Some(Absence::OutOfArea),
            "P" => Some(Absence::Private),
            _ => None
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CallerIdPayload {
    /// Call time. Filled with the current time when encoding if absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<FixedOffset>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_not_present: Option<Absence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_not_present: Option<Absence>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

impl CallerIdPayload {
    /// The calling number, or an empty string if none was sent.
    pub fn number(&self) -> &str {
        non_empty(&self.number).unwrap_or("")
    }

    pub fn validate(&self) -> Result<()> {
        if non_empty(&self.number).is_some() && self.number_not_present.is_some() {
            return Err(Error::Rejected("callerId has both number and numberNotPresent".into()));
        }
        if non_empty(&self.name).is_some() && self.name_not_present.is_some() {
            return Err(Error::Rejected("callerId has both name and nameNotPresent".into()));
        }
        Ok(())
    }

    /// Ordered field descriptors. Absent fields are `None` and get skipped.
    fn fields<Tz: TimeZone>(&self, tz: &Tz) -> [(FieldId, Option<String>); 5]
    where Tz::Offset: Display {
        let time = self.time.map(|t| t.with_timezone(&Utc)).unwrap_or_else(Utc::now);
        [
            (FieldId::Timestamp, Some(time.with_timezone(tz).format("%m%d%H%M").to_string())),
            (FieldId::Number, non_empty(&self.number).map(str::to_owned)),
            (FieldId::NumberNotPresent, self.number_not_present.map(|a| a.code().to_owned())),
            (FieldId::Name, non_empty(&self.name).map(str::to_owned)),
            (FieldId::NameNotPresent, self.name_not_present.map(|a| a.code().to_owned())),
        ]
    }

    /// Encodes the payload with the timestamp in the local time zone.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.encode_in(&Local)
    }

    pub fn encode_in<Tz: TimeZone>(&self, tz: &Tz) -> Result<Vec<u8>>
    where Tz::Offset: Display {
        self.validate()?;

        let mut body = Vec::new();
        for (id, value) in self.fields(tz) {
            let Some(value) = value else { continue };
            let len = u8::try_from(value.len())
                .map_err(|_| Error::Rejected(format!("callerId field {:?} is too long", id)))?;
            body.push(id as u8);
            body.push(len);
            body.extend_from_slice(value.as_bytes());
        }

        let body_len = u8::try_from(body.len())
            .map_err(|_| Error::Rejected("callerId message is too long".into()))?;

        let mut message = Vec::with_capacity(body.len() + 3);
        message.push(MDMF_CALL_SETUP);
        message.push(body_len);
        message.extend_from_slice(&body);
        message.push(checksum(&message));
        Ok(message)
    }
}

/// Two's-complement of the byte sum, so the whole message sums to zero.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)).wrapping_neg()
}

/// Fields recovered from an encoded message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedCallerId {
    /// `MMDDHHmm`
    pub timestamp: Option<String>,
    pub number: Option<String>,
    pub number_not_present: Option<Absence>,
    pub name: Option<String>,
    pub name_not_present: Option<Absence>,
}

pub fn decode(message: &[u8]) -> Result<DecodedCallerId> {
    if message.len() < 3 || message[0] != MDMF_CALL_SETUP {
        return Err(Error::Rejected("not an MDMF call setup message".into()));
    }
    if message[1] as usize != message.len() - 3 {
        return Err(Error::Rejected("MDMF length mismatch".into()));
    }
    if message.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) != 0 {
        return Err(Error::Rejected("MDMF checksum mismatch".into()));
    }

    let mut decoded = DecodedCallerId::default();
    let mut body = &message[2..message.len() - 1];
    while let [id, len, rest @ ..] = body {
        let len = *len as usize;
        if rest.len() < len {
            return Err(Error::Rejected("truncated MDMF field".into()));
        }
        let value = String::from_utf8_lossy(&rest[..len]).into_owned();
        match *id {
            id if id == FieldId::Timestamp as u8 => decoded.timestamp = Some(value),
            id if id == FieldId::Number as u8 => decoded.number = Some(value),
            id if id == FieldId::NumberNotPresent as u8 => decoded.number_not_present = Absence::from_code(&value),
            id if id == FieldId::Name as u8 => decoded.name = Some(value),
            id if id == FieldId::NameNotPresent as u8 => decoded.name_not_present = Absence::from_code(&value),
            _ => {}
        }
        body = &rest[len..];
    }
    Ok(decoded)
}
