// Tally Common - wire messages shared by coordinators, participants and peers
// Both the newline-terminated decimal format and the legacy tagged tokens live here

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Default TCP port of the coordinator
pub const DEFAULT_TCP_PORT: u16 = 35701;

/// Default multicast group shared by datagram peers
pub const DEFAULT_GROUP_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 1, 1);

/// Default multicast port shared by datagram peers
pub const DEFAULT_GROUP_PORT: u16 = 36702;

/// Longest message body a receiver will buffer before giving up on it
pub const MAX_MESSAGE_LEN: usize = 1024;

const COUNT_PREFIX: &str = "COUNT";
const ACCEPTED_PREFIX: &str = "ACCEPTED";
const INVALID_COUNT_PREFIX: &str = "INVALID_COUNT";
const JOIN_PREFIX: &str = "JOIN";

/// Errors produced while parsing a message body
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Nothing but whitespace
    #[error("empty message")]
    Empty,

    /// Tagged token with a prefix we do not know
    #[error("unknown message tag: {0}")]
    UnknownTag(String),

    /// Number part did not parse
    #[error("invalid number in message: {0:?}")]
    InvalidNumber(String),
}

/// How messages are framed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// One decimal integer per line, `\n` terminated
    #[default]
    Line,
    /// `COUNT:<n>`, `ACCEPTED:<n>`, `INVALID_COUNT:<n>` with no terminator
    Legacy,
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "line" => Ok(WireFormat::Line),
            "legacy" => Ok(WireFormat::Legacy),
            other => Err(format!("unknown wire format '{}', expected 'line' or 'legacy'", other)),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireFormat::Line => write!(f, "line"),
            WireFormat::Legacy => write!(f, "legacy"),
        }
    }
}

/// A single protocol message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// A contribution sent by the participant whose turn it is
    Count(i64),
    /// A value the coordinator accepted (or simulated) and fans out
    Accepted(i64),
    /// Strict-mode correction carrying the value the coordinator expects next
    InvalidCount(i64),
    /// Optional announcement of the sender's participant id
    Join(u32),
}

impl Message {
    /// The counter value carried by the message, if any
    pub fn value(&self) -> Option<i64> {
        match self {
            Message::Count(v) | Message::Accepted(v) | Message::InvalidCount(v) => Some(*v),
            Message::Join(_) => None,
        }
    }

    /// Serialize for the given wire format.
    ///
    /// In the line format counts and accepted values are both bare decimals,
    /// only the correction and join messages keep their tag.
    pub fn encode(&self, format: WireFormat) -> String {
        match format {
            WireFormat::Line => match self {
                Message::Count(v) | Message::Accepted(v) => format!("{}\n", v),
                Message::InvalidCount(v) => format!("{}:{}\n", INVALID_COUNT_PREFIX, v),
                Message::Join(id) => format!("{}:{}\n", JOIN_PREFIX, id),
            },
            WireFormat::Legacy => match self {
                Message::Count(v) => format!("{}:{}", COUNT_PREFIX, v),
                Message::Accepted(v) => format!("{}:{}", ACCEPTED_PREFIX, v),
                Message::InvalidCount(v) => format!("{}:{}", INVALID_COUNT_PREFIX, v),
                Message::Join(id) => format!("{}:{}", JOIN_PREFIX, id),
            },
        }
    }

    /// Parse one message body.
    ///
    /// Accepts bare decimals as well as every tagged token regardless of the
    /// configured format, so mixed deployments keep talking to each other.
    pub fn parse(text: &str) -> Result<Self, WireError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(WireError::Empty);
        }

        let Some((tag, number)) = text.split_once(':') else {
            return parse_number(text).map(Message::Count);
        };

        match tag.trim() {
            COUNT_PREFIX => parse_number(number).map(Message::Count),
            ACCEPTED_PREFIX => parse_number(number).map(Message::Accepted),
            INVALID_COUNT_PREFIX => parse_number(number).map(Message::InvalidCount),
            JOIN_PREFIX => number
                .trim()
                .parse::<u32>()
                .map(Message::Join)
                .map_err(|_| WireError::InvalidNumber(number.to_string())),
            other => Err(WireError::UnknownTag(other.to_string())),
        }
    }
}

impl FromStr for Message {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Message::parse(s)
    }
}

fn parse_number(text: &str) -> Result<i64, WireError> {
    text.trim()
        .parse::<i64>()
        .map_err(|_| WireError::InvalidNumber(text.to_string()))
}

/// Participant entitled to contribute `value` when `participants` take turns
pub fn turn_owner(value: i64, participants: u32) -> u32 {
    if participants == 0 {
        return 0;
    }
    value.rem_euclid(participants as i64) as u32
}
