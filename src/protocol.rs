//! Line-oriented ASCII protocol spoken between the hub and its peripherals.
//!
//! ```text
//! TEL:name=value      telemetry
//! CMD:name,arg        absolute command
//! SET:key=value       setting push, answered by SETACK:key=value
//! SEQ:n / SEQ?        pattern select / query, answered by OK:n
//! PING / PONG         liveness
//! RESET               peripheral (re)boot marker
//! ```

use crate::settings::{Setting, SettingKey};
use crate::snapshot::{SignalName, MAX_SIGNAL_NAME};
use arrayvec::ArrayString;
use core::fmt::Write;
use thiserror::Error;

/// Longest line accepted or produced, excluding the newline.
pub const MAX_LINE_LEN: usize = 64;

pub type LineBuffer = ArrayString<MAX_LINE_LEN>;

/// Why an incoming line was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    UnknownTag,
    MissingField,
    BadName,
    BadNumber,
    UnknownKey,
    BadValue,
    UnknownCommand,
    NonAscii,
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("encoded line exceeds {} bytes", MAX_LINE_LEN)]
    LineTooLong,
    #[error("signal name is not wire-safe")]
    InvalidName,
    #[error("telemetry value is not finite")]
    NonFinite,
    #[error("unparseable input cannot be encoded")]
    NotEncodable,
}

/// Commands are absolute so a repeated delivery changes nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Screen(u8),
    Dim(bool),
    Mute(bool),
}

impl Command {
    pub const fn name(&self) -> &'static str {
        match self {
            Command::Screen(_) => "screen",
            Command::Dim(_) => "dim",
            Command::Mute(_) => "mute",
        }
    }

    fn parse(body: &str) -> Result<Self, ParseError> {
        let (name, arg) = body.split_once(',').ok_or(ParseError::MissingField)?;
        match name {
            "screen" => arg.parse().map(Command::Screen).map_err(|_| ParseError::BadValue),
            "dim" => parse_switch(arg).map(Command::Dim),
            "mute" => parse_switch(arg).map(Command::Mute),
            _ => Err(ParseError::UnknownCommand),
        }
    }
}

fn parse_switch(arg: &str) -> Result<bool, ParseError> {
    match arg {
        "1" | "on" => Ok(true),
        "0" | "off" => Ok(false),
        _ => Err(ParseError::BadValue),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Message {
    Telemetry { name: SignalName, value: f32 },
    Command(Command),
    SettingSet(Setting),
    SettingAck(Setting),
    PatternSelect(u8),
    PatternQuery,
    PatternOk(u8),
    Ping,
    Pong,
    Reset,
    Unparseable(ParseError),
}

impl Message {
    pub fn telemetry(name: &str, value: f32) -> Result<Self, ProtocolError> {
        if !is_wire_name(name) {
            return Err(ProtocolError::InvalidName);
        }
        let name = SignalName::from(name).map_err(|_| ProtocolError::InvalidName)?;
        Ok(Message::Telemetry { name, value })
    }

    /// Parse one line (without its terminator). Never fails: anything that is
    /// not a well-formed message comes back as [`Message::Unparseable`].
    pub fn parse(line: &str) -> Self {
        match Self::try_parse(line) {
            Ok(message) => message,
            Err(reason) => Message::Unparseable(reason),
        }
    }

    fn try_parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(ParseError::Empty);
        }
        if !line.is_ascii() {
            return Err(ParseError::NonAscii);
        }
        if line.len() > MAX_LINE_LEN {
            return Err(ParseError::Truncated);
        }

        match line {
            "PING" => return Ok(Message::Ping),
            "PONG" => return Ok(Message::Pong),
            "RESET" => return Ok(Message::Reset),
            "SEQ?" => return Ok(Message::PatternQuery),
            _ => {}
        }

        let (tag, body) = line.split_once(':').ok_or(ParseError::UnknownTag)?;
        match tag {
            "TEL" => {
                let (name, value) = split_pair(body)?;
                if !is_wire_name(name) || name.len() > MAX_SIGNAL_NAME {
                    return Err(ParseError::BadName);
                }
                let value: f32 = value.parse().map_err(|_| ParseError::BadNumber)?;
                if !value.is_finite() {
                    return Err(ParseError::BadNumber);
                }
                let name = SignalName::from(name).map_err(|_| ParseError::BadName)?;
                Ok(Message::Telemetry { name, value })
            }
            "CMD" => Command::parse(body).map(Message::Command),
            "SET" => parse_setting(body).map(Message::SettingSet),
            "SETACK" => parse_setting(body).map(Message::SettingAck),
            "SEQ" => parse_pattern(body).map(Message::PatternSelect),
            "OK" => parse_pattern(body).map(Message::PatternOk),
            _ => Err(ParseError::UnknownTag),
        }
    }

    /// Wire form without the trailing newline.
    pub fn encode(&self) -> Result<LineBuffer, ProtocolError> {
        let mut line = LineBuffer::new();
        let result = match self {
            Message::Telemetry { name, value } => {
                if !is_wire_name(name) {
                    return Err(ProtocolError::InvalidName);
                }
                if !value.is_finite() {
                    return Err(ProtocolError::NonFinite);
                }
                write!(line, "TEL:{}={}", name, value)
            }
            Message::Command(Command::Screen(n)) => write!(line, "CMD:screen,{}", n),
            Message::Command(cmd @ (Command::Dim(on) | Command::Mute(on))) => {
                write!(line, "CMD:{},{}", cmd.name(), u8::from(*on))
            }
            Message::SettingSet(setting) => write!(line, "SET:{}", setting),
            Message::SettingAck(setting) => write!(line, "SETACK:{}", setting),
            Message::PatternSelect(n) => write!(line, "SEQ:{}", n),
            Message::PatternQuery => line.try_push_str("SEQ?").map_err(|_| core::fmt::Error),
            Message::PatternOk(n) => write!(line, "OK:{}", n),
            Message::Ping => line.try_push_str("PING").map_err(|_| core::fmt::Error),
            Message::Pong => line.try_push_str("PONG").map_err(|_| core::fmt::Error),
            Message::Reset => line.try_push_str("RESET").map_err(|_| core::fmt::Error),
            Message::Unparseable(_) => return Err(ProtocolError::NotEncodable),
        };
        result.map_err(|_| ProtocolError::LineTooLong)?;
        Ok(line)
    }

    /// Critical lines are never dropped from an output queue.
    pub fn is_critical(&self) -> bool {
        !matches!(self, Message::Telemetry { .. })
    }
}

fn split_pair(body: &str) -> Result<(&str, &str), ParseError> {
    let (name, value) = body.split_once('=').ok_or(ParseError::MissingField)?;
    if name.is_empty() || value.is_empty() {
        return Err(ParseError::MissingField);
    }
    Ok((name, value))
}

fn parse_setting(body: &str) -> Result<Setting, ParseError> {
    let (key, value) = split_pair(body)?;
    let key = SettingKey::parse(key).ok_or(ParseError::UnknownKey)?;
    Setting::parse(key, value).ok_or(ParseError::BadValue)
}

fn parse_pattern(body: &str) -> Result<u8, ParseError> {
    body.parse().map_err(|_| ParseError::BadNumber)
}

fn is_wire_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.')
}

/// Collects bytes from a serial stream into complete lines.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: LineBuffer,
    overflowed: bool,
    non_ascii: bool,
    truncated: u32,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte. Returns a line once its newline arrives; blank lines
    /// are skipped. An over-long line is discarded up to the next newline.
    pub fn feed(&mut self, byte: u8) -> Option<Result<LineBuffer, ParseError>> {
        match byte {
            b'\r' => None,
            b'\n' => {
                let result = if self.overflowed {
                    Some(Err(ParseError::Truncated))
                } else if self.non_ascii {
                    Some(Err(ParseError::NonAscii))
                } else if self.buffer.is_empty() {
                    None
                } else {
                    Some(Ok(self.buffer))
                };
                self.buffer.clear();
                self.overflowed = false;
                self.non_ascii = false;
                result
            }
            _ if self.overflowed => None,
            _ if !byte.is_ascii() => {
                self.non_ascii = true;
                None
            }
            _ => {
                if self.buffer.try_push(char::from(byte)).is_err() {
                    self.overflowed = true;
                    self.truncated = self.truncated.saturating_add(1);
                }
                None
            }
        }
    }

    /// Lines thrown away for exceeding [`MAX_LINE_LEN`].
    pub fn truncated(&self) -> u32 {
        self.truncated
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_reject_separators() {
        assert!(is_wire_name("tpms1_kpa"));
        assert!(is_wire_name("bus0.online"));
        assert!(!is_wire_name("a=b"));
        assert!(!is_wire_name("a:b"));
        assert!(!is_wire_name(""));
    }

    #[test]
    fn assembler_resyncs_after_overflow() {
        let mut assembler = LineAssembler::new();
        for _ in 0..MAX_LINE_LEN + 10 {
            assert_eq!(assembler.feed(b'x'), None);
        }
        assert_eq!(assembler.feed(b'\n'), Some(Err(ParseError::Truncated)));
        assert_eq!(assembler.truncated(), 1);

        let mut line = None;
        for b in b"PING\r\n" {
            line = assembler.feed(*b).or(line);
        }
        assert_eq!(line.map(|r| r.map(|l| l.to_string())), Some(Ok("PING".to_string())));
    }
}
