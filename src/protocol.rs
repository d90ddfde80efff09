//! Serial command grammar for the Tiger-style controller link.
//!
//! Commands are plain ASCII lines of the form `[address][mnemonic] KEY=value ...`
//! where the address is the decimal card number on the controller backplane
//! (omitted for hub-level commands such as the pointer move `M`). Replies are
//! either `:A [values]` on success or `:N-<code>` when the card reports a
//! fault.
//!
//! This module is a pure codec. It performs no I/O and no retries; retry and
//! timeout policy live in [`crate::session`].

use std::fmt;

use thiserror::Error;

/// Errors produced while decoding a controller reply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The reply did not match the `:A` / `:N-<code>` grammar.
    #[error("malformed controller reply: {0:?}")]
    Malformed(String),

    /// The card reported a fault code (`:N-<code>`).
    #[error("controller reported fault code {0}")]
    DeviceError(i32),
}

/// A single parameter value in a command line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<u16> for ParamValue {
    fn from(v: u16) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<u8> for ParamValue {
    fn from(v: u8) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// One command line addressed at the controller.
///
/// Build with [`Command::card`] (card-addressed) or [`Command::hub`]
/// (hub-level, no address prefix), then chain [`Command::param`]:
///
/// ```
/// use spim_daq::protocol::Command;
///
/// let cmd = Command::card(6, "CCA").param("X", 3u8);
/// assert_eq!(cmd.encode(), "6CCA X=3");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    address: Option<u8>,
    mnemonic: String,
    params: Vec<(String, ParamValue)>,
}

impl Command {
    /// Command addressed to a specific card on the backplane.
    pub fn card(address: u8, mnemonic: impl Into<String>) -> Self {
        Self {
            address: Some(address),
            mnemonic: mnemonic.into(),
            params: Vec::new(),
        }
    }

    /// Hub-level command with no card address prefix (e.g. the pointer
    /// move `M` or the broadcast halt `\`).
    pub fn hub(mnemonic: impl Into<String>) -> Self {
        Self {
            address: None,
            mnemonic: mnemonic.into(),
            params: Vec::new(),
        }
    }

    /// Append a `KEY=value` parameter. Order is preserved.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Append a bare flag token with no `=value` part (e.g. the `Z` in the
    /// settings-save command `SS Z`).
    pub fn flag(mut self, key: impl Into<String>) -> Self {
        self.params.push((key.into(), ParamValue::Text(String::new())));
        self
    }

    /// The command mnemonic (without address prefix).
    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    /// The destination card address, if card-addressed.
    pub fn address(&self) -> Option<u8> {
        self.address
    }

    /// Encode into the wire form: `[address][mnemonic] KEY=value ...`,
    /// single spaces, no trailing whitespace.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if let Some(addr) = self.address {
            out.push_str(&addr.to_string());
        }
        out.push_str(&self.mnemonic);
        for (key, value) in &self.params {
            out.push(' ');
            out.push_str(key);
            let rendered = value.to_string();
            if !rendered.is_empty() {
                out.push('=');
                out.push_str(&rendered);
            }
        }
        out
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// A decoded positive acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ack {
    /// Whitespace-separated payload tokens following `:A`, if any.
    pub values: Vec<String>,
}

impl Ack {
    /// First payload token parsed as an integer, if present. Tolerates the
    /// `KEY=value` echo form some cards use.
    pub fn first_int(&self) -> Option<i64> {
        let token = self.values.first()?;
        let digits = token.rsplit('=').next()?;
        digits.parse().ok()
    }
}

/// Decode a raw controller reply line.
///
/// `:A` (optionally followed by payload tokens) is success; `:N-<code>` is a
/// card fault. Anything else is [`ProtocolError::Malformed`].
pub fn parse_ack(raw: &str) -> Result<Ack, ProtocolError> {
    let line = raw.trim();
    if let Some(rest) = line.strip_prefix(":A") {
        return Ok(Ack {
            values: rest.split_whitespace().map(str::to_string).collect(),
        });
    }
    if let Some(rest) = line.strip_prefix(":N") {
        // Fault codes arrive as ":N-5"; keep the sign.
        let code = rest
            .trim()
            .parse::<i32>()
            .map_err(|_| ProtocolError::Malformed(raw.to_string()))?;
        return Err(ProtocolError::DeviceError(code));
    }
    Err(ProtocolError::Malformed(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_card_command_with_params() {
        let cmd = Command::card(6, "CCA").param("X", 11u8);
        assert_eq!(cmd.encode(), "6CCA X=11");
    }

    #[test]
    fn encodes_multi_param_in_order() {
        let cmd = Command::card(6, "CCB")
            .param("X", 41u8)
            .param("Y", 192u8)
            .param("Z", 0u8);
        assert_eq!(cmd.encode(), "6CCB X=41 Y=192 Z=0");
    }

    #[test]
    fn encodes_bare_flag_without_equals() {
        let cmd = Command::card(6, "SS").flag("Z");
        assert_eq!(cmd.encode(), "6SS Z");
    }

    #[test]
    fn encodes_hub_command_without_address() {
        let cmd = Command::hub("M").param("E", 10u8);
        assert_eq!(cmd.encode(), "M E=10");
    }

    #[test]
    fn encodes_float_params() {
        let cmd = Command::card(3, "NV").param("X", 29.25);
        assert_eq!(cmd.encode(), "3NV X=29.25");
    }

    #[test]
    fn no_trailing_whitespace() {
        let cmd = Command::card(3, "SCAN");
        assert_eq!(cmd.encode(), "3SCAN");
        let with_params = Command::card(3, "NR").param("X", 1u8).encode();
        assert_eq!(with_params, with_params.trim());
    }

    #[test]
    fn parses_bare_ack() {
        let ack = parse_ack(":A").unwrap();
        assert!(ack.values.is_empty());
    }

    #[test]
    fn parses_ack_with_payload() {
        let ack = parse_ack(":A 1\r\n").unwrap();
        assert_eq!(ack.values, vec!["1"]);
        assert_eq!(ack.first_int(), Some(1));
    }

    #[test]
    fn parses_key_value_echo() {
        let ack = parse_ack(":A X=1").unwrap();
        assert_eq!(ack.first_int(), Some(1));
    }

    #[test]
    fn parses_device_fault() {
        assert_eq!(parse_ack(":N-5"), Err(ProtocolError::DeviceError(-5)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_ack("hello"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(parse_ack(":Nxy"), Err(ProtocolError::Malformed(_))));
    }
}
