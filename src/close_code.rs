//! WebSocket close status codes.
//!
//! These mirror the RFC 6455 close code registry and convert to and from
//! their numeric values bit-exactly, so they can participate in a standard
//! framed close handshake without translation loss.

use std::fmt;

/// Status code carried by a WebSocket close frame.
///
/// Standard codes get a named variant; everything else round-trips through
/// [`CloseCode::Other`]. Use [`as_u16()`](CloseCode::as_u16) and
/// [`From<u16>`] for wire conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000 — normal closure; the purpose of the connection was fulfilled.
    Normal,
    /// 1001 — the endpoint is going away (server shutdown, page navigation,
    /// or an abrupt transport failure surfaced by the receive loop).
    Away,
    /// 1002 — a protocol error was detected.
    ProtocolError,
    /// 1003 — received a data type the endpoint cannot accept.
    UnsupportedData,
    /// 1005 — no status code was present in the close frame. Never sent on
    /// the wire; reported for ambiguous disconnects.
    NoStatus,
    /// 1006 — the connection closed abnormally without a close frame.
    /// Never sent on the wire.
    Abnormal,
    /// 1007 — a payload was inconsistent with its message type.
    InvalidPayload,
    /// 1008 — a message violated the endpoint's policy.
    PolicyViolation,
    /// 1009 — a message was too big to process.
    MessageTooBig,
    /// 1010 — the client required an extension the server did not offer.
    MandatoryExtension,
    /// 1011 — the server encountered an unexpected condition.
    InternalError,
    /// Any code outside the named set, preserved verbatim.
    Other(u16),
}

impl CloseCode {
    /// Returns the numeric value of this close code.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::Away => 1001,
            Self::ProtocolError => 1002,
            Self::UnsupportedData => 1003,
            Self::NoStatus => 1005,
            Self::Abnormal => 1006,
            Self::InvalidPayload => 1007,
            Self::PolicyViolation => 1008,
            Self::MessageTooBig => 1009,
            Self::MandatoryExtension => 1010,
            Self::InternalError => 1011,
            Self::Other(code) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::ProtocolError,
            1003 => Self::UnsupportedData,
            1005 => Self::NoStatus,
            1006 => Self::Abnormal,
            1007 => Self::InvalidPayload,
            1008 => Self::PolicyViolation,
            1009 => Self::MessageTooBig,
            1010 => Self::MandatoryExtension,
            1011 => Self::InternalError,
            other => Self::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn named_codes_round_trip_bit_exactly() {
        let named = [
            (CloseCode::Normal, 1000),
            (CloseCode::Away, 1001),
            (CloseCode::ProtocolError, 1002),
            (CloseCode::UnsupportedData, 1003),
            (CloseCode::NoStatus, 1005),
            (CloseCode::Abnormal, 1006),
            (CloseCode::InvalidPayload, 1007),
            (CloseCode::PolicyViolation, 1008),
            (CloseCode::MessageTooBig, 1009),
            (CloseCode::MandatoryExtension, 1010),
            (CloseCode::InternalError, 1011),
        ];
        for (code, value) in named {
            assert_eq!(code.as_u16(), value);
            assert_eq!(CloseCode::from(value), code);
        }
    }

    #[test]
    fn unnamed_codes_are_preserved_verbatim() {
        for value in [1004u16, 1012, 2999, 3000, 4999] {
            let code = CloseCode::from(value);
            assert_eq!(code.as_u16(), value);
        }
        assert_eq!(CloseCode::from(4000), CloseCode::Other(4000));
    }

    #[test]
    fn display_shows_numeric_value() {
        assert_eq!(CloseCode::Normal.to_string(), "1000");
        assert_eq!(CloseCode::Other(4321).to_string(), "4321");
    }
}
