//! Control frames carried inside encrypted transport frames.
//!
//! Every transport plaintext starts with one kind byte. Keepalives, rekeys
//! and teardown travel encrypted so they cannot be spoofed by an on-path
//! observer.

use crate::wire::WireError;
use crate::KEY_SIZE;

/// Length of the leading kind byte.
pub const CONTROL_KIND_SIZE: usize = 1;

mod kind {
    pub const PAYLOAD: u8 = 0x00;
    pub const KEEPALIVE: u8 = 0x01;
    pub const KEEPALIVE_ACK: u8 = 0x02;
    pub const REKEY_INIT: u8 = 0x03;
    pub const REKEY_RESPONSE: u8 = 0x04;
    pub const TEARDOWN: u8 = 0x05;
}

/// Decrypted transport frame content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Tunnel packet for the virtual network interface.
    Payload(Vec<u8>),
    /// Liveness probe.
    Keepalive,
    /// Reply to a liveness probe.
    KeepaliveAck,
    /// Start of an in-channel rekey, carrying a fresh ephemeral key.
    RekeyInit([u8; KEY_SIZE]),
    /// Answer to `RekeyInit`, carrying the responder's fresh ephemeral key.
    RekeyResponse([u8; KEY_SIZE]),
    /// Orderly session close.
    Teardown,
}

impl Control {
    /// Serialize to plaintext bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Control::Payload(data) => {
                let mut out = Vec::with_capacity(CONTROL_KIND_SIZE + data.len());
                out.push(kind::PAYLOAD);
                out.extend_from_slice(data);
                out
            }
            Control::Keepalive => vec![kind::KEEPALIVE],
            Control::KeepaliveAck => vec![kind::KEEPALIVE_ACK],
            Control::RekeyInit(key) => {
                let mut out = Vec::with_capacity(CONTROL_KIND_SIZE + KEY_SIZE);
                out.push(kind::REKEY_INIT);
                out.extend_from_slice(key);
                out
            }
            Control::RekeyResponse(key) => {
                let mut out = Vec::with_capacity(CONTROL_KIND_SIZE + KEY_SIZE);
                out.push(kind::REKEY_RESPONSE);
                out.extend_from_slice(key);
                out
            }
            Control::Teardown => vec![kind::TEARDOWN],
        }
    }

    /// Parse decrypted plaintext.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (&tag, rest) = buf
            .split_first()
            .ok_or(WireError::TooShort(0, CONTROL_KIND_SIZE))?;

        match tag {
            kind::PAYLOAD => Ok(Control::Payload(rest.to_vec())),
            kind::KEEPALIVE if rest.is_empty() => Ok(Control::Keepalive),
            kind::KEEPALIVE_ACK if rest.is_empty() => Ok(Control::KeepaliveAck),
            kind::REKEY_INIT => Ok(Control::RekeyInit(key_body(rest)?)),
            kind::REKEY_RESPONSE => Ok(Control::RekeyResponse(key_body(rest)?)),
            kind::TEARDOWN if rest.is_empty() => Ok(Control::Teardown),
            kind::KEEPALIVE | kind::KEEPALIVE_ACK | kind::TEARDOWN => {
                Err(WireError::Malformed("unexpected control body"))
            }
            other => Err(WireError::UnknownControl(other)),
        }
    }

    /// Whether this frame counts as application traffic.
    pub fn is_payload(&self) -> bool {
        matches!(self, Control::Payload(_))
    }
}

fn key_body(rest: &[u8]) -> Result<[u8; KEY_SIZE], WireError> {
    rest.try_into()
        .map_err(|_| WireError::Malformed("rekey key length"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_roundtrip() {
        let control = Control::Payload(b"ip packet".to_vec());
        assert_eq!(Control::decode(&control.encode()).unwrap(), control);
    }

    #[test]
    fn test_empty_payload_allowed() {
        let control = Control::Payload(Vec::new());
        assert_eq!(control.encode(), vec![0x00]);
        assert_eq!(Control::decode(&[0x00]).unwrap(), control);
    }

    #[test]
    fn test_rekey_requires_full_key() {
        assert!(Control::decode(&[0x03; 10]).is_err());
        let control = Control::RekeyResponse([0x11; KEY_SIZE]);
        assert_eq!(Control::decode(&control.encode()).unwrap(), control);
    }

    #[test]
    fn test_keepalive_with_body_rejected() {
        assert!(Control::decode(&[0x01, 0xFF]).is_err());
        assert_eq!(Control::decode(&[0x01]).unwrap(), Control::Keepalive);
    }

    #[test]
    fn test_unknown_and_empty() {
        assert_eq!(Control::decode(&[0x7F]), Err(WireError::UnknownControl(0x7F)));
        assert!(Control::decode(&[]).is_err());
    }
}
