//! The application-level message entity the pipeline shepherds from
//! draft to acknowledged (or from the wire to the inbox).

use serde::{Deserialize, Serialize};

use crate::address::BitmessageAddress;
use crate::object::InventoryVector;

/// Ceiling on automatic resends of an unacknowledged message.
pub const MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaintextType {
    Msg,
    Broadcast,
}

/// Message body encodings defined by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageEncoding {
    /// Recipients may ignore the content entirely (used by acks).
    Ignore,
    /// Raw UTF-8 without structure.
    Trivial,
    /// `Subject:…\nBody:…` UTF-8.
    Simple,
}

impl MessageEncoding {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(MessageEncoding::Ignore),
            1 => Some(MessageEncoding::Trivial),
            2 => Some(MessageEncoding::Simple),
            _ => None,
        }
    }

    pub fn as_u64(self) -> u64 {
        match self {
            MessageEncoding::Ignore => 0,
            MessageEncoding::Trivial => 1,
            MessageEncoding::Simple => 2,
        }
    }
}

/// Lifecycle of a message. Outbound walks New/Draft →
/// PubkeyRequested? → DoingProofOfWork → Sent → SentAcknowledged;
/// inbound arrives as Received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    New,
    Draft,
    PubkeyRequested,
    DoingProofOfWork,
    Sent,
    SentAcknowledged,
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelKind {
    Inbox,
    Draft,
    Outbox,
    Sent,
    Unread,
    Trash,
    Broadcast,
    Muted,
}

/// A user-facing folder/flag; many-to-many with messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: u64,
    pub name: String,
    pub kind: Option<LabelKind>,
    /// ARGB.
    pub color: u32,
}

/// A message in cleartext, either composed locally or the result of a
/// successful trial decryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plaintext {
    pub id: Option<u64>,
    pub kind: PlaintextType,
    pub from: BitmessageAddress,
    pub to: Option<BitmessageAddress>,
    pub encoding: MessageEncoding,
    pub message: Vec<u8>,
    /// For outbound messages expecting an ack: the payload of the
    /// acknowledgement object we embedded; matching it against incoming
    /// msg payloads is how delivery is detected.
    pub ack_data: Vec<u8>,
    pub iv: Option<InventoryVector>,
    /// PoW correlation handle: SHA-512 of the object body awaiting its
    /// nonce.
    pub initial_hash: Option<Vec<u8>>,
    pub status: MessageStatus,
    pub sent: Option<u64>,
    pub received: Option<u64>,
    pub ttl: u64,
    pub retries: u32,
    pub next_try: Option<u64>,
    pub labels: Vec<u64>,
    pub signature: Option<Vec<u8>>,
}

impl Plaintext {
    /// A fresh outbound message with nothing scheduled yet.
    pub fn draft(
        from: BitmessageAddress,
        to: Option<BitmessageAddress>,
        kind: PlaintextType,
        encoding: MessageEncoding,
        message: Vec<u8>,
        ttl: u64,
    ) -> Self {
        Plaintext {
            id: None,
            kind,
            from,
            to,
            encoding,
            message,
            ack_data: Vec::new(),
            iv: None,
            initial_hash: None,
            status: MessageStatus::New,
            sent: None,
            received: None,
            ttl,
            retries: 0,
            next_try: None,
            labels: Vec::new(),
            signature: None,
        }
    }

    /// Builds a `Simple`-encoded body.
    pub fn simple_body(subject: &str, body: &str) -> Vec<u8> {
        format!("Subject:{}\nBody:{}", subject, body).into_bytes()
    }

    /// Splits a `Simple`-encoded body into subject and body; other
    /// encodings and malformed bodies yield no subject.
    pub fn subject_and_body(&self) -> (Option<String>, String) {
        let text = String::from_utf8_lossy(&self.message).into_owned();
        if self.encoding != MessageEncoding::Simple {
            return (None, text);
        }
        let parsed = text
            .strip_prefix("Subject:")
            .and_then(|rest| rest.split_once("\nBody:"));
        match parsed {
            Some((subject, body)) => (Some(subject.to_owned()), body.to_owned()),
            None => (None, text),
        }
    }

    pub fn is_unacknowledged(&self) -> bool {
        self.status == MessageStatus::Sent && !self.ack_data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::RIPE_LENGTH;

    fn address() -> BitmessageAddress {
        BitmessageAddress::new(4, 1, [0u8; RIPE_LENGTH])
    }

    #[test]
    fn simple_body_round_trip() {
        let mut msg = Plaintext::draft(
            address(),
            Some(address()),
            PlaintextType::Msg,
            MessageEncoding::Simple,
            Plaintext::simple_body("greetings", "hello\nworld"),
            216_000,
        );
        let (subject, body) = msg.subject_and_body();
        assert_eq!(subject.as_deref(), Some("greetings"));
        assert_eq!(body, "hello\nworld");

        msg.encoding = MessageEncoding::Trivial;
        msg.message = b"plain".to_vec();
        let (subject, body) = msg.subject_and_body();
        assert_eq!(subject, None);
        assert_eq!(body, "plain");
    }

    #[test]
    fn malformed_simple_body_degrades_gracefully() {
        let msg = Plaintext::draft(
            address(),
            None,
            PlaintextType::Broadcast,
            MessageEncoding::Simple,
            b"no markers here".to_vec(),
            216_000,
        );
        let (subject, body) = msg.subject_and_body();
        assert_eq!(subject, None);
        assert_eq!(body, "no markers here");
    }

    #[test]
    fn encoding_codes_match_protocol() {
        assert_eq!(MessageEncoding::Ignore.as_u64(), 0);
        assert_eq!(MessageEncoding::Simple.as_u64(), 2);
        assert_eq!(
            MessageEncoding::from_u64(1),
            Some(MessageEncoding::Trivial)
        );
        assert_eq!(MessageEncoding::from_u64(9), None);
    }
}
