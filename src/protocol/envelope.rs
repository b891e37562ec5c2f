//! Control panel wire messages.
//!
//! After authentication every bundle holds one [`Envelope`]:
//!
//! ```text
//! { "Ping": i64?, "Pong": i64?, "Commands": [ { "Command": str, "Payload": map } ]? }
//! ```
//!
//! Before that, bundles carry [`AuthMessage`]s.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{constants, ProtocolError, Result};

/// Free-form command payload
pub type Payload = Map<String, Value>;

/// One decoded command
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub payload: Payload,
}

impl Command {
    pub fn new(name: impl Into<String>, payload: Payload) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Wire form of a command; both fields are required on receipt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "Command", default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(rename = "Payload", default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl From<Command> for CommandEnvelope {
    fn from(command: Command) -> Self {
        Self {
            command: Some(command.name),
            payload: Some(command.payload),
        }
    }
}

impl TryFrom<CommandEnvelope> for Command {
    type Error = ProtocolError;

    fn try_from(envelope: CommandEnvelope) -> Result<Self> {
        let name = envelope
            .command
            .ok_or_else(|| ProtocolError::MalformedEnvelope(constants::ERR_MISSING_COMMAND.into()))?;
        let payload = envelope
            .payload
            .ok_or_else(|| ProtocolError::MalformedEnvelope(constants::ERR_MISSING_PAYLOAD.into()))?;
        Ok(Command { name, payload })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Ping", default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<i64>,
    #[serde(rename = "Pong", default, skip_serializing_if = "Option::is_none")]
    pub pong: Option<i64>,
    #[serde(rename = "Commands", default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<CommandEnvelope>>,
}

impl Envelope {
    pub fn ping(timestamp: i64) -> Self {
        Self {
            ping: Some(timestamp),
            ..Self::default()
        }
    }

    pub fn pong(timestamp: i64) -> Self {
        Self {
            pong: Some(timestamp),
            ..Self::default()
        }
    }

    pub fn with_commands(commands: impl IntoIterator<Item = Command>) -> Self {
        Self {
            commands: Some(commands.into_iter().map(CommandEnvelope::from).collect()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ping.is_none()
            && self.pong.is_none()
            && self.commands.as_ref().map_or(true, Vec::is_empty)
    }

    /// Validate and take the commands. Any malformed entry rejects the whole envelope.
    pub fn take_commands(&mut self) -> Result<Vec<Command>> {
        self.commands
            .take()
            .unwrap_or_default()
            .into_iter()
            .map(Command::try_from)
            .collect()
    }
}

/// Challenge-response login messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Auth")]
pub enum AuthMessage {
    /// Client announces who it is
    Hello {
        #[serde(rename = "Identity")]
        identity: String,
    },
    /// Server sends an encrypted random challenge
    Challenge {
        #[serde(rename = "Nonce")]
        nonce: Vec<u8>,
        #[serde(rename = "Ciphertext")]
        ciphertext: Vec<u8>,
        /// Present for password credentials
        #[serde(rename = "Salt", default, skip_serializing_if = "Option::is_none")]
        salt: Option<Vec<u8>>,
        /// Present for keypair credentials: the server's ephemeral x25519 key
        #[serde(rename = "Ephemeral", default, skip_serializing_if = "Option::is_none")]
        ephemeral: Option<Vec<u8>>,
    },
    /// Client echoes the decrypted challenge
    Response {
        #[serde(rename = "Challenge")]
        challenge: Vec<u8>,
    },
    Accepted,
    Rejected {
        #[serde(rename = "Reason")]
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::serialization::SerializationFormat;

    #[test]
    fn test_ping_test_envelope() {
        let raw = br#"{"Commands":[{"Command":"Ping-Test","Payload":{}}]}"#;
        let mut envelope: Envelope = SerializationFormat::Json.decode(raw).unwrap();
        assert!(envelope.ping.is_none());
        let commands = envelope.take_commands().unwrap();
        assert_eq!(commands, vec![Command::new("Ping-Test", Payload::new())]);
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        let mut no_payload: Envelope =
            SerializationFormat::Json.decode(br#"{"Commands":[{"Command":"x"}]}"#).unwrap();
        assert!(matches!(
            no_payload.take_commands(),
            Err(ProtocolError::MalformedEnvelope(m)) if m == constants::ERR_MISSING_PAYLOAD
        ));

        let mut no_command: Envelope =
            SerializationFormat::Json.decode(br#"{"Commands":[{"Payload":{}}]}"#).unwrap();
        assert!(matches!(
            no_command.take_commands(),
            Err(ProtocolError::MalformedEnvelope(m)) if m == constants::ERR_MISSING_COMMAND
        ));
    }

    #[test]
    fn test_empty_fields_are_omitted() {
        let bytes = SerializationFormat::Json.encode(&Envelope::ping(5)).unwrap();
        assert_eq!(bytes, br#"{"Ping":5}"#);
        assert!(Envelope::default().is_empty());
        assert!(!Envelope::pong(1).is_empty());
    }

    #[test]
    fn test_auth_message_tagging() {
        let hello = AuthMessage::Hello {
            identity: "panel".into(),
        };
        let bytes = SerializationFormat::Json.encode(&hello).unwrap();
        assert_eq!(bytes, br#"{"Auth":"Hello","Identity":"panel"}"#);

        for format in [SerializationFormat::Json, SerializationFormat::MessagePack] {
            let bytes = format.encode(&AuthMessage::Accepted).unwrap();
            assert_eq!(format.decode::<AuthMessage>(&bytes).unwrap(), AuthMessage::Accepted);
        }
    }
}
