//! Tunnel control protocol: hellos, message envelopes, and identifiers.
//!
//! # Responsibilities
//! - Define the JSON wire types exchanged on the control connection
//! - Encode/decode frames with a hard size cap
//! - Derive client ids from secret keys
//! - Validate and generate subdomains
//!
//! # Design Decisions
//! - Hellos are sent as bare JSON objects, never wrapped in [`Message`];
//!   the first frame on a fresh connection is always parsed as a hello
//! - `data` payload bytes travel as base64 text so arbitrary octets survive
//!   the JSON leg
//! - Decoders tolerate unknown fields; frames above [`MAX_FRAME_LEN`] are
//!   rejected before deserialization

use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE as BASE64_URL_SAFE};
use base64::Engine;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};

/// Upper bound on a single wire frame. Large response chunks fit well below
/// this; anything bigger is a protocol violation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Error type for protocol encode/decode and validation failures.
#[derive(Debug)]
pub enum ProtocolError {
    /// Frame could not be serialized to JSON.
    Encode(serde_json::Error),
    /// Frame could not be parsed as JSON.
    Decode(serde_json::Error),
    /// Frame exceeded [`MAX_FRAME_LEN`].
    FrameTooLarge(usize),
    /// A typed message carried no `data` payload.
    MissingData,
    /// Subdomain failed validation.
    InvalidSubDomain(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Encode(e) => write!(f, "failed to encode frame: {}", e),
            ProtocolError::Decode(e) => write!(f, "failed to decode frame: {}", e),
            ProtocolError::FrameTooLarge(n) => {
                write!(f, "frame of {} bytes exceeds cap of {} bytes", n, MAX_FRAME_LEN)
            }
            ProtocolError::MissingData => write!(f, "message has no data payload"),
            ProtocolError::InvalidSubDomain(reason) => write!(f, "invalid subdomain: {}", reason),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Unique client identifier.
///
/// Anonymous clients carry a random UUID; authenticated clients carry an id
/// deterministically derived from their secret key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    /// Generate a fresh random client id.
    pub fn generate() -> Self {
        ClientId(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique stream identifier, opaque to the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub String);

impl StreamId {
    /// Generate a fresh random stream id.
    pub fn generate() -> Self {
        StreamId(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// API authentication key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey {
    pub key: String,
}

impl SecretKey {
    /// Generate a new random secret key.
    pub fn generate() -> Self {
        let bytes: [u8; 22] = rand::thread_rng().gen();
        SecretKey {
            key: BASE64_URL_SAFE.encode(bytes),
        }
    }

    /// Derive the deterministic client id for this key:
    /// `base64(sha256(key))`.
    pub fn client_id(&self) -> ClientId {
        let digest = Sha256::digest(self.key.as_bytes());
        ClientId(BASE64_STANDARD.encode(digest))
    }
}

/// Token for resuming an existing tunnel session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectToken {
    pub token: String,
}

impl ReconnectToken {
    /// Generate a new random reconnect token.
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        ReconnectToken {
            token: BASE64_URL_SAFE.encode(bytes),
        }
    }
}

/// How the client authenticates itself in the hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Auth,
    Anonymous,
}

/// First message from client to server on a fresh control connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub id: ClientId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_domain: Option<String>,
    pub client_type: ClientType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<SecretKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_token: Option<ReconnectToken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ClientHello {
    /// Build a hello for a new session. Presence of a secret key selects
    /// authenticated mode.
    pub fn new(sub_domain: Option<String>, secret_key: Option<SecretKey>) -> Self {
        let client_type = if secret_key.is_some() {
            ClientType::Auth
        } else {
            ClientType::Anonymous
        };
        ClientHello {
            id: ClientId::generate(),
            sub_domain,
            client_type,
            client_version: None,
            secret_key,
            reconnect_token: None,
            password: None,
        }
    }
}

/// Outcome discriminator of a [`ServerHello`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerHelloType {
    Success,
    SubDomainInUse,
    InvalidSubDomain,
    AuthFailed,
    Error,
}

/// Server's reply to a [`ClientHello`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHello {
    #[serde(rename = "type")]
    pub hello_type: ServerHelloType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_token: Option<ReconnectToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerHello {
    /// Build a success hello carrying the granted subdomain and public URL.
    pub fn success(
        sub_domain: String,
        hostname: String,
        public_url: String,
        client_id: ClientId,
    ) -> Self {
        ServerHello {
            hello_type: ServerHelloType::Success,
            sub_domain: Some(sub_domain),
            hostname: Some(hostname),
            public_url: Some(public_url),
            client_id: Some(client_id),
            reconnect_token: None,
            error: None,
        }
    }

    /// Build a rejection hello of the given kind.
    pub fn rejection(hello_type: ServerHelloType, error: impl Into<String>) -> Self {
        ServerHello {
            hello_type,
            sub_domain: None,
            hostname: None,
            public_url: None,
            client_id: None,
            reconnect_token: None,
            error: Some(error.into()),
        }
    }
}

/// Type tag of a [`Message`] envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Init,
    Data,
    End,
    Ping,
    Pong,
}

/// Envelope for all post-hello traffic in both directions.
///
/// `data` is kept as raw JSON and decoded per `type` by the caller.
#[derive(Debug, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

impl Message {
    /// Build a message without a payload.
    pub fn new(msg_type: MessageType, stream_id: Option<StreamId>) -> Self {
        Message {
            msg_type,
            stream_id,
            data: None,
        }
    }

    /// Build a message with a serialized payload.
    pub fn with_data<T: Serialize>(
        msg_type: MessageType,
        stream_id: Option<StreamId>,
        data: &T,
    ) -> Result<Self, ProtocolError> {
        let raw = serde_json::to_string(data).map_err(ProtocolError::Encode)?;
        let raw = RawValue::from_string(raw).map_err(ProtocolError::Encode)?;
        Ok(Message {
            msg_type,
            stream_id,
            data: Some(raw),
        })
    }

    /// Decode the payload into a concrete type.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let raw = self.data.as_ref().ok_or(ProtocolError::MissingData)?;
        serde_json::from_str(raw.get()).map_err(ProtocolError::Decode)
    }
}

/// Payload of an `init` message: opens a new stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitStreamMessage {
    pub stream_id: StreamId,
    pub protocol: String,
}

/// Payload of a `data` message: one chunk of stream bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Serde adapter carrying raw octets as base64 text.
///
/// Decoding also tolerates a plain JSON byte array, which some peers emit.
mod base64_bytes {
    use super::{Engine, BASE64_STANDARD};
    use serde::de::{Error as DeError, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a base64 string or a byte array")
            }

            fn visit_str<E: DeError>(self, v: &str) -> Result<Self::Value, E> {
                BASE64_STANDARD.decode(v).map_err(DeError::custom)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                Ok(bytes)
            }
        }

        deserializer.deserialize_any(BytesVisitor)
    }
}

/// Encode any frame (hello or message) to its wire text.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame).map_err(ProtocolError::Encode)?;
    if text.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a wire frame, enforcing the size cap before touching the parser.
pub fn decode_frame<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    if text.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    serde_json::from_str(text).map_err(ProtocolError::Decode)
}

/// Check a requested subdomain: 1-63 chars of `[a-z0-9-]`, no leading or
/// trailing hyphen.
pub fn validate_sub_domain(sub_domain: &str) -> Result<(), ProtocolError> {
    if sub_domain.is_empty() {
        return Err(ProtocolError::InvalidSubDomain("cannot be empty".into()));
    }
    if sub_domain.len() > 63 {
        return Err(ProtocolError::InvalidSubDomain(
            "too long (max 63 characters)".into(),
        ));
    }
    for (i, c) in sub_domain.chars().enumerate() {
        if !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
            return Err(ProtocolError::InvalidSubDomain(format!(
                "invalid character: {}",
                c
            )));
        }
        if c == '-' && (i == 0 || i == sub_domain.len() - 1) {
            return Err(ProtocolError::InvalidSubDomain(
                "cannot start or end with hyphen".into(),
            ));
        }
    }
    Ok(())
}

const SUB_DOMAIN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a random 8-character lowercase alphanumeric subdomain.
pub fn generate_sub_domain() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| SUB_DOMAIN_CHARSET[rng.gen_range(0..SUB_DOMAIN_CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_hello_round_trip() {
        let mut hello = ClientHello::new(Some("demo".into()), Some(SecretKey::generate()));
        hello.client_version = Some("0.1.0".into());
        hello.password = Some("letmein".into());

        let text = encode_frame(&hello).unwrap();
        let decoded: ClientHello = decode_frame(&text).unwrap();

        assert_eq!(decoded.id, hello.id);
        assert_eq!(decoded.sub_domain.as_deref(), Some("demo"));
        assert_eq!(decoded.client_type, ClientType::Auth);
        assert_eq!(decoded.secret_key, hello.secret_key);
        assert_eq!(decoded.password.as_deref(), Some("letmein"));
    }

    #[test]
    fn server_hello_round_trip() {
        let hello = ServerHello::success(
            "demo".into(),
            "demo.localhost".into(),
            "http://demo.localhost:8080".into(),
            ClientId::generate(),
        );
        let text = encode_frame(&hello).unwrap();
        let decoded: ServerHello = decode_frame(&text).unwrap();
        assert_eq!(decoded.hello_type, ServerHelloType::Success);
        assert_eq!(decoded.public_url.as_deref(), Some("http://demo.localhost:8080"));

        let rejection = ServerHello::rejection(ServerHelloType::SubDomainInUse, "taken");
        let text = encode_frame(&rejection).unwrap();
        assert!(text.contains("\"sub_domain_in_use\""));
        let decoded: ServerHello = decode_frame(&text).unwrap();
        assert_eq!(decoded.hello_type, ServerHelloType::SubDomainInUse);
        assert_eq!(decoded.error.as_deref(), Some("taken"));
    }

    #[test]
    fn message_round_trip_all_types() {
        let id = StreamId::generate();

        let init = Message::with_data(
            MessageType::Init,
            Some(id.clone()),
            &InitStreamMessage {
                stream_id: id.clone(),
                protocol: "http".into(),
            },
        )
        .unwrap();
        let decoded: Message = decode_frame(&encode_frame(&init).unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Init);
        let payload: InitStreamMessage = decoded.decode_data().unwrap();
        assert_eq!(payload.stream_id, id);
        assert_eq!(payload.protocol, "http");

        for msg_type in [MessageType::End, MessageType::Ping, MessageType::Pong] {
            let msg = Message::new(msg_type, None);
            let decoded: Message = decode_frame(&encode_frame(&msg).unwrap()).unwrap();
            assert_eq!(decoded.msg_type, msg_type);
            assert!(decoded.data.is_none());
        }
    }

    #[test]
    fn data_message_preserves_arbitrary_octets() {
        let bytes: Vec<u8> = (0..=255).collect();
        let msg = Message::with_data(
            MessageType::Data,
            Some(StreamId::generate()),
            &DataMessage { data: bytes.clone() },
        )
        .unwrap();

        let text = encode_frame(&msg).unwrap();
        let decoded: Message = decode_frame(&text).unwrap();
        let payload: DataMessage = decoded.decode_data().unwrap();
        assert_eq!(payload.data, bytes);
    }

    #[test]
    fn data_message_accepts_byte_array_form() {
        let payload: DataMessage = serde_json::from_str(r#"{"data": [104, 105]}"#).unwrap();
        assert_eq!(payload.data, b"hi");
    }

    #[test]
    fn decoder_tolerates_unknown_fields() {
        let text = r#"{"type":"ping","some_future_field":42}"#;
        let msg: Message = decode_frame(text).unwrap();
        assert_eq!(msg.msg_type, MessageType::Ping);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let huge = "x".repeat(MAX_FRAME_LEN + 1);
        let err = decode_frame::<Message>(&huge).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
    }

    #[test]
    fn secret_key_id_is_deterministic() {
        let key = SecretKey { key: "abc".into() };
        assert_eq!(key.client_id(), key.client_id());
        assert_ne!(key.client_id(), SecretKey { key: "abd".into() }.client_id());
    }

    #[test]
    fn sub_domain_validation() {
        assert!(validate_sub_domain("demo").is_ok());
        assert!(validate_sub_domain("a").is_ok());
        assert!(validate_sub_domain("a-1-b").is_ok());
        assert!(validate_sub_domain(&"a".repeat(63)).is_ok());

        assert!(validate_sub_domain("").is_err());
        assert!(validate_sub_domain(&"a".repeat(64)).is_err());
        assert!(validate_sub_domain("UPPER").is_err());
        assert!(validate_sub_domain("has.dot").is_err());
        assert!(validate_sub_domain("-leading").is_err());
        assert!(validate_sub_domain("trailing-").is_err());
    }

    #[test]
    fn generated_sub_domain_is_valid() {
        for _ in 0..100 {
            let sub = generate_sub_domain();
            assert_eq!(sub.len(), 8);
            assert!(validate_sub_domain(&sub).is_ok());
        }
    }
}
