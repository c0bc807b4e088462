use crate::error::MeshError;
use crate::token::Token;
use crate::types::{EntityId, MessageId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header carrying a JSON-encoded delegation [`Token`](crate::token::Token).
pub const TOKEN_HEADER_KEY: &str = "x-tessera-token";

/// Marks a payload that may only cross the wire sealed by the session
/// channel. Empty while the payload is plaintext, otherwise the hex id of the
/// server that sealed it.
pub const CONFIDENTIAL_HEADER_KEY: &str = "x-tessera-confidential";

/// Number of times the envelope was forwarded towards a managing node.
pub const HOPS_HEADER_KEY: &str = "x-tessera-hops";

/// Entity version a managing node reached with the write it pushes.
pub const VERSION_HEADER_KEY: &str = "x-tessera-version";

/// A command on the wire between nodes.
///
/// `message_id` is minted by the sender and only ordered relative to other
/// messages from the same sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub sender_id: EntityId,
    pub recipient_id: EntityId,
    pub message_id: MessageId,
    /// Dispatch key of the command.
    pub slug: String,
    /// MessagePack-encoded command arguments.
    pub payload: Vec<u8>,
    #[serde(default)]
    pub signature: Option<Vec<u8>>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl CommandEnvelope {
    pub fn new(
        sender_id: EntityId,
        recipient_id: EntityId,
        message_id: MessageId,
        slug: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            sender_id,
            recipient_id,
            message_id,
            slug: slug.into(),
            payload,
            signature: None,
            headers: HashMap::new(),
        }
    }

    /// Build an envelope whose payload is the MessagePack encoding of `value`.
    pub fn with_value<T: Serialize>(
        sender_id: EntityId,
        recipient_id: EntityId,
        message_id: MessageId,
        slug: impl Into<String>,
        value: &T,
    ) -> Result<Self, MeshError> {
        let payload = rmp_serde::to_vec(value).map_err(|e| MeshError::encode("payload", e))?;
        Ok(Self::new(
            sender_id,
            recipient_id,
            message_id,
            slug,
            payload,
        ))
    }

    /// Decode the payload as `T`.
    pub fn value<T: serde::de::DeserializeOwned>(&self) -> Result<T, MeshError> {
        rmp_serde::from_slice(&self.payload).map_err(|e| MeshError::decode("payload", e))
    }

    /// Bytes covered by the envelope signature: every field except the
    /// signature itself and the headers.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(48 + self.slug.len() + self.payload.len());
        bytes.extend_from_slice(&self.sender_id.as_bytes());
        bytes.extend_from_slice(&self.recipient_id.as_bytes());
        bytes.extend_from_slice(&self.message_id.0.to_be_bytes());
        bytes.extend_from_slice(&(self.slug.len() as u32).to_be_bytes());
        bytes.extend_from_slice(self.slug.as_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MeshError> {
        rmp_serde::to_vec(self).map_err(|e| MeshError::encode("envelope", e))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MeshError> {
        rmp_serde::from_slice(bytes).map_err(|e| MeshError::decode("envelope", e))
    }

    /// Server the envelope should be answered on.
    pub fn reply_server(&self) -> i64 {
        self.sender_id.server_id
    }

    /// Carry `token` so a failed permission can be delegated to its issuer.
    pub fn attach_token(&mut self, token: &Token) -> Result<(), MeshError> {
        self.headers
            .insert(TOKEN_HEADER_KEY.to_string(), token.to_header()?);
        Ok(())
    }

    /// Require the payload to be sealed whenever it leaves this node.
    pub fn mark_confidential(&mut self) {
        self.headers
            .entry(CONFIDENTIAL_HEADER_KEY.to_string())
            .or_default();
    }

    pub fn is_confidential(&self) -> bool {
        self.headers.contains_key(CONFIDENTIAL_HEADER_KEY)
    }

    /// Server whose session key sealed the payload, if it is sealed.
    pub fn sealed_by(&self) -> Result<Option<i64>, MeshError> {
        match self.headers.get(CONFIDENTIAL_HEADER_KEY) {
            None => Ok(None),
            Some(v) if v.is_empty() => Ok(None),
            Some(v) => u64::from_str_radix(v, 16)
                .map(|s| Some(s as i64))
                .map_err(|_| MeshError::malformed(format!("bad sealing server `{v}`"))),
        }
    }

    pub(crate) fn set_sealed_by(&mut self, server_id: Option<i64>) {
        let value = server_id.map(|s| format!("{s:x}")).unwrap_or_default();
        self.headers
            .insert(CONFIDENTIAL_HEADER_KEY.to_string(), value);
    }

    pub fn hops(&self) -> usize {
        self.headers
            .get(HOPS_HEADER_KEY)
            .and_then(|h| h.parse().ok())
            .unwrap_or(0)
    }

    pub(crate) fn increment_hops(&mut self) {
        let hops = self.hops() + 1;
        self.headers
            .insert(HOPS_HEADER_KEY.to_string(), hops.to_string());
    }

    /// Version stamped by the managing node, `None` on ordinary commands.
    pub fn version(&self) -> Option<u64> {
        self.headers
            .get(VERSION_HEADER_KEY)
            .and_then(|v| v.parse().ok())
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.headers
            .insert(VERSION_HEADER_KEY.to_string(), version.to_string());
    }
}
