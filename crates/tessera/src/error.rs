use crate::types::{EntityId, MessageId};
use std::time::Duration;

/// Errors that can occur while addressing, dispatching or replicating commands.
///
/// Every variant carries a machine readable [`slug`](MeshError::slug) and an
/// optional [`response_code`](MeshError::response_code) so it can travel back
/// to the original sender inside a failure confirmation.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("object {id} not found")]
    ObjectNotFound { id: EntityId },

    #[error("unknown command `{slug}`{}", on_target(.target))]
    UnknownCommand {
        slug: String,
        target: Option<EntityId>,
    },

    #[error("command `{slug}` is already registered")]
    AlreadyRegistered { slug: String },

    #[error("entity already has id {id}")]
    AlreadyAssigned { id: EntityId },

    #[error("permission {permission} not met by {sender} on {target} for `{command}`")]
    PermissionNotMet {
        permission: String,
        target: EntityId,
        sender: EntityId,
        command: String,
    },

    #[error("token invalid: {reason}")]
    TokenInvalid { reason: String },

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("malformed message: {reason}")]
    MalformedMessage {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("persistence error: {reason}")]
    PersistenceError {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("server {server_id:x} unavailable")]
    ServerUnavailable {
        server_id: i64,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("replication of {id} failed: {reason}")]
    ReplicationFailed { id: EntityId, reason: String },

    #[error("no reply for message {message_id} after {waited:?}")]
    Timeout {
        message_id: MessageId,
        waited: Duration,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("command handler failed: {reason}")]
    HandlerFailed { reason: String },

    #[error("remote error {slug}: {message}")]
    Remote {
        slug: String,
        message: String,
        code: Option<u16>,
    },

    #[error("node is shutting down")]
    ShuttingDown,
}

fn on_target(target: &Option<EntityId>) -> String {
    target.map(|t| format!(" on {t}")).unwrap_or_default()
}

impl MeshError {
    /// Machine readable identifier of the error kind.
    pub fn slug(&self) -> &str {
        match self {
            MeshError::ObjectNotFound { .. } => "object_not_found",
            MeshError::UnknownCommand { .. } => "unknown_command",
            MeshError::AlreadyRegistered { .. } => "already_registered",
            MeshError::AlreadyAssigned { .. } => "already_assigned",
            MeshError::PermissionNotMet { .. } => "permission_not_met",
            MeshError::TokenInvalid { .. } => "token_invalid",
            MeshError::InvalidSignature => "invalid_signature",
            MeshError::MalformedMessage { .. } => "malformed_message",
            MeshError::PersistenceError { .. } => "persistence_error",
            MeshError::ServerUnavailable { .. } => "server_unavailable",
            MeshError::ReplicationFailed { .. } => "replication_failed",
            MeshError::Timeout { .. } => "timeout",
            MeshError::InvalidConfig { .. } => "invalid_config",
            MeshError::HandlerFailed { .. } => "handler_failed",
            MeshError::Remote { slug, .. } => slug,
            MeshError::ShuttingDown => "shutting_down",
        }
    }

    /// HTTP-style status code for the error, when one applies.
    pub fn response_code(&self) -> Option<u16> {
        match self {
            MeshError::ObjectNotFound { .. } | MeshError::UnknownCommand { .. } => Some(404),
            MeshError::PermissionNotMet { .. } => Some(403),
            MeshError::TokenInvalid { .. } | MeshError::InvalidSignature => Some(401),
            MeshError::AlreadyRegistered { .. } | MeshError::AlreadyAssigned { .. } => Some(409),
            MeshError::MalformedMessage { .. } => Some(400),
            MeshError::ServerUnavailable { .. } | MeshError::ShuttingDown => Some(503),
            MeshError::Timeout { .. } => Some(504),
            MeshError::ReplicationFailed { .. }
            | MeshError::HandlerFailed { .. }
            | MeshError::PersistenceError { .. } => Some(500),
            MeshError::Remote { code, .. } => *code,
            MeshError::InvalidConfig { .. } => None,
        }
    }

    /// Whether the failure should be answered to the sender rather than retried.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MeshError::ServerUnavailable { .. })
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        MeshError::MalformedMessage {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn decode(what: &str, err: rmp_serde::decode::Error) -> Self {
        MeshError::MalformedMessage {
            reason: format!("failed to decode {what}"),
            source: Some(Box::new(err)),
        }
    }

    pub fn encode(what: &str, err: rmp_serde::encode::Error) -> Self {
        MeshError::MalformedMessage {
            reason: format!("failed to encode {what}"),
            source: Some(Box::new(err)),
        }
    }
}
