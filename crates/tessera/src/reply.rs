use crate::error::MeshError;
use crate::types::{EntityId, MessageId};
use serde::{Deserialize, Serialize};

/// Payload of a `receiveConfirm` envelope: the outcome of a command the
/// recipient sent earlier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub message_id: MessageId,
    pub exit: ExitResult,
}

/// Result of processing a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitResult {
    /// MessagePack-encoded return value of the command (empty for none).
    Success(Vec<u8>),
    Failure(ErrorReply),
}

impl ExitResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitResult::Success(_))
    }

    /// Turn the exit into the caller-facing result.
    pub fn into_result(self) -> Result<Vec<u8>, MeshError> {
        match self {
            ExitResult::Success(bytes) => Ok(bytes),
            ExitResult::Failure(reply) => Err(reply.into_error()),
        }
    }
}

/// Serializable form of a [`MeshError`] sent back to the original sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub slug: String,
    pub message: String,
    pub code: Option<u16>,
    /// Entity the error refers to, when there is one.
    #[serde(default)]
    pub subject: Option<EntityId>,
}

impl ErrorReply {
    pub fn from_error(err: &MeshError) -> Self {
        let subject = match err {
            MeshError::ObjectNotFound { id } => Some(*id),
            MeshError::ReplicationFailed { id, .. } => Some(*id),
            MeshError::PermissionNotMet { target, .. } => Some(*target),
            MeshError::UnknownCommand { target, .. } => *target,
            _ => None,
        };
        Self {
            slug: err.slug().to_string(),
            message: err.to_string(),
            code: err.response_code(),
            subject,
        }
    }

    /// Rebuild a typed error where the slug identifies one unambiguously.
    pub fn into_error(self) -> MeshError {
        match (self.slug.as_str(), self.subject) {
            ("object_not_found", Some(id)) => MeshError::ObjectNotFound { id },
            ("replication_failed", Some(id)) => MeshError::ReplicationFailed {
                id,
                reason: self.message,
            },
            ("token_invalid", _) => MeshError::TokenInvalid {
                reason: self.message,
            },
            ("invalid_signature", _) => MeshError::InvalidSignature,
            _ => MeshError::Remote {
                slug: self.slug,
                message: self.message,
                code: self.code,
            },
        }
    }
}
