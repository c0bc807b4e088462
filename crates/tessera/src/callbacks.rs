use crate::error::MeshError;
use crate::metrics::MeshMetrics;
use crate::reply::ExitResult;
use crate::types::MessageId;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Continuations waiting for the confirmation of a sent command, keyed by the
/// message id of that command.
pub struct CallbackRegistry {
    pending: DashMap<MessageId, oneshot::Sender<ExitResult>>,
    metrics: Arc<MeshMetrics>,
}

impl CallbackRegistry {
    pub fn new(metrics: Arc<MeshMetrics>) -> Self {
        Self {
            pending: DashMap::new(),
            metrics,
        }
    }

    /// Register interest in the confirmation of `message_id`. Registering the
    /// same id again replaces the earlier continuation.
    pub fn register(self: &Arc<Self>, message_id: MessageId) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        if self.pending.insert(message_id, tx).is_none() {
            self.metrics.pending_callbacks.inc();
        }
        PendingReply {
            message_id,
            rx,
            registry: Arc::clone(self),
        }
    }

    /// Fire the continuation for `message_id`. Returns `false` if none was
    /// waiting, which is the case for late or repeated confirmations.
    pub fn complete(&self, message_id: MessageId, exit: ExitResult) -> bool {
        let Some((_, tx)) = self.pending.remove(&message_id) else {
            debug!(%message_id, "confirmation without pending callback");
            return false;
        };
        self.metrics.pending_callbacks.dec();
        tx.send(exit).is_ok()
    }

    pub fn cancel(&self, message_id: MessageId) {
        if self.pending.remove(&message_id).is_some() {
            self.metrics.pending_callbacks.dec();
        }
    }

    pub fn is_pending(&self, message_id: MessageId) -> bool {
        self.pending.contains_key(&message_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// The caller's side of a registered continuation.
pub struct PendingReply {
    message_id: MessageId,
    rx: oneshot::Receiver<ExitResult>,
    registry: Arc<CallbackRegistry>,
}

impl PendingReply {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Wait for the confirmation. On timeout the continuation is dropped and
    /// a late confirmation is ignored.
    pub async fn wait(self, timeout: Duration) -> Result<ExitResult, MeshError> {
        let message_id = self.message_id;
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(exit)) => Ok(exit),
            Ok(Err(_)) => Err(MeshError::ShuttingDown),
            Err(_) => {
                self.registry.cancel(message_id);
                Err(MeshError::Timeout {
                    message_id,
                    waited: timeout,
                })
            }
        }
    }

    /// Wait and turn the exit into the command's reply bytes.
    pub async fn result(self, timeout: Duration) -> Result<Vec<u8>, MeshError> {
        self.wait(timeout).await?.into_result()
    }

    /// Wait and decode the command's reply as `T`.
    pub async fn value<T: serde::de::DeserializeOwned>(
        self,
        timeout: Duration,
    ) -> Result<T, MeshError> {
        let bytes = self.result(timeout).await?;
        rmp_serde::from_slice(&bytes).map_err(|e| MeshError::decode("command reply", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::ErrorReply;
    use crate::types::EntityId;

    fn registry() -> Arc<CallbackRegistry> {
        Arc::new(CallbackRegistry::new(Arc::new(MeshMetrics::unregistered())))
    }

    #[tokio::test]
    async fn completes_exactly_once() {
        let registry = registry();
        let pending = registry.register(MessageId(7));
        assert!(registry.is_pending(MessageId(7)));

        assert!(registry.complete(MessageId(7), ExitResult::Success(vec![1])));
        assert!(!registry.complete(MessageId(7), ExitResult::Success(vec![2])));

        let exit = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(exit, ExitResult::Success(vec![1]));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_drops_the_continuation() {
        let registry = registry();
        let pending = registry.register(MessageId(8));
        let err = pending.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, MeshError::Timeout { message_id, .. } if message_id == MessageId(8)));
        assert!(!registry.is_pending(MessageId(8)));
        assert!(!registry.complete(MessageId(8), ExitResult::Success(Vec::new())));
    }

    #[tokio::test]
    async fn failure_becomes_error() {
        let registry = registry();
        let pending = registry.register(MessageId(9));
        let id = EntityId::from_parts(1, 1);
        registry.complete(
            MessageId(9),
            ExitResult::Failure(ErrorReply::from_error(&MeshError::ObjectNotFound { id })),
        );
        let err = pending.result(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, MeshError::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn typed_value() {
        let registry = registry();
        let pending = registry.register(MessageId(10));
        registry.complete(
            MessageId(10),
            ExitResult::Success(rmp_serde::to_vec(&42i64).unwrap()),
        );
        let value: i64 = pending.value(Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, 42);
    }
}
