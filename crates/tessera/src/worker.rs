use crate::envelope::CommandEnvelope;
use crate::error::MeshError;
use crate::hash::worker_for_sender;
use crate::node::MeshNode;
use crate::types::EntityId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Weak;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fixed set of dispatch tasks, each draining its own queue.
///
/// Every sender hashes to one worker, so a sender's commands are taken up
/// one at a time in arrival order. Commands whose settings mark them thread
/// safe are spawned off the worker instead of blocking it, and so is the
/// wait for siblings after a replicated write.
pub(crate) struct WorkerPool {
    queues: Vec<mpsc::UnboundedSender<CommandEnvelope>>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn spawn(node: Weak<MeshNode>, count: usize, cancel: CancellationToken) -> Self {
        let count = count.max(1);
        let mut queues = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.push(tx);
            handles.push(tokio::spawn(run_worker(
                index,
                node.clone(),
                rx,
                cancel.clone(),
            )));
        }
        Self {
            queues,
            handles: parking_lot::Mutex::new(handles),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.queues.len()
    }

    pub(crate) fn submit(&self, envelope: CommandEnvelope) -> Result<(), MeshError> {
        let index = worker_for_sender(&envelope.sender_id, self.queues.len());
        self.queues[index]
            .send(envelope)
            .map_err(|_| MeshError::ShuttingDown)
    }

    /// Wait for every worker task to finish.
    pub(crate) async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn run_worker(
    index: usize,
    node: Weak<MeshNode>,
    mut rx: mpsc::UnboundedReceiver<CommandEnvelope>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => {
                let Some(envelope) = next else { break };
                let Some(node) = node.upgrade() else { break };
                if node.is_thread_safe(&envelope) {
                    tokio::spawn(async move { node.process_detached(envelope).await });
                } else {
                    node.process_in_order(envelope).await;
                }
            }
        }
    }
    rx.close();
    debug!(index, "worker stopped");
}

/// Entities with a command in progress, each with the commands that
/// arrived for it meanwhile.
#[derive(Default)]
pub(crate) struct EntityQueues {
    queues: DashMap<EntityId, VecDeque<CommandEnvelope>>,
}

impl EntityQueues {
    /// Claim the recipient of `envelope`. Hands the envelope back when the
    /// caller now runs the entity, otherwise parks it.
    pub(crate) fn claim(&self, envelope: CommandEnvelope) -> Option<CommandEnvelope> {
        match self.queues.entry(envelope.recipient_id) {
            Entry::Occupied(mut queue) => {
                queue.get_mut().push_back(envelope);
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::new());
                Some(envelope)
            }
        }
    }

    /// Next parked command for `id`. Releases the claim when there is none.
    pub(crate) fn next(&self, id: &EntityId) -> Option<CommandEnvelope> {
        match self.queues.entry(*id) {
            Entry::Occupied(mut queue) => {
                let next = queue.get_mut().pop_front();
                if next.is_none() {
                    queue.remove();
                }
                next
            }
            Entry::Vacant(_) => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_claimed(&self, id: &EntityId) -> bool {
        self.queues.contains_key(id)
    }
}
