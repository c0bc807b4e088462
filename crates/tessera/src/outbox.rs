use crate::envelope::CommandEnvelope;
use crate::error::MeshError;
use crate::metrics::MeshMetrics;
use crate::persistence::{outbox_key, Persistence};
use crate::transport::CommandTransmit;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Store-and-forward queue for envelopes whose destination was unreachable.
///
/// Envelopes are kept per destination server in send order, in memory and
/// as append-only records under `outbox/<server>`. While a server has parked
/// envelopes, new ones for it queue up behind them.
pub struct Outbox {
    parked: DashMap<i64, VecDeque<CommandEnvelope>>,
    flush_locks: DashMap<i64, Arc<Mutex<()>>>,
    persistence: Arc<dyn Persistence>,
    metrics: Arc<MeshMetrics>,
}

impl Outbox {
    pub fn new(persistence: Arc<dyn Persistence>, metrics: Arc<MeshMetrics>) -> Self {
        Self {
            parked: DashMap::new(),
            flush_locks: DashMap::new(),
            persistence,
            metrics,
        }
    }

    pub fn has_parked(&self, server_id: i64) -> bool {
        self.parked
            .get(&server_id)
            .is_some_and(|q| !q.is_empty())
    }

    pub fn parked_for(&self, server_id: i64) -> usize {
        self.parked.get(&server_id).map(|q| q.len()).unwrap_or(0)
    }

    /// Servers with at least one parked envelope.
    pub fn servers(&self) -> Vec<i64> {
        self.parked
            .iter()
            .filter(|q| !q.is_empty())
            .map(|q| *q.key())
            .collect()
    }

    #[instrument(skip(self, envelope), fields(server_id, slug = %envelope.slug, message_id = %envelope.message_id))]
    pub async fn park(&self, server_id: i64, envelope: CommandEnvelope) -> Result<(), MeshError> {
        self.persistence
            .append_record(&outbox_key(server_id), &envelope.to_bytes()?)
            .await?;
        self.parked.entry(server_id).or_default().push_back(envelope);
        self.metrics.parked_envelopes.inc();
        warn!("parked envelope for unreachable server");
        Ok(())
    }

    /// Redeliver everything parked for `server_id` in order, stopping at the
    /// first failure. Envelopes left behind by an earlier run are picked up
    /// from persistence. Returns how many were delivered.
    #[instrument(skip(self, transport))]
    pub async fn flush(
        &self,
        server_id: i64,
        transport: &dyn CommandTransmit,
    ) -> Result<usize, MeshError> {
        let lock = self
            .flush_locks
            .entry(server_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if !self.has_parked(server_id) {
            self.restore(server_id).await?;
        }

        let mut delivered = 0;
        loop {
            let next = self
                .parked
                .get(&server_id)
                .and_then(|q| q.front().cloned());
            let Some(envelope) = next else {
                break;
            };
            match transport.send(server_id, envelope).await {
                Ok(()) => {
                    if let Some(mut queue) = self.parked.get_mut(&server_id) {
                        queue.pop_front();
                    }
                    self.metrics.parked_envelopes.dec();
                    delivered += 1;
                }
                Err(err) if !err.is_terminal() => {
                    debug!(%err, "server still unreachable");
                    break;
                }
                Err(err) => {
                    if let Some(mut queue) = self.parked.get_mut(&server_id) {
                        queue.pop_front();
                    }
                    self.metrics.parked_envelopes.dec();
                    warn!(%err, "dropping undeliverable envelope");
                }
            }
        }

        if delivered > 0 {
            self.rewrite(server_id).await?;
            debug!(delivered, "flushed parked envelopes");
        }
        Ok(delivered)
    }

    async fn restore(&self, server_id: i64) -> Result<(), MeshError> {
        let records = self.persistence.read_records(&outbox_key(server_id)).await?;
        if records.is_empty() {
            return Ok(());
        }
        let mut queue = VecDeque::with_capacity(records.len());
        for record in records {
            queue.push_back(CommandEnvelope::from_bytes(&record)?);
        }
        self.metrics.parked_envelopes.add(queue.len() as i64);
        self.parked.insert(server_id, queue);
        Ok(())
    }

    async fn rewrite(&self, server_id: i64) -> Result<(), MeshError> {
        let key = outbox_key(server_id);
        let remaining: Vec<CommandEnvelope> = self
            .parked
            .get(&server_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default();
        self.persistence.delete(&key).await?;
        for envelope in &remaining {
            self.persistence
                .append_record(&key, &envelope.to_bytes()?)
                .await?;
        }
        if remaining.is_empty() {
            self.parked.remove(&server_id);
        }
        Ok(())
    }
}
