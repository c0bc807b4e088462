use crate::error::MeshError;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a mesh node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Packed server id of this node (see [`pack_server_id`](crate::types::pack_server_id)).
    /// 0 = offline: ids are minted without server context and nothing is routed.
    pub server_id: i64,
    /// Number of sticky dispatch workers. Default: available cores - 1, at least 1.
    pub worker_count: usize,
    /// How many processed message ids are remembered per sender. Default: 1024.
    pub dedup_window: usize,
    /// Maximum redirect tombstones followed by a single lookup. Default: 16.
    pub redirect_max_hops: usize,
    /// How long the managing node waits for every sibling to confirm a
    /// replicated write before rolling it back. Default: 5s.
    pub sibling_confirm_timeout: Duration,
    /// How long clone-and-subscribe waits for the owning node. Default: 10s.
    pub clone_timeout: Duration,
    /// Default wait for a command confirmation. Default: 30s.
    pub reply_timeout: Duration,
    /// How often parked envelopes are retried. Default: 1s.
    pub outbox_retry_interval: Duration,
    /// Reject tokens whose id was already used once. Default: false.
    pub single_use_tokens: bool,
    /// Reject unsigned envelopes from remote nodes. Default: false.
    pub require_signed_envelopes: bool,
    /// Root directory for file persistence. `None` keeps everything in memory.
    pub data_root: Option<PathBuf>,
}

impl NodeConfig {
    /// Config for a node with the given server id and defaults for everything else.
    pub fn for_server(server_id: i64) -> Self {
        Self {
            server_id,
            ..Default::default()
        }
    }

    /// Validate configuration values.
    ///
    /// Checks:
    /// - `worker_count >= 1`
    /// - `dedup_window >= 1`
    /// - `redirect_max_hops >= 1`
    /// - all timeouts and intervals are non-zero
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.worker_count == 0 {
            return Err(MeshError::InvalidConfig {
                reason: "worker_count must be >= 1".to_string(),
            });
        }
        if self.dedup_window == 0 {
            return Err(MeshError::InvalidConfig {
                reason: "dedup_window must be >= 1".to_string(),
            });
        }
        if self.redirect_max_hops == 0 {
            return Err(MeshError::InvalidConfig {
                reason: "redirect_max_hops must be >= 1".to_string(),
            });
        }
        let durations = [
            ("sibling_confirm_timeout", self.sibling_confirm_timeout),
            ("clone_timeout", self.clone_timeout),
            ("reply_timeout", self.reply_timeout),
            ("outbox_retry_interval", self.outbox_retry_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(MeshError::InvalidConfig {
                    reason: format!("{name} must be > 0"),
                });
            }
        }
        Ok(())
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_id: 0,
            worker_count: default_worker_count(),
            dedup_window: 1024,
            redirect_max_hops: 16,
            sibling_confirm_timeout: Duration::from_secs(5),
            clone_timeout: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(30),
            outbox_retry_interval: Duration::from_secs(1),
            single_use_tokens: false,
            require_signed_envelopes: false,
            data_root: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = NodeConfig::default();
        assert_eq!(config.server_id, 0);
        assert!(config.worker_count >= 1);
        assert_eq!(config.dedup_window, 1024);
        assert_eq!(config.redirect_max_hops, 16);
        assert_eq!(config.sibling_confirm_timeout, Duration::from_secs(5));
        assert!(!config.single_use_tokens);
        assert!(config.data_root.is_none());
    }

    #[test]
    fn default_config_is_valid() {
        NodeConfig::default().validate().unwrap();
        NodeConfig::for_server(7).validate().unwrap();
    }

    #[test]
    fn validate_zero_workers() {
        let config = NodeConfig {
            worker_count: 0,
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("worker_count"), "got: {msg}");
    }

    #[test]
    fn validate_zero_dedup_window() {
        let config = NodeConfig {
            dedup_window: 0,
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("dedup_window"), "got: {msg}");
    }

    #[test]
    fn validate_zero_duration() {
        let config = NodeConfig {
            sibling_confirm_timeout: Duration::ZERO,
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("sibling_confirm_timeout"), "got: {msg}");
    }

    #[test]
    fn server_in_a_high_region_is_valid() {
        let config = NodeConfig::for_server(crate::types::pack_server_id(0x80_0000, 1, 1));
        assert!(config.server_id < 0);
        config.validate().unwrap();
    }
}
