use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Node-level prometheus metrics.
pub struct MeshMetrics {
    /// Live entities resident in the entity table.
    pub entities: IntGauge,
    /// Proxy entities waiting for a clone to complete.
    pub proxies: IntGauge,
    /// Registered continuations waiting for a confirmation.
    pub pending_callbacks: IntGauge,
    pub commands_dispatched: IntCounter,
    pub duplicates_suppressed: IntCounter,
    pub rollbacks: IntCounter,
    /// Envelopes waiting in the outbox for an unreachable server.
    pub parked_envelopes: IntGauge,
}

impl MeshMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::build()?;
        registry.register(Box::new(metrics.entities.clone()))?;
        registry.register(Box::new(metrics.proxies.clone()))?;
        registry.register(Box::new(metrics.pending_callbacks.clone()))?;
        registry.register(Box::new(metrics.commands_dispatched.clone()))?;
        registry.register(Box::new(metrics.duplicates_suppressed.clone()))?;
        registry.register(Box::new(metrics.rollbacks.clone()))?;
        registry.register(Box::new(metrics.parked_envelopes.clone()))?;
        Ok(metrics)
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self::build().expect("metric names are static and valid")
    }

    fn build() -> Result<Self, prometheus::Error> {
        Ok(Self {
            entities: IntGauge::with_opts(Opts::new(
                "mesh_entities",
                "Number of live entities in the entity table",
            ))?,
            proxies: IntGauge::with_opts(Opts::new(
                "mesh_proxies",
                "Number of proxy entities buffering commands",
            ))?,
            pending_callbacks: IntGauge::with_opts(Opts::new(
                "mesh_pending_callbacks",
                "Number of commands waiting for a confirmation",
            ))?,
            commands_dispatched: IntCounter::with_opts(Opts::new(
                "mesh_commands_dispatched_total",
                "Commands executed against an entity",
            ))?,
            duplicates_suppressed: IntCounter::with_opts(Opts::new(
                "mesh_duplicates_suppressed_total",
                "Redelivered envelopes dropped by duplicate suppression",
            ))?,
            rollbacks: IntCounter::with_opts(Opts::new(
                "mesh_rollbacks_total",
                "Writes undone after failed sibling replication",
            ))?,
            parked_envelopes: IntGauge::with_opts(Opts::new(
                "mesh_parked_envelopes",
                "Envelopes parked for unreachable servers",
            ))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_metrics_work() {
        let m = MeshMetrics::unregistered();
        m.entities.set(5);
        m.rollbacks.inc();
        assert_eq!(m.entities.get(), 5);
        assert_eq!(m.rollbacks.get(), 1);
    }

    #[test]
    fn registered_metrics_work() {
        let r = Registry::new();
        let m = MeshMetrics::new(&r).unwrap();
        m.parked_envelopes.set(3);
        assert_eq!(m.parked_envelopes.get(), 3);
        assert_eq!(r.gather().len(), 7);
    }

    #[test]
    fn double_registration_fails() {
        let r = Registry::new();
        let _first = MeshMetrics::new(&r).unwrap();
        assert!(MeshMetrics::new(&r).is_err());
    }
}
