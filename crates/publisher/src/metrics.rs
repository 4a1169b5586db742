//! Prometheus metrics, registered on an explicitly passed [Registry].

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Progress gauges and counters shared by producer stages and the status service.
#[derive(Clone)]
pub struct Metrics {
    pub source_tick: IntGauge,
    pub source_epoch: IntGauge,
    pub processed_tick: IntGauge,
    pub processed_epoch: IntGauge,
    pub processed_tick_count: IntCounter,
    pub processed_message_count: IntCounter,
}

impl Metrics {
    pub fn new(registry: &Registry, namespace: &str) -> Result<Self, prometheus::Error> {
        let gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let g = IntGauge::with_opts(Opts::new(name, help).namespace(namespace))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::with_opts(Opts::new(name, help).namespace(namespace))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        Ok(Self {
            source_tick: gauge("source_tick", "Latest tick reported by the source")?,
            source_epoch: gauge("source_epoch", "Latest epoch reported by the source")?,
            processed_tick: gauge("processed_tick", "Last processed tick")?,
            processed_epoch: gauge("processed_epoch", "Last processed epoch")?,
            processed_tick_count: counter("processed_tick_count", "Number of processed ticks")?,
            processed_message_count: counter(
                "processed_message_count",
                "Number of published or indexed messages",
            )?,
        })
    }

    pub fn set_source(&self, tick: u32, epoch: u32) {
        self.source_tick.set(i64::from(tick));
        self.source_epoch.set(i64::from(epoch));
    }

    pub fn set_processed(&self, tick: u32, epoch: u32) {
        self.processed_tick.set(i64::from(tick));
        self.processed_epoch.set(i64::from(epoch));
    }
}

/// Text exposition of everything in `registry`.
pub fn encode(registry: &Registry) -> String {
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buf) {
        tracing::warn!(reason = %e, "metrics encode failed");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_are_namespaced_and_exposed() {
        let registry = Registry::new();
        let m = Metrics::new(&registry, "qubic_test").unwrap();
        m.set_source(100, 3);
        m.set_processed(90, 3);
        m.processed_tick_count.inc_by(5);
        let text = encode(&registry);
        assert!(text.contains("qubic_test_source_tick 100"));
        assert!(text.contains("qubic_test_processed_tick 90"));
        assert!(text.contains("qubic_test_processed_tick_count 5"));
    }

    #[test]
    fn separate_registries_do_not_collide() {
        let a = Registry::new();
        let b = Registry::new();
        assert!(Metrics::new(&a, "x").is_ok());
        assert!(Metrics::new(&b, "x").is_ok());
        assert!(Metrics::new(&a, "x").is_err());
    }
}
