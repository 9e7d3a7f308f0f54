//! Prometheus metrics for the billing engine.
//!
//! Metrics live on an explicitly constructed [`BillingMetrics`] registered
//! against a caller-owned [`Registry`], and are handed to whatever needs them.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

pub struct BillingMetrics {
    registry: Registry,
    renewal_runs: IntCounterVec,
    renewal_subscriptions: IntCounter,
    renewal_duration: Histogram,
    payments_registered: IntCounterVec,
    payments_reversed: IntCounter,
    tx_retries: IntCounter,
}

impl BillingMetrics {
    pub fn new(registry: Registry) -> Result<Self, prometheus::Error> {
        let renewal_runs = IntCounterVec::new(
            Opts::new(
                "billing_renewal_runs_total",
                "Renewal job runs by outcome",
            ),
            &["outcome"],
        )?;
        let renewal_subscriptions = IntCounter::new(
            "billing_renewal_subscriptions_total",
            "Subscriptions processed by the renewal job",
        )?;
        let renewal_duration = Histogram::with_opts(HistogramOpts::new(
            "billing_renewal_run_duration_seconds",
            "Renewal job run duration",
        ))?;
        let payments_registered = IntCounterVec::new(
            Opts::new(
                "billing_payments_registered_total",
                "Payments registered by kind",
            ),
            &["kind"],
        )?;
        let payments_reversed = IntCounter::new(
            "billing_payments_reversed_total",
            "Payments reversed",
        )?;
        let tx_retries = IntCounter::new(
            "billing_tx_retries_total",
            "Serializable transactions replayed after a conflict",
        )?;

        registry.register(Box::new(renewal_runs.clone()))?;
        registry.register(Box::new(renewal_subscriptions.clone()))?;
        registry.register(Box::new(renewal_duration.clone()))?;
        registry.register(Box::new(payments_registered.clone()))?;
        registry.register(Box::new(payments_reversed.clone()))?;
        registry.register(Box::new(tx_retries.clone()))?;

        Ok(Self {
            registry,
            renewal_runs,
            renewal_subscriptions,
            renewal_duration,
            payments_registered,
            payments_reversed,
            tx_retries,
        })
    }

    /// Metrics on a private registry that nothing scrapes.
    pub fn detached() -> Result<Self, prometheus::Error> {
        Self::new(Registry::new())
    }

    /// `outcome` is one of `success`, `failure`, `skipped`, `cancelled`.
    pub fn record_renewal_run(&self, outcome: &str, elapsed: Option<Duration>) {
        self.renewal_runs.with_label_values(&[outcome]).inc();
        if let Some(elapsed) = elapsed {
            self.renewal_duration.observe(elapsed.as_secs_f64());
        }
    }

    pub fn record_renewed_subscription(&self) {
        self.renewal_subscriptions.inc();
    }

    pub fn record_payment_registered(&self, kind: &str) {
        self.payments_registered.with_label_values(&[kind]).inc();
    }

    pub fn record_payment_reversed(&self) {
        self.payments_reversed.inc();
    }

    pub fn record_tx_retry(&self) {
        self.tx_retries.inc();
    }

    pub fn renewal_runs(&self, outcome: &str) -> u64 {
        self.renewal_runs.with_label_values(&[outcome]).get()
    }

    pub fn payments_registered(&self, kind: &str) -> u64 {
        self.payments_registered.with_label_values(&[kind]).get()
    }

    pub fn tx_retries(&self) -> u64 {
        self.tx_retries.get()
    }

    /// Encode every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_recorded_counters() {
        let metrics = BillingMetrics::detached().unwrap();
        metrics.record_payment_registered("advance");
        metrics.record_renewal_run("skipped", None);

        let text = metrics.render().unwrap();
        assert!(text.contains("billing_payments_registered_total{kind=\"advance\"} 1"));
        assert!(text.contains("billing_renewal_runs_total{outcome=\"skipped\"} 1"));
    }

    #[test]
    fn registering_twice_on_one_registry_fails() {
        let registry = Registry::new();
        let _first = BillingMetrics::new(registry.clone()).unwrap();
        assert!(BillingMetrics::new(registry).is_err());
    }
}
