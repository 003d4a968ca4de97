use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Prometheus registry and the handles the rest of the crate records into.
/// Metric names and labels follow the gateway's own `whatsapp_` namespace;
/// default process metrics are registered under `whatsapp_api_`.
pub struct Metrics {
    registry: Registry,
    pub sessions_active: Gauge,
    pub messages_sent_total: CounterVec,
    pub messages_received_total: CounterVec,
    pub errors_total: CounterVec,
    pub ai_latency_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let sessions_active = Gauge::with_opts(Opts::new(
            "whatsapp_sessions_active",
            "Number of agent sessions currently connected",
        ))?;

        let messages_sent_total = CounterVec::new(
            Opts::new("whatsapp_messages_sent_total", "Messages sent to the chat network"),
            &["agentId"],
        )?;

        let messages_received_total = CounterVec::new(
            Opts::new(
                "whatsapp_messages_received_total",
                "Inbound messages accepted by the dispatcher",
            ),
            &["agentId"],
        )?;

        let errors_total = CounterVec::new(
            Opts::new("whatsapp_errors_total", "Errors raised, labelled by taxonomy code"),
            &["agentId", "code"],
        )?;

        let ai_latency_seconds = HistogramVec::new(
            HistogramOpts::new("whatsapp_ai_latency_seconds", "AI backend call latency")
                .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
            &["agentId"],
        )?;

        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(messages_sent_total.clone()))?;
        registry.register(Box::new(messages_received_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(ai_latency_seconds.clone()))?;

        let process_collector = prometheus::process_collector::ProcessCollector::new(
            std::process::id() as i32,
            "whatsapp_api".to_string(),
        );
        registry.register(Box::new(process_collector))?;

        Ok(Self {
            registry,
            sessions_active,
            messages_sent_total,
            messages_received_total,
            errors_total,
            ai_latency_seconds,
        })
    }

    /// Render the Prometheus text exposition format for `GET /metrics`.
    pub fn render(&self) -> anyhow::Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_gateway_metric_names() {
        let metrics = Metrics::new().expect("metrics should construct");
        metrics.sessions_active.set(2.0);
        metrics
            .messages_sent_total
            .with_label_values(&["a1"])
            .inc();

        let body = metrics.render().expect("render should succeed");
        assert!(body.contains("whatsapp_sessions_active 2"));
        assert!(body.contains("whatsapp_messages_sent_total"));
    }
}
