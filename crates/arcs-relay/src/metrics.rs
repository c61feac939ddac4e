use prometheus::{
    register_counter_with_registry, register_gauge_with_registry, Counter, Gauge, Registry,
};
use std::sync::Arc;

pub struct RelayMetrics {
    pub active_sessions: Gauge,
    pub active_connections: Gauge,
    pub frames_routed: Counter,
    pub frames_dropped: Counter,
    pub bytes_relayed: Counter,
    pub commands_forwarded: Counter,
    pub commands_rejected: Counter,
    pub auth_success: Counter,
    pub auth_failure: Counter,
    pub rate_limit_hits: Counter,
    pub registry: Arc<Registry>,
}

impl RelayMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let active_sessions = register_gauge_with_registry!(
            "arcs_relay_active_sessions",
            "Number of live sessions",
            registry
        )?;

        let active_connections = register_gauge_with_registry!(
            "arcs_relay_active_connections",
            "Number of live WebSocket connections",
            registry
        )?;

        let frames_routed = register_counter_with_registry!(
            "arcs_relay_frames_routed_total",
            "Video frames fanned out to controllers",
            registry
        )?;

        let frames_dropped = register_counter_with_registry!(
            "arcs_relay_frames_dropped_total",
            "Video frames dropped by full controller queues",
            registry
        )?;

        let bytes_relayed = register_counter_with_registry!(
            "arcs_relay_bytes_relayed_total",
            "Video bytes received from device-legs",
            registry
        )?;

        let commands_forwarded = register_counter_with_registry!(
            "arcs_relay_commands_forwarded_total",
            "Control commands forwarded to device-legs",
            registry
        )?;

        let commands_rejected = register_counter_with_registry!(
            "arcs_relay_commands_rejected_total",
            "Control commands rejected by validation or rate limiting",
            registry
        )?;

        let auth_success = register_counter_with_registry!(
            "arcs_relay_auth_success_total",
            "Successful device authentications",
            registry
        )?;

        let auth_failure = register_counter_with_registry!(
            "arcs_relay_auth_failure_total",
            "Rejected device authentications",
            registry
        )?;

        let rate_limit_hits = register_counter_with_registry!(
            "arcs_relay_rate_limit_hits_total",
            "Operations denied by the rate limiter",
            registry
        )?;

        Ok(Self {
            active_sessions,
            active_connections,
            frames_routed,
            frames_dropped,
            bytes_relayed,
            commands_forwarded,
            commands_rejected,
            auth_success,
            auth_failure,
            rate_limit_hits,
            registry,
        })
    }

    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new().unwrap()
    }
}
