use rdkafka::ClientConfig;

/// Kafka consumer configuration builder with defaults for sink tasks.
///
/// Offsets are only ever committed explicitly by the task, so auto commit and
/// auto offset store are both disabled.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Sets: auto.offset.store=false, auto.commit=false, socket.timeout.ms,
    /// session.timeout.ms, heartbeat.interval.ms, max.poll.interval.ms.
    pub fn for_sink_task(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "45000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    /// Where to start when the group has no committed offset: "earliest" or "latest"
    pub fn with_offset_reset(mut self, reset: &str) -> Self {
        self.config.set("auto.offset.reset", reset);
        self
    }

    pub fn with_session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_task_defaults_disable_auto_commit() {
        let config = ConsumerConfigBuilder::for_sink_task("localhost:9092", "connect-test").build();

        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("group.id"), Some("connect-test"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
    }

    #[test]
    fn tls_is_opt_in() {
        let plain = ConsumerConfigBuilder::for_sink_task("h", "g").with_tls(false).build();
        assert_eq!(plain.get("security.protocol"), None);

        let tls = ConsumerConfigBuilder::for_sink_task("h", "g").with_tls(true).build();
        assert_eq!(tls.get("security.protocol"), Some("ssl"));
    }

    #[test]
    fn overrides_apply() {
        let config = ConsumerConfigBuilder::for_sink_task("h", "g")
            .with_offset_reset("latest")
            .with_session_timeout_ms(10_000)
            .set("client.id", "sink-0")
            .build();

        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("session.timeout.ms"), Some("10000"));
        assert_eq!(config.get("client.id"), Some("sink-0"));
    }
}
