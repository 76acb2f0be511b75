use crate::orchestrator::SchedulingStrategy;
use serde::Deserialize;
use std::path::Path;

/// Listener and transport settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_address: String,
    pub listen_port: u16,
    pub max_connections: u32,
    pub connection_timeout_s: u64,
    pub heartbeat_interval_s: u64,
    pub enable_tls: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 9470,
            max_connections: 256,
            connection_timeout_s: 30,
            heartbeat_interval_s: 15,
            enable_tls: false,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

/// Scheduling and worker-pool settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PerformanceConfig {
    pub default_strategy: SchedulingStrategy,
    pub max_concurrent_tasks: usize,
    pub worker_threads: usize,
    pub task_timeout_ms: u64,
    pub trust_weight: f64,
    pub speed_weight: f64,
    pub power_weight: f64,
    pub cost_weight: f64,
    pub enable_adaptive_scheduling: bool,
    /// How stale telemetry may be before a candidate is filtered out.
    pub telemetry_freshness_s: i64,
    /// Ceiling the latency sub-score normalizes against.
    pub max_acceptable_latency_ms: f64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            default_strategy: SchedulingStrategy::WeightedScore,
            max_concurrent_tasks: 64,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            task_timeout_ms: 30_000,
            trust_weight: 0.6,
            speed_weight: 0.3,
            power_weight: 0.1,
            cost_weight: 0.0,
            enable_adaptive_scheduling: false,
            telemetry_freshness_s: 120,
            max_acceptable_latency_ms: 1_000.0,
        }
    }
}

/// Pricing, slashing, and reputation economics.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EconomicConfig {
    pub default_max_cost_tokens: f64,
    pub min_reputation_threshold: f64,
    pub enable_dynamic_pricing: bool,
    pub price_adjustment_rate: f64,
    pub slashing_penalty: f64,
    pub reputation_decay_rate: f64,
}

impl Default for EconomicConfig {
    fn default() -> Self {
        Self {
            default_max_cost_tokens: 100.0,
            min_reputation_threshold: 0.2,
            enable_dynamic_pricing: false,
            price_adjustment_rate: 0.05,
            slashing_penalty: 0.1,
            reputation_decay_rate: 0.01,
        }
    }
}

/// Metrics and logging sinks.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enable_metrics: bool,
    pub enable_logging: bool,
    pub metrics_endpoint: String,
    pub metrics_interval_s: u64,
    pub log_level: String,
    pub log_path: Option<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            enable_logging: true,
            metrics_endpoint: "/metrics".to_string(),
            metrics_interval_s: 30,
            log_level: "info".to_string(),
            log_path: None,
        }
    }
}

/// Optional subsystem toggles.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeatureFlags {
    pub enable_zk_proofs: bool,
    pub enable_federated_learning: bool,
    pub enable_green_scheduling: bool,
    pub enable_load_rebalancing: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_zk_proofs: false,
            enable_federated_learning: true,
            enable_green_scheduling: true,
            enable_load_rebalancing: false,
        }
    }
}

/// Peer discovery settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub bootstrap_peers: Vec<String>,
    pub discovery_interval_s: u64,
    pub min_peer_count: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers: Vec::new(),
            discovery_interval_s: 60,
            min_peer_count: 1,
        }
    }
}

/// Full declarative configuration surface of the engine. Unknown keys are
/// rejected so typos fail loudly at load time.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct MeshConfig {
    pub network: NetworkConfig,
    pub performance: PerformanceConfig,
    pub economic: EconomicConfig,
    pub monitoring: MonitoringConfig,
    pub features: FeatureFlags,
    pub discovery: DiscoveryConfig,
}

impl MeshConfig {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let config = MeshConfig::default();
        assert_eq!(config.performance.trust_weight, 0.6);
        assert_eq!(config.performance.speed_weight, 0.3);
        assert_eq!(config.performance.power_weight, 0.1);
        assert_eq!(config.performance.telemetry_freshness_s, 120);
        assert_eq!(config.discovery.discovery_interval_s, 60);
        assert!(config.monitoring.enable_metrics);
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let config = MeshConfig::from_toml_str(
            r#"
            [performance]
            worker_threads = 2
            default_strategy = "round_robin"

            [economic]
            min_reputation_threshold = 0.5

            [discovery]
            bootstrap_peers = ["node-a:9470", "node-b:9470"]
            "#,
        )
        .unwrap();
        assert_eq!(config.performance.worker_threads, 2);
        assert_eq!(
            config.performance.default_strategy,
            SchedulingStrategy::RoundRobin
        );
        assert_eq!(config.economic.min_reputation_threshold, 0.5);
        assert_eq!(config.discovery.bootstrap_peers.len(), 2);
        // Untouched sections keep defaults.
        assert_eq!(config.network.listen_port, 9470);
    }

    #[test]
    fn unknown_sections_are_rejected() {
        assert!(MeshConfig::from_toml_str("[surprise]\nkey = 1\n").is_err());
    }
}
