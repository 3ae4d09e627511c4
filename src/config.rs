use crate::error::{Result, TunnelError};
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Ambient knobs for the supervisor. Intercept rules are not configured here —
/// they arrive through [`crate::TunnelCore::intercept`] at runtime.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TunnelConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Cadence at which the embedded stack's retransmission/timeout timers
    /// are serviced (spec §4.4: "10 ms cadence").
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Default TCP idle timeout in seconds. `None` means unset (spec §4.5).
    #[serde(default)]
    pub tcp_idle_timeout_secs: Option<u64>,

    /// Default UDP idle timeout in seconds (spec §4.6: "tens of seconds").
    #[serde(default = "default_udp_idle_timeout_secs")]
    pub udp_idle_timeout_secs: u64,

    #[serde(default = "default_rawsock_buf_len")]
    pub rawsock_buf_len: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_interval_ms() -> u64 {
    10
}

fn default_mtu() -> usize {
    1500
}

fn default_udp_idle_timeout_secs() -> u64 {
    60
}

fn default_rawsock_buf_len() -> usize {
    16384
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            log_level: default_log_level(),
            tick_interval_ms: default_tick_interval_ms(),
            mtu: default_mtu(),
            tcp_idle_timeout_secs: None,
            udp_idle_timeout_secs: default_udp_idle_timeout_secs(),
            rawsock_buf_len: default_rawsock_buf_len(),
        }
    }
}

impl TunnelConfig {
    /// Load from `tunnel.toml` (if present) merged with `TUNNEL_`-prefixed
    /// environment overrides, falling back to defaults for anything unset.
    pub fn load() -> Result<Self> {
        figment::Figment::from(Serialized::defaults(TunnelConfig::default()))
            .merge(Toml::file("tunnel.toml"))
            .merge(Env::prefixed("TUNNEL_"))
            .extract()
            .map_err(|e| TunnelError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = TunnelConfig::default();
        assert_eq!(cfg.tick_interval_ms, 10);
        assert_eq!(cfg.tcp_idle_timeout_secs, None);
        assert_eq!(cfg.udp_idle_timeout_secs, 60);
    }

    #[test]
    fn env_overrides_default() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("TUNNEL_TICK_INTERVAL_MS", "25");
            let cfg = TunnelConfig::load().unwrap();
            assert_eq!(cfg.tick_interval_ms, 25);
            Ok(())
        });
    }
}
