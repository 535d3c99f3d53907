use anyhow::bail;
use std::time::Duration;

/// Tunables shared by a listener and all of its connections.
#[derive(Debug, Clone)]
pub struct Config {
    /// Retention window for the inbound dedup tables. Entries whose last
    ///  observation is older than this are pruned on every update pass, so
    ///  the window must comfortably exceed the peer's retransmit interval or
    ///  late retransmits will be delivered twice.
    pub age_threshold: Duration,

    /// Value every slot of the round-trip estimator starts with. Deliberately
    ///  conservative - a fresh connection should not retransmit eagerly into
    ///  a path it knows nothing about.
    pub initial_rtt: Duration,

    /// Timeout handed to the receive pump on each iteration of a blocking
    ///  send loop.
    pub pump_timeout: Duration,

    /// Sleep between iterations of a blocking send loop, yielding the thread
    ///  to other connections on the same socket.
    pub block_poll_interval: Duration,

    /// Largest datagram accepted by the inbound pump. The default assumes
    ///  full Ethernet frames without optional IP headers (`1500 - 20 - 8`);
    ///  jumbo-frame deployments can raise it.
    pub max_datagram_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            age_threshold: Duration::from_secs(1),
            initial_rtt: Duration::from_secs(1),
            pump_timeout: Duration::from_millis(1),
            block_poll_interval: Duration::from_millis(1),
            max_datagram_size: 1472,
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size < 16 {
            bail!("max datagram size is too small to hold a control section");
        }
        if self.age_threshold.is_zero() {
            bail!("a zero age threshold disables duplicate detection entirely");
        }
        if self.initial_rtt.is_zero() {
            bail!("a zero initial RTT makes a fresh connection retransmit in a busy loop");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_degenerate_values() {
        let mut config = Config::default();
        config.max_datagram_size = 4;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.age_threshold = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.initial_rtt = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
