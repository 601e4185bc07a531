use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine-level tunables. These cover the session machinery only; transport
/// and encoding behavior belongs to the active profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Payload size above which outbound packets are fragmented.
    /// Zero disables fragmentation.
    pub frag_limit: usize,

    /// Consecutive failed exchanges tolerated before a session closes.
    pub max_errors: u8,

    /// How long spawn/migrate will poll for the child pipe.
    #[serde(with = "secs")]
    pub spawn_timeout: Duration,

    /// Outbound packet queue depth per session.
    pub send_queue_capacity: usize,

    /// Inbound packet queue depth, used once receiving is enabled.
    pub recv_queue_capacity: usize,

    /// Wake signal depth. More than one buffered wake has no effect.
    pub wake_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frag_limit: 0,
            max_errors: 3,
            spawn_timeout: Duration::from_secs(10),
            send_queue_capacity: 256,
            recv_queue_capacity: 256,
            wake_queue_capacity: 1,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::UmbraError::Config(e.to_string()))
    }

    pub fn save_to_file(&self, path: &Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::UmbraError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = EngineConfig::default();
        assert_eq!(c.frag_limit, 0);
        assert_eq!(c.max_errors, 3);
        assert_eq!(c.spawn_timeout, Duration::from_secs(10));
        assert_eq!(c.send_queue_capacity, 256);
        assert_eq!(c.recv_queue_capacity, 256);
        assert_eq!(c.wake_queue_capacity, 1);
    }

    #[test]
    fn toml_roundtrip() {
        let c = EngineConfig {
            frag_limit: 4096,
            max_errors: 5,
            ..Default::default()
        };
        let s = toml::to_string_pretty(&c).unwrap();
        let d: EngineConfig = toml::from_str(&s).unwrap();
        assert_eq!(d.frag_limit, 4096);
        assert_eq!(d.max_errors, 5);
        assert_eq!(d.spawn_timeout, Duration::from_secs(10));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let d: EngineConfig = toml::from_str("frag_limit = 128").unwrap();
        assert_eq!(d.frag_limit, 128);
        assert_eq!(d.max_errors, 3);
    }
}
