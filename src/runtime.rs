use std::sync::Arc;

use crate::config::EngineConfig;
use crate::device::{DeviceId, Machine};
use crate::profile::Profile;

/// Parses a marshaled profile back into a live one. Registered once so
/// profile-swap tasks and migration targets can rebuild their policy.
pub type ProfileParser =
    Arc<dyn Fn(&[u8]) -> crate::Result<Arc<dyn Profile>> + Send + Sync>;

/// Process-wide engine context, constructed once and passed explicitly.
/// Holds the local endpoint identity, the engine configuration, and the
/// optional profile parser.
#[derive(Clone)]
pub struct Runtime {
    machine: Arc<Machine>,
    config: EngineConfig,
    parser: Option<ProfileParser>,
}

impl Runtime {
    /// Build a runtime with a freshly derived local identity.
    pub fn new(config: EngineConfig) -> Self {
        let id = DeviceId::generate(&mut rand::thread_rng());
        Runtime {
            machine: Arc::new(Machine::local(id)),
            config,
            parser: None,
        }
    }

    /// Build a runtime around an existing identity, used by a migrated
    /// process to keep speaking as its parent.
    pub fn with_identity(config: EngineConfig, id: DeviceId) -> Self {
        Runtime {
            machine: Arc::new(Machine::local(id)),
            config,
            parser: None,
        }
    }

    pub fn set_profile_parser(&mut self, parser: ProfileParser) {
        self.parser = Some(parser);
    }

    pub fn device(&self) -> DeviceId {
        self.machine.id
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn parse_profile(&self, b: &[u8]) -> crate::Result<Arc<dyn Profile>> {
        match &self.parser {
            Some(p) => p(b),
            None => Err(crate::UmbraError::NoProfileParser),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_runtime_has_identity() {
        let r = Runtime::default();
        assert!(!r.device().is_empty());
        assert_eq!(r.machine().pid, std::process::id());
    }

    #[test]
    fn parser_is_required_for_profile_bytes() {
        let r = Runtime::default();
        assert!(matches!(
            r.parse_profile(&[1, 2, 3]),
            Err(crate::UmbraError::NoProfileParser)
        ));
    }
}
