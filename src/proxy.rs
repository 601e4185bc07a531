use std::sync::Arc;

use crate::profile::Profile;

/// One level of proxy indirection attached to a client session. The
/// engine forwards the proxy's routing tags on every outbound packet and
/// carries the proxy's profile through a migration; accepting and
/// re-dialing proxied clients is outside the engine.
pub struct Proxy {
    tags: Vec<u32>,
    profile: Arc<dyn Profile>,
    profile_bytes: Option<Vec<u8>>,
}

impl Proxy {
    pub fn new(tags: Vec<u32>, profile: Arc<dyn Profile>, profile_bytes: Option<Vec<u8>>) -> Self {
        Proxy {
            tags,
            profile,
            profile_bytes,
        }
    }

    pub fn tags(&self) -> Vec<u32> {
        self.tags.clone()
    }

    pub fn profile(&self) -> Arc<dyn Profile> {
        self.profile.clone()
    }

    /// Marshaled profile captured at construction, required to carry this
    /// proxy across a migration.
    pub(crate) fn marshaled(&self) -> crate::Result<Vec<u8>> {
        self.profile_bytes
            .clone()
            .ok_or(crate::UmbraError::CannotMarshalProfile)
    }
}
