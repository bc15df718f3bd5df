//! Hidden-service identity, targets, and publication status

use crate::crypto::OnionKey;
use tracing::{debug, info, warn};

/// Publication state of one onion service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HsStatus {
    /// Not yet registered with Tor.
    NotCreated,
    /// Registered, descriptor not yet uploaded to the HSDirs.
    Offline,
    /// At least one descriptor upload confirmed.
    Online,
}

/// One port mapping of a hidden service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Port exposed on the onion address.
    pub service_port: u16,
    /// Local address connections are forwarded to.
    pub target_address: String,
    pub target_port: u16,
}

/// One onion identity with its port mappings.
///
/// The service id is always derived from the key, never cached, so any
/// disagreement with what Tor reports is detectable at the call site.
#[derive(Debug)]
pub struct HiddenService {
    key: Option<OnionKey>,
    targets: Vec<Target>,
    status: HsStatus,
}

impl HiddenService {
    /// A service whose key Tor will mint on first publish.
    pub fn new() -> Self {
        Self {
            key: None,
            targets: Vec::new(),
            status: HsStatus::NotCreated,
        }
    }

    /// A service restored from a persisted key.
    pub fn with_key(key: OnionKey) -> Self {
        Self {
            key: Some(key),
            targets: Vec::new(),
            status: HsStatus::NotCreated,
        }
    }

    pub fn add_target(&mut self, service_port: u16, target_address: impl Into<String>, target_port: u16) {
        self.targets.push(Target {
            service_port,
            target_address: target_address.into(),
            target_port,
        });
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn key(&self) -> Option<&OnionKey> {
        self.key.as_ref()
    }

    pub fn status(&self) -> HsStatus {
        self.status
    }

    /// Derived service id, available once a key exists.
    pub fn service_id(&self) -> Option<String> {
        self.key.as_ref().map(|k| k.service_id())
    }

    pub fn hostname(&self) -> Option<String> {
        self.key.as_ref().map(|k| k.onion_address())
    }

    /// Install the key Tor returned for a NEW service.
    pub(crate) fn adopt_key(&mut self, key: OnionKey) {
        debug_assert!(self.key.is_none(), "adopting a key over an existing one");
        self.key = Some(key);
    }

    /// Force a status, returning `(old, new)` when it actually changed.
    pub(crate) fn set_status(&mut self, new: HsStatus) -> Option<(HsStatus, HsStatus)> {
        if self.status == new {
            return None;
        }
        let old = std::mem::replace(&mut self.status, new);
        info!(
            "hidden service {} status {:?} -> {:?}",
            self.service_id().as_deref().unwrap_or("<no key>"),
            old,
            new
        );
        Some((old, new))
    }

    /// Apply an HS_DESC event, returning a status change if one occurred.
    ///
    /// Only UPLOADED flips the service Online; FAILED leaves it Offline and
    /// is retried by Tor itself or on the next controller reconnect.
    pub(crate) fn handle_descriptor_event(
        &mut self,
        action: &str,
        address: &str,
    ) -> Option<(HsStatus, HsStatus)> {
        let id = self.service_id()?;
        if id != address {
            return None;
        }
        match action {
            "UPLOADED" => self.set_status(HsStatus::Online),
            "FAILED" => {
                warn!("descriptor upload failed for {}", id);
                None
            },
            other => {
                debug!("descriptor event {} for {}", other, id);
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with_key() -> HiddenService {
        let mut hs = HiddenService::with_key(OnionKey::generate());
        hs.add_target(9878, "127.0.0.1", 7934);
        hs
    }

    #[test]
    fn uploaded_event_brings_service_online() {
        let mut hs = service_with_key();
        hs.set_status(HsStatus::Offline);
        let id = hs.service_id().unwrap();

        assert_eq!(
            hs.handle_descriptor_event("UPLOADED", &id),
            Some((HsStatus::Offline, HsStatus::Online))
        );
        // Further uploads to more HSDirs are not a change.
        assert_eq!(hs.handle_descriptor_event("UPLOADED", &id), None);
        assert_eq!(hs.status(), HsStatus::Online);
    }

    #[test]
    fn events_for_other_services_are_ignored() {
        let mut hs = service_with_key();
        hs.set_status(HsStatus::Offline);
        let other = OnionKey::generate().service_id();

        assert_eq!(hs.handle_descriptor_event("UPLOADED", &other), None);
        assert_eq!(hs.status(), HsStatus::Offline);
    }

    #[test]
    fn failed_upload_stays_offline() {
        let mut hs = service_with_key();
        hs.set_status(HsStatus::Offline);
        let id = hs.service_id().unwrap();

        assert_eq!(hs.handle_descriptor_event("FAILED", &id), None);
        assert_eq!(hs.status(), HsStatus::Offline);
    }

    #[test]
    fn keyless_service_has_no_identity() {
        let hs = HiddenService::new();
        assert!(hs.service_id().is_none());
        assert!(hs.hostname().is_none());
        assert_eq!(hs.status(), HsStatus::NotCreated);
    }

    #[test]
    fn hostname_is_derived_from_key() {
        let key = OnionKey::generate();
        let expected = key.onion_address();
        let hs = HiddenService::with_key(key);
        assert_eq!(hs.hostname().unwrap(), expected);
        assert!(expected.ends_with(".onion"));
        assert_eq!(expected.len(), 56 + ".onion".len());
    }
}
