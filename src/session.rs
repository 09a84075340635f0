//! Sessions and the session registry
//!
//! A session is the unit of caller state: its default configuration layer,
//! its billing meter, and its transaction counter, all behind one mutex so
//! id allocation and billing commit happen as a single critical section.
//! The registry is the only process-wide mutable table; sessions on
//! different handles never block one another.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::billing::{BillingMeter, BillingRecord, BillingTick};
use crate::config::{ConfigLayer, SessionSettings};
use crate::error::{FacegateError, Result};

/// Opaque session identifier held by the caller. Lookup is checked: a
/// destroyed or fabricated handle fails with `InvalidHandle`, never with
/// undefined access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(Uuid);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Default)]
struct SessionState {
    defaults: ConfigLayer,
    meter: BillingMeter,
    last_transaction: u64,
}

/// One caller-scoped processing context.
pub struct Session {
    handle: SessionHandle,
    settings: SessionSettings,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(handle: SessionHandle, settings: SessionSettings) -> Self {
        let defaults = settings.configuration.clone().unwrap_or_default();
        Session {
            handle,
            settings,
            state: Mutex::new(SessionState {
                defaults,
                ..SessionState::default()
            }),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Snapshot of the session-default layer, so resolution stays pure
    /// while other callers may be updating the defaults.
    pub fn session_defaults(&self) -> ConfigLayer {
        self.state.lock().defaults.clone()
    }

    /// Overlay `layer` onto the session defaults; keys it does not mention
    /// keep their current values.
    pub fn apply_as_session_default(&self, layer: &ConfigLayer) {
        self.state.lock().defaults.merge_from(layer);
        debug!(session = %self.handle, "session defaults updated");
    }

    pub fn set_billing_thresholds(&self, document: &str) -> Result<()> {
        self.state.lock().meter.set_thresholds(document)
    }

    pub fn billing_record(&self, kind: &str) -> Option<BillingRecord> {
        self.state.lock().meter.record(kind).cloned()
    }

    pub fn lifetime_total(&self, kind: &str) -> u64 {
        self.state.lock().meter.lifetime_total(kind)
    }

    /// Transactions committed so far; the next successful call gets this
    /// plus one.
    pub fn transaction_count(&self) -> u64 {
        self.state.lock().last_transaction
    }

    /// Allocate the next transaction id and count the call against the
    /// billing meter in one critical section. Called only after the
    /// collaborator has produced an outcome (commit-after policy): a call
    /// that times out or is rejected earlier consumes nothing here.
    ///
    /// The hard cap is re-checked under the same lock: concurrent calls
    /// that all passed the pre-delegation check still commit one at a
    /// time, and only the ones inside the cap get a transaction id.
    pub fn commit(
        &self,
        billing_kind: &'static str,
        cap: Option<u64>,
    ) -> Result<(u64, BillingTick)> {
        let mut state = self.state.lock();
        if let Some(cap) = cap {
            if state.meter.lifetime_total(billing_kind) >= cap {
                return Err(FacegateError::BillingCapExceeded {
                    kind: billing_kind,
                    cap,
                });
            }
        }
        state.last_transaction += 1;
        let tick = state.meter.record_and_check(billing_kind);
        Ok((state.last_transaction, tick))
    }
}

/// Process-wide handle table. Creation, lookup, and destruction are safe to
/// call from independent threads.
#[derive(Default)]
pub struct SessionRegistry {
    table: RwLock<HashMap<SessionHandle, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the settings document and insert a new session. Nothing is
    /// inserted when the document is rejected.
    pub fn create(&self, settings_document: &str) -> Result<SessionHandle> {
        let settings = SessionSettings::parse(settings_document)?;
        let handle = SessionHandle(Uuid::new_v4());
        let session = Arc::new(Session::new(handle, settings));
        self.table.write().insert(handle, session);
        info!(session = %handle, "session created");
        Ok(handle)
    }

    pub fn lookup(&self, handle: SessionHandle) -> Result<Arc<Session>> {
        self.table
            .read()
            .get(&handle)
            .cloned()
            .ok_or(FacegateError::InvalidHandle)
    }

    /// Remove and drop the session. Destroying an already-destroyed handle
    /// is a checked usage error.
    pub fn destroy(&self, handle: SessionHandle) -> Result<()> {
        match self.table.write().remove(&handle) {
            Some(_) => {
                info!(session = %handle, "session destroyed");
                Ok(())
            }
            None => Err(FacegateError::InvalidHandle),
        }
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = r#"{"api_key": "k", "base_url": "https://api.example.com"}"#;

    #[test]
    fn create_lookup_destroy() {
        let registry = SessionRegistry::new();
        let handle = registry.create(SETTINGS).unwrap();
        assert_eq!(registry.len(), 1);

        let session = registry.lookup(handle).unwrap();
        assert_eq!(session.handle(), handle);
        assert_eq!(session.settings().api_key, "k");

        registry.destroy(handle).unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.lookup(handle),
            Err(FacegateError::InvalidHandle)
        ));
    }

    #[test]
    fn double_destroy_is_a_checked_error() {
        let registry = SessionRegistry::new();
        let handle = registry.create(SETTINGS).unwrap();
        registry.destroy(handle).unwrap();
        assert!(matches!(
            registry.destroy(handle),
            Err(FacegateError::InvalidHandle)
        ));
    }

    #[test]
    fn empty_settings_leave_the_registry_unchanged() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.create(""),
            Err(FacegateError::InvalidSettings(_))
        ));
        assert!(matches!(
            registry.create("{}"),
            Err(FacegateError::InvalidSettings(_))
        ));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn commit_allocates_increasing_ids_from_one() {
        let registry = SessionRegistry::new();
        let session = registry.lookup(registry.create(SETTINGS).unwrap()).unwrap();

        let (first, _) = session.commit("validate", None).unwrap();
        let (second, _) = session.commit("validate", None).unwrap();
        let (third, _) = session.commit("enroll", None).unwrap();
        assert_eq!((first, second, third), (1, 2, 3));
        assert_eq!(session.transaction_count(), 3);
        assert_eq!(session.lifetime_total("validate"), 2);
    }

    #[test]
    fn commit_enforces_the_cap_under_the_lock() {
        let registry = SessionRegistry::new();
        let session = registry.lookup(registry.create(SETTINGS).unwrap()).unwrap();

        session.commit("validate", Some(2)).unwrap();
        session.commit("validate", Some(2)).unwrap();
        assert!(matches!(
            session.commit("validate", Some(2)),
            Err(FacegateError::BillingCapExceeded { kind: "validate", cap: 2 })
        ));
        // The rejected commit consumed neither an id nor a count.
        assert_eq!(session.transaction_count(), 2);
        assert_eq!(session.lifetime_total("validate"), 2);
        // Other kinds are unaffected by the capped one.
        session.commit("enroll", None).unwrap();
        assert_eq!(session.transaction_count(), 3);
    }

    #[test]
    fn initial_defaults_come_from_the_settings_document() {
        let registry = SessionRegistry::new();
        let handle = registry
            .create(
                r#"{"api_key": "k", "base_url": "https://x",
                    "configuration": {"min_face_size": 64}}"#,
            )
            .unwrap();
        let session = registry.lookup(handle).unwrap();
        assert_eq!(session.session_defaults().min_face_size, Some(64));
    }
}
