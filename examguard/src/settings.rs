// Policy resolution: batch value > global setting > hardcoded default.
use serde::Serialize;
use std::sync::Arc;

use crate::model::{BatchSettings, GlobalSettings};
use crate::store::PolicyStore;

pub const DEFAULT_MAX_INCIDENTS: i32 = 5;
pub const DEFAULT_ENABLE_AUTO_SUSPEND: bool = false;
pub const DEFAULT_ADDITIONAL_INCIDENTS_AFTER_REMOVAL: i32 = 3;
pub const DEFAULT_ADDITIONAL_ATTEMPTS_AFTER_PAYMENT: i32 = 2;
pub const DEFAULT_MAX_ATTEMPTS: i32 = 1;

pub const SETTING_MAX_INCIDENTS: &str = "security.maxIncidents";
pub const SETTING_ENABLE_AUTO_SUSPEND: &str = "security.enableAutoSuspend";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectivePolicy {
    pub enable_auto_suspend: bool,
    pub max_incidents: i32,
}

impl Default for EffectivePolicy {
    fn default() -> Self {
        EffectivePolicy {
            enable_auto_suspend: DEFAULT_ENABLE_AUTO_SUSPEND,
            max_incidents: DEFAULT_MAX_INCIDENTS,
        }
    }
}

/// Merge a batch override onto the global snapshot.
pub fn resolve(batch: Option<&BatchSettings>, global: &GlobalSettings) -> EffectivePolicy {
    let max_incidents = batch
        .and_then(|b| b.max_security_incidents)
        .or(global.max_incidents)
        .unwrap_or(DEFAULT_MAX_INCIDENTS);
    let enable_auto_suspend = batch
        .and_then(|b| b.enable_auto_suspend)
        .or(global.enable_auto_suspend)
        .unwrap_or(DEFAULT_ENABLE_AUTO_SUSPEND);

    EffectivePolicy { enable_auto_suspend, max_incidents }
}

pub fn additional_incidents_after_removal(batch: Option<&BatchSettings>) -> i32 {
    batch
        .and_then(|b| b.additional_security_incidents_after_removal)
        .unwrap_or(DEFAULT_ADDITIONAL_INCIDENTS_AFTER_REMOVAL)
}

pub fn additional_attempts_after_payment(batch: Option<&BatchSettings>) -> i32 {
    batch
        .and_then(|b| b.additional_attempts_after_payment)
        .unwrap_or(DEFAULT_ADDITIONAL_ATTEMPTS_AFTER_PAYMENT)
}

pub fn max_attempts(batch: Option<&BatchSettings>) -> i32 {
    batch.and_then(|b| b.max_attempts).unwrap_or(DEFAULT_MAX_ATTEMPTS)
}

/// Looks up a student's batch and the global settings through the injected
/// store. Lookup failures never block incident handling: they degrade to the
/// hardcoded defaults with a warning.
pub struct SettingsResolver<S> {
    store: Arc<S>,
}

impl<S> Clone for SettingsResolver<S> {
    fn clone(&self) -> Self {
        SettingsResolver { store: self.store.clone() }
    }
}

impl<S: PolicyStore> SettingsResolver<S> {
    pub fn new(store: Arc<S>) -> Self {
        SettingsResolver { store }
    }

    pub fn batch_for(&self, student_id: &str) -> Option<BatchSettings> {
        match self.store.batch_for_student(student_id) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!("Batch lookup failed for student {}, using defaults: {}", student_id, e);
                None
            }
        }
    }

    pub fn lookup(&self, student_id: &str) -> ResolvedSettings {
        let batch = self.batch_for(student_id);
        let global = match self.store.global_settings() {
            Ok(global) => global,
            Err(e) => {
                tracing::warn!("Global settings unavailable, using defaults: {}", e);
                GlobalSettings::default()
            }
        };
        ResolvedSettings { policy: resolve(batch.as_ref(), &global), batch }
    }

    pub fn policy_for(&self, student_id: &str) -> EffectivePolicy {
        self.lookup(student_id).policy
    }
}

/// Effective policy plus the batch it came from, for the batch-only knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSettings {
    pub policy: EffectivePolicy,
    pub batch: Option<BatchSettings>,
}

impl ResolvedSettings {
    pub fn additional_incidents_after_removal(&self) -> i32 {
        additional_incidents_after_removal(self.batch.as_ref())
    }

    pub fn additional_attempts_after_payment(&self) -> i32 {
        additional_attempts_after_payment(self.batch.as_ref())
    }

    pub fn max_attempts(&self) -> i32 {
        max_attempts(self.batch.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    fn batch(max: Option<i32>, enable: Option<bool>) -> BatchSettings {
        BatchSettings {
            batch_id: "b1".into(),
            max_security_incidents: max,
            enable_auto_suspend: enable,
            ..Default::default()
        }
    }

    #[test]
    fn batch_overrides_global() {
        let global = GlobalSettings { max_incidents: Some(7), enable_auto_suspend: Some(false) };
        let policy = resolve(Some(&batch(Some(2), Some(true))), &global);
        assert_eq!(policy, EffectivePolicy { enable_auto_suspend: true, max_incidents: 2 });
    }

    #[test]
    fn global_fills_unset_batch_fields() {
        let global = GlobalSettings { max_incidents: Some(7), enable_auto_suspend: Some(true) };
        let policy = resolve(Some(&batch(None, None)), &global);
        assert_eq!(policy, EffectivePolicy { enable_auto_suspend: true, max_incidents: 7 });
    }

    #[test]
    fn hardcoded_defaults_when_nothing_set() {
        let policy = resolve(None, &GlobalSettings::default());
        assert_eq!(policy, EffectivePolicy { enable_auto_suspend: false, max_incidents: 5 });
        assert_eq!(additional_incidents_after_removal(None), 3);
        assert_eq!(additional_attempts_after_payment(None), 2);
        assert_eq!(max_attempts(None), 1);
    }

    struct BrokenStore;

    impl PolicyStore for BrokenStore {
        fn global_settings(&self) -> Result<GlobalSettings, StoreError> {
            Err(StoreError::Unavailable("settings offline".into()))
        }

        fn batch_for_student(&self, _student_id: &str) -> Result<Option<BatchSettings>, StoreError> {
            Err(StoreError::Unavailable("batches offline".into()))
        }
    }

    #[test]
    fn lookup_failure_falls_back_to_defaults() {
        let resolver = SettingsResolver::new(Arc::new(BrokenStore));
        assert_eq!(resolver.policy_for("s1"), EffectivePolicy::default());
        assert!(resolver.batch_for("s1").is_none());
    }
}
