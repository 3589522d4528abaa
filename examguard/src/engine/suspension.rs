use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{IntegrityError, StoreError};
use crate::lock::{LockKey, LockManager, DEFAULT_LOCK_TIMEOUT};
use crate::model::{Actor, ExamSuspension, IncidentType, NewIncident, SecurityIncident};
use crate::settings::{EffectivePolicy, ResolvedSettings, SettingsResolver};
use crate::store::{new_id, now, IncidentStore, PolicyStore, SuspensionStore};

/// A proctoring violation as reported by the exam client.
#[derive(Debug, Clone)]
pub struct IncidentReport {
    pub incident_type: IncidentType,
    pub details: serde_json::Value,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySettingsView {
    pub enable_auto_suspend: bool,
    pub max_incidents: i32,
    pub effective_max_incidents: i32,
}

/// Response to an incident report or a status poll.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentOutcome {
    pub suspended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspension: Option<ExamSuspension>,
    pub security_settings: SecuritySettingsView,
    pub incident_count: i64,
    pub suspension_count: i64,
    /// Auto-suspend is off for this student: incidents are only recorded.
    pub warning_only: bool,
    /// The suspension lock timed out and the result came from the
    /// best-effort path.
    pub lock_degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident: Option<SecurityIncident>,
}

pub fn suspension_reason(incident_count: i64, effective_max: i32, ordinal: i64) -> String {
    let mut reason = format!(
        "Automatically suspended after {} security incidents (limit: {})",
        incident_count, effective_max
    );
    if ordinal > 1 {
        reason.push_str(&format!(" - suspension #{}", ordinal));
    }
    reason
}

/// Decides when an attempt gets suspended and creates at most one active
/// suspension per (student, exam).
pub struct SuspensionEngine<S> {
    store: Arc<S>,
    settings: SettingsResolver<S>,
    locks: Arc<LockManager>,
    lock_timeout: Duration,
}

impl<S> Clone for SuspensionEngine<S> {
    fn clone(&self) -> Self {
        SuspensionEngine {
            store: self.store.clone(),
            settings: self.settings.clone(),
            locks: self.locks.clone(),
            lock_timeout: self.lock_timeout,
        }
    }
}

impl<S> SuspensionEngine<S>
where
    S: IncidentStore + SuspensionStore + PolicyStore,
{
    pub fn new(store: Arc<S>, locks: Arc<LockManager>) -> Self {
        SuspensionEngine {
            settings: SettingsResolver::new(store.clone()),
            store,
            locks,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Record the incident, then decide whether it suspends the attempt.
    /// Recording never depends on policy; storage errors while recording are
    /// returned so the client can retry.
    pub fn report_incident(
        &self,
        actor: &Actor,
        exam_id: &str,
        report: IncidentReport,
    ) -> Result<IncidentOutcome, IntegrityError> {
        if !report.incident_type.is_reportable() {
            return Err(IntegrityError::InvalidIncidentType(report.incident_type.to_string()));
        }
        let student_id = actor.student_id.as_str();
        let resolved = self.settings.lookup(student_id);

        let incident = self.store.record(NewIncident {
            student_id: student_id.to_string(),
            exam_id: exam_id.to_string(),
            incident_type: report.incident_type,
            details: report.details,
            user_agent: report.user_agent,
            ip_address: report.ip_address,
        })?;
        tracing::info!(
            "Security incident {} recorded for student {} on exam {}",
            incident.incident_type, student_id, exam_id
        );

        self.evaluate(student_id, exam_id, &resolved, Some(incident))
    }

    /// Read-only view of the pair's state; never creates anything.
    pub fn status(&self, student_id: &str, exam_id: &str) -> Result<IncidentOutcome, IntegrityError> {
        let resolved = self.settings.lookup(student_id);
        let view = self.settings_view(student_id, exam_id, &resolved)?;
        let incident_count = self.store.count_incidents(student_id, exam_id, true)?;
        let suspension = self.store.find_active(student_id, exam_id)?;

        Ok(IncidentOutcome {
            suspended: suspension.is_some(),
            suspension,
            security_settings: view,
            incident_count,
            suspension_count: self.store.count_suspensions(student_id, exam_id)?,
            warning_only: !resolved.policy.enable_auto_suspend,
            lock_degraded: false,
            incident: None,
        })
    }

    /// Threshold after the post-removal allowance. The allowance is added
    /// once if any removed suspension exists; it does not stack.
    fn settings_view(
        &self,
        student_id: &str,
        exam_id: &str,
        resolved: &ResolvedSettings,
    ) -> Result<SecuritySettingsView, IntegrityError> {
        let EffectivePolicy { enable_auto_suspend, max_incidents } = resolved.policy;
        let mut effective_max_incidents = max_incidents;
        if self.store.latest_removed(student_id, exam_id)?.is_some() {
            effective_max_incidents += resolved.additional_incidents_after_removal();
        }
        Ok(SecuritySettingsView { enable_auto_suspend, max_incidents, effective_max_incidents })
    }

    fn evaluate(
        &self,
        student_id: &str,
        exam_id: &str,
        resolved: &ResolvedSettings,
        mut incident: Option<SecurityIncident>,
    ) -> Result<IncidentOutcome, IntegrityError> {
        let view = self.settings_view(student_id, exam_id, resolved)?;
        let incident_count = self.store.count_incidents(student_id, exam_id, true)?;
        let warning_only = !view.enable_auto_suspend;
        let mut lock_degraded = false;

        let suspension = match self.store.find_active(student_id, exam_id)? {
            Some(active) => Some(active),
            None if warning_only => None,
            None if incident_count >= i64::from(view.effective_max_incidents) => {
                let trigger = incident.as_ref().map(|i| i.id.as_str());
                let (suspension, created, degraded) = self.suspend(
                    student_id,
                    exam_id,
                    incident_count,
                    view.effective_max_incidents,
                    trigger,
                )?;
                lock_degraded = degraded;
                if created && let Some(incident) = incident.as_mut() {
                    incident.caused_suspension = true;
                }
                Some(suspension)
            }
            None => None,
        };

        if warning_only && suspension.is_none() {
            tracing::debug!(
                "Auto-suspend disabled for student {} on exam {} ({} incidents)",
                student_id, exam_id, incident_count
            );
        }

        Ok(IncidentOutcome {
            suspended: suspension.is_some(),
            suspension,
            security_settings: view,
            incident_count,
            suspension_count: self.store.count_suspensions(student_id, exam_id)?,
            warning_only,
            lock_degraded,
            incident,
        })
    }

    /// Returns (suspension, created_by_this_call, lock_degraded).
    fn suspend(
        &self,
        student_id: &str,
        exam_id: &str,
        incident_count: i64,
        effective_max: i32,
        trigger: Option<&str>,
    ) -> Result<(ExamSuspension, bool, bool), IntegrityError> {
        let key = LockKey::pair(student_id, exam_id);
        match self.locks.acquire(&key, self.lock_timeout) {
            Ok(guard) => {
                let (suspension, created) =
                    self.create_or_reuse(student_id, exam_id, incident_count, effective_max, trigger)?;
                guard.release();
                Ok((suspension, created, false))
            }
            Err(timeout) => {
                tracing::warn!("{}; falling back to unlocked duplicate check", timeout);
                if let Some(active) = self.store.find_active(student_id, exam_id)? {
                    return Ok((active, false, true));
                }
                let (suspension, created) =
                    self.create_or_reuse(student_id, exam_id, incident_count, effective_max, trigger)?;
                Ok((suspension, created, true))
            }
        }
    }

    fn create_or_reuse(
        &self,
        student_id: &str,
        exam_id: &str,
        incident_count: i64,
        effective_max: i32,
        trigger: Option<&str>,
    ) -> Result<(ExamSuspension, bool), IntegrityError> {
        if let Some(active) = self.store.find_active(student_id, exam_id)? {
            tracing::info!("Reusing suspension {} for student {} on exam {}", active.id, student_id, exam_id);
            return Ok((active, false));
        }

        let ordinal = self.store.count_suspensions(student_id, exam_id)? + 1;
        let suspension = ExamSuspension {
            id: new_id(),
            student_id: student_id.to_string(),
            exam_id: exam_id.to_string(),
            incidents: self.store.incident_ids(student_id, exam_id)?,
            reason: suspension_reason(incident_count, effective_max, ordinal),
            suspension_time: now(),
            reviewed_by_admin: false,
            admin_notes: None,
            reviewed_at: None,
            reviewed_by: None,
            removed: false,
            removed_at: None,
        };

        match self.store.create_suspension(&suspension, trigger) {
            Ok(()) => {
                tracing::warn!(
                    "Student {} suspended on exam {} ({} incidents, limit {}, suspension #{})",
                    student_id, exam_id, incident_count, effective_max, ordinal
                );
                Ok((suspension, true))
            }
            Err(StoreError::Duplicate) => {
                tracing::warn!(
                    "Concurrent suspension detected for student {} on exam {}; returning existing",
                    student_id, exam_id
                );
                self.store
                    .find_active(student_id, exam_id)?
                    .map(|existing| (existing, false))
                    .ok_or(IntegrityError::Store(StoreError::Duplicate))
            }
            Err(e) => Err(e.into()),
        }
    }
}
