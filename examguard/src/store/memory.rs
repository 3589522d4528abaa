use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::model::{
    BatchSettings, ExamResult, ExamSuspension, GlobalSettings, IncidentType, ListFilter,
    NewIncident, Page, Paged, Payment, PaymentStatus, PaymentType, SecurityIncident,
};
use crate::store::{
    new_id, now, IncidentStore, PaymentStore, PolicyStore, Reinstatement, ResultStore,
    SuspensionStore,
};

#[derive(Default)]
struct MemoryState {
    global: GlobalSettings,
    batches: HashMap<String, BatchSettings>,
    incidents: Vec<SecurityIncident>,
    suspensions: Vec<ExamSuspension>,
    payments: Vec<Payment>,
    results: Vec<ExamResult>,
}

/// In-process store. One mutex covers every collection, so each trait call
/// is atomic. Enforces the same active-suspension uniqueness as the SQL
/// partial index.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

fn paginate<T: Clone>(items: Vec<&T>, page: Page) -> Paged<T> {
    let total = items.len() as u64;
    let items = items
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.per_page as usize)
        .cloned()
        .collect();
    Paged { items, total, page: page.page, per_page: page.per_page }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".to_string()))
    }

    pub fn set_global(&self, global: GlobalSettings) -> Result<(), StoreError> {
        self.state()?.global = global;
        Ok(())
    }

    pub fn assign_batch(&self, student_id: &str, batch: BatchSettings) -> Result<(), StoreError> {
        self.state()?.batches.insert(student_id.to_string(), batch);
        Ok(())
    }

    pub fn incidents_for(
        &self,
        student_id: &str,
        exam_id: &str,
    ) -> Result<Vec<SecurityIncident>, StoreError> {
        Ok(self
            .state()?
            .incidents
            .iter()
            .filter(|i| i.student_id == student_id && i.exam_id == exam_id)
            .cloned()
            .collect())
    }

    pub fn suspensions_for(
        &self,
        student_id: &str,
        exam_id: &str,
    ) -> Result<Vec<ExamSuspension>, StoreError> {
        Ok(self
            .state()?
            .suspensions
            .iter()
            .filter(|s| s.student_id == student_id && s.exam_id == exam_id)
            .cloned()
            .collect())
    }

    pub fn payment(&self, payment_id: &str) -> Result<Option<Payment>, StoreError> {
        Ok(self.state()?.payments.iter().find(|p| p.id == payment_id).cloned())
    }
}

impl PolicyStore for MemoryStore {
    fn global_settings(&self) -> Result<GlobalSettings, StoreError> {
        Ok(self.state()?.global.clone())
    }

    fn batch_for_student(&self, student_id: &str) -> Result<Option<BatchSettings>, StoreError> {
        Ok(self.state()?.batches.get(student_id).cloned())
    }
}

impl IncidentStore for MemoryStore {
    fn record(&self, incident: NewIncident) -> Result<SecurityIncident, StoreError> {
        let incident = incident.into_incident(new_id(), now());
        self.state()?.incidents.push(incident.clone());
        Ok(incident)
    }

    fn count_incidents(
        &self,
        student_id: &str,
        exam_id: &str,
        exclude_handled: bool,
    ) -> Result<i64, StoreError> {
        let count = self
            .state()?
            .incidents
            .iter()
            .filter(|i| i.student_id == student_id && i.exam_id == exam_id)
            .filter(|i| i.incident_type.counts_toward_threshold())
            .filter(|i| !(exclude_handled && i.handled_by_payment))
            .count();
        Ok(count as i64)
    }

    fn incident_ids(&self, student_id: &str, exam_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .state()?
            .incidents
            .iter()
            .filter(|i| i.student_id == student_id && i.exam_id == exam_id)
            .filter(|i| i.incident_type.counts_toward_threshold())
            .map(|i| i.id.clone())
            .collect())
    }

    fn list_incidents(
        &self,
        filter: &ListFilter,
        page: Page,
    ) -> Result<Paged<SecurityIncident>, StoreError> {
        let state = self.state()?;
        let mut matching: Vec<&SecurityIncident> = state
            .incidents
            .iter()
            .filter(|i| filter.matches(&i.student_id, &i.exam_id))
            .collect();
        matching.reverse();
        Ok(paginate(matching, page))
    }
}

impl SuspensionStore for MemoryStore {
    fn find_active(
        &self,
        student_id: &str,
        exam_id: &str,
    ) -> Result<Option<ExamSuspension>, StoreError> {
        Ok(self
            .state()?
            .suspensions
            .iter()
            .find(|s| s.student_id == student_id && s.exam_id == exam_id && !s.removed)
            .cloned())
    }

    fn count_suspensions(&self, student_id: &str, exam_id: &str) -> Result<i64, StoreError> {
        let count = self
            .state()?
            .suspensions
            .iter()
            .filter(|s| s.student_id == student_id && s.exam_id == exam_id)
            .count();
        Ok(count as i64)
    }

    fn latest_removed(
        &self,
        student_id: &str,
        exam_id: &str,
    ) -> Result<Option<ExamSuspension>, StoreError> {
        Ok(self
            .state()?
            .suspensions
            .iter()
            .filter(|s| s.student_id == student_id && s.exam_id == exam_id && s.removed)
            .max_by_key(|s| s.removed_at)
            .cloned())
    }

    fn create_suspension(
        &self,
        suspension: &ExamSuspension,
        trigger_incident_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if state.suspensions.iter().any(|s| {
            s.student_id == suspension.student_id && s.exam_id == suspension.exam_id && !s.removed
        }) {
            return Err(StoreError::Duplicate);
        }
        if let Some(trigger) = trigger_incident_id
            && let Some(incident) = state.incidents.iter_mut().find(|i| i.id == trigger)
        {
            incident.caused_suspension = true;
        }
        state.suspensions.push(suspension.clone());
        Ok(())
    }

    fn reinstate(
        &self,
        student_id: &str,
        exam_id: &str,
        payment_ref: &str,
        note: NewIncident,
        now: i64,
    ) -> Result<Reinstatement, StoreError> {
        let mut state = self.state()?;
        let mut outcome = Reinstatement::default();

        let payment = state
            .payments
            .iter_mut()
            .find(|p| p.id == payment_ref)
            .ok_or(StoreError::NotFound)?;
        if payment.reinstated_at.is_some() {
            return Ok(outcome);
        }
        payment.reinstated_at = Some(now);

        if let Some(active) = state
            .suspensions
            .iter_mut()
            .find(|s| s.student_id == student_id && s.exam_id == exam_id && !s.removed)
        {
            active.removed = true;
            active.removed_at = Some(now);
            outcome.removed = Some(active.clone());
        }

        for incident in state.incidents.iter_mut().filter(|i| {
            i.student_id == student_id
                && i.exam_id == exam_id
                && !i.handled_by_payment
                && i.incident_type != IncidentType::SystemNote
        }) {
            incident.handled_by_payment = true;
            incident.handled_at = Some(now);
            incident.suspension_removal_payment_ref = Some(payment_ref.to_string());
            outcome.handled += 1;
        }

        if !outcome.is_noop() {
            let note = note.into_incident(new_id(), now);
            state.incidents.push(note.clone());
            outcome.note = Some(note);
        }
        Ok(outcome)
    }

    fn remove_suspension(
        &self,
        suspension_id: &str,
        reviewer: &str,
        notes: Option<&str>,
        now: i64,
    ) -> Result<Option<ExamSuspension>, StoreError> {
        let mut state = self.state()?;
        let Some(suspension) = state
            .suspensions
            .iter_mut()
            .find(|s| s.id == suspension_id && !s.removed)
        else {
            return Ok(None);
        };
        suspension.removed = true;
        suspension.removed_at = Some(now);
        suspension.reviewed_by_admin = true;
        suspension.reviewed_by = Some(reviewer.to_string());
        suspension.reviewed_at = Some(now);
        if let Some(notes) = notes {
            suspension.admin_notes = Some(notes.to_string());
        }
        Ok(Some(suspension.clone()))
    }

    fn review_suspension(
        &self,
        suspension_id: &str,
        reviewer: &str,
        notes: Option<&str>,
        now: i64,
    ) -> Result<Option<ExamSuspension>, StoreError> {
        let mut state = self.state()?;
        let Some(suspension) = state.suspensions.iter_mut().find(|s| s.id == suspension_id) else {
            return Ok(None);
        };
        suspension.reviewed_by_admin = true;
        suspension.reviewed_by = Some(reviewer.to_string());
        suspension.reviewed_at = Some(now);
        if let Some(notes) = notes {
            suspension.admin_notes = Some(notes.to_string());
        }
        Ok(Some(suspension.clone()))
    }

    fn get_suspension(&self, suspension_id: &str) -> Result<Option<ExamSuspension>, StoreError> {
        Ok(self.state()?.suspensions.iter().find(|s| s.id == suspension_id).cloned())
    }

    fn list_suspensions(
        &self,
        filter: &ListFilter,
        page: Page,
    ) -> Result<Paged<ExamSuspension>, StoreError> {
        let state = self.state()?;
        let mut matching: Vec<&ExamSuspension> = state
            .suspensions
            .iter()
            .filter(|s| filter.matches(&s.student_id, &s.exam_id))
            .collect();
        matching.reverse();
        Ok(paginate(matching, page))
    }
}

impl PaymentStore for MemoryStore {
    fn insert_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if state.payments.iter().any(|p| p.gateway_order_id == payment.gateway_order_id) {
            return Err(StoreError::Duplicate);
        }
        state.payments.push(payment.clone());
        Ok(())
    }

    fn payment_by_order(&self, gateway_order_id: &str) -> Result<Option<Payment>, StoreError> {
        Ok(self
            .state()?
            .payments
            .iter()
            .find(|p| p.gateway_order_id == gateway_order_id)
            .cloned())
    }

    fn mark_payment_status(
        &self,
        gateway_order_id: &str,
        status: PaymentStatus,
        gateway_payment_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        let Some(payment) = state.payments.iter_mut().find(|p| {
            p.gateway_order_id == gateway_order_id
                && p.status != PaymentStatus::Success
                && p.status != status
        }) else {
            return Ok(false);
        };
        payment.status = status;
        if let Some(id) = gateway_payment_id {
            payment.gateway_payment_id = Some(id.to_string());
        }
        Ok(true)
    }

    fn grant_additional_attempts(
        &self,
        payment_id: &str,
        attempts: i32,
        now: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        let Some(payment) = state
            .payments
            .iter_mut()
            .find(|p| p.id == payment_id && !p.additional_attempts_granted)
        else {
            return Ok(false);
        };
        payment.additional_attempts = Some(attempts);
        payment.additional_attempts_granted = true;
        payment.additional_attempts_granted_at = Some(now);
        Ok(true)
    }

    fn sum_additional_attempts(&self, student_id: &str, exam_id: &str) -> Result<i64, StoreError> {
        Ok(self
            .state()?
            .payments
            .iter()
            .filter(|p| {
                p.student_id == student_id
                    && p.exam_id == exam_id
                    && p.status == PaymentStatus::Success
                    && p.payment_type == PaymentType::MaxAttempts
            })
            .map(|p| i64::from(p.additional_attempts.unwrap_or(0)))
            .sum())
    }
}

impl ResultStore for MemoryStore {
    fn count_attempts(&self, student_id: &str, exam_id: &str) -> Result<i64, StoreError> {
        let count = self
            .state()?
            .results
            .iter()
            .filter(|r| {
                r.student_id == student_id && r.exam_id == exam_id && !r.from_previous_payment_cycle
            })
            .count();
        Ok(count as i64)
    }

    fn has_passed(&self, student_id: &str, exam_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .state()?
            .results
            .iter()
            .any(|r| r.student_id == student_id && r.exam_id == exam_id && r.passed))
    }

    fn insert_result(&self, result: &ExamResult) -> Result<(), StoreError> {
        self.state()?.results.push(result.clone());
        Ok(())
    }
}
