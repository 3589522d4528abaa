//! Storage contracts for the integrity core.
//!
//! The server implements these over SQLite; [`memory::MemoryStore`] is the
//! in-process reference implementation. Both must reject a second
//! non-removed suspension for the same (student, exam) pair with
//! [`StoreError::Duplicate`]: that constraint, not the in-process lock, is
//! what keeps the one-active-suspension invariant.

pub mod memory;

use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    BatchSettings, ExamResult, ExamSuspension, GlobalSettings, ListFilter, NewIncident, Page,
    Paged, Payment, PaymentStatus, SecurityIncident,
};

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub trait PolicyStore: Send + Sync {
    fn global_settings(&self) -> Result<GlobalSettings, StoreError>;

    fn batch_for_student(&self, student_id: &str) -> Result<Option<BatchSettings>, StoreError>;
}

/// Append-only incident log.
pub trait IncidentStore: Send + Sync {
    fn record(&self, incident: NewIncident) -> Result<SecurityIncident, StoreError>;

    /// Counts incidents that weigh toward the threshold. `system_note`
    /// entries are never counted; with `exclude_handled` incidents already
    /// settled by a payment are skipped too.
    fn count_incidents(
        &self,
        student_id: &str,
        exam_id: &str,
        exclude_handled: bool,
    ) -> Result<i64, StoreError>;

    /// Ids of every threshold-relevant incident for the pair, oldest first.
    fn incident_ids(&self, student_id: &str, exam_id: &str) -> Result<Vec<String>, StoreError>;

    fn list_incidents(
        &self,
        filter: &ListFilter,
        page: Page,
    ) -> Result<Paged<SecurityIncident>, StoreError>;
}

/// What a reinstatement actually changed. All-empty means the call was a
/// replay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reinstatement {
    pub removed: Option<ExamSuspension>,
    pub handled: usize,
    pub note: Option<SecurityIncident>,
}

impl Reinstatement {
    pub fn is_noop(&self) -> bool {
        self.removed.is_none() && self.handled == 0
    }
}

pub trait SuspensionStore: Send + Sync {
    fn find_active(&self, student_id: &str, exam_id: &str)
    -> Result<Option<ExamSuspension>, StoreError>;

    /// Historical count, removed suspensions included.
    fn count_suspensions(&self, student_id: &str, exam_id: &str) -> Result<i64, StoreError>;

    fn latest_removed(
        &self,
        student_id: &str,
        exam_id: &str,
    ) -> Result<Option<ExamSuspension>, StoreError>;

    /// Inserts the suspension and flags the triggering incident in one unit.
    /// Fails with `Duplicate` when an active suspension already exists.
    fn create_suspension(
        &self,
        suspension: &ExamSuspension,
        trigger_incident_id: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Consumes payment `payment_ref`, removes the active suspension, marks
    /// every unhandled incident as handled by it and appends `note`, all in
    /// one unit. A payment is consumed at most once: once `reinstated_at` is
    /// set every later call is a no-op, whatever the pair's state is by then.
    /// The note is only written when something else changed. Errors with
    /// `NotFound` for an unknown payment.
    fn reinstate(
        &self,
        student_id: &str,
        exam_id: &str,
        payment_ref: &str,
        note: NewIncident,
        now: i64,
    ) -> Result<Reinstatement, StoreError>;

    /// Returns `None` when the suspension is missing or already removed.
    fn remove_suspension(
        &self,
        suspension_id: &str,
        reviewer: &str,
        notes: Option<&str>,
        now: i64,
    ) -> Result<Option<ExamSuspension>, StoreError>;

    fn review_suspension(
        &self,
        suspension_id: &str,
        reviewer: &str,
        notes: Option<&str>,
        now: i64,
    ) -> Result<Option<ExamSuspension>, StoreError>;

    fn get_suspension(&self, suspension_id: &str) -> Result<Option<ExamSuspension>, StoreError>;

    fn list_suspensions(
        &self,
        filter: &ListFilter,
        page: Page,
    ) -> Result<Paged<ExamSuspension>, StoreError>;
}

pub trait PaymentStore: Send + Sync {
    /// Fails with `Duplicate` when the gateway order id is already known.
    fn insert_payment(&self, payment: &Payment) -> Result<(), StoreError>;

    fn payment_by_order(&self, gateway_order_id: &str) -> Result<Option<Payment>, StoreError>;

    /// Returns whether the row changed. A `success` payment is never moved to
    /// another status.
    fn mark_payment_status(
        &self,
        gateway_order_id: &str,
        status: PaymentStatus,
        gateway_payment_id: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Sets `additional_attempts` once. Returns false if already granted.
    fn grant_additional_attempts(
        &self,
        payment_id: &str,
        attempts: i32,
        now: i64,
    ) -> Result<bool, StoreError>;

    /// Sum of `additional_attempts` over successful `max_attempts` payments.
    fn sum_additional_attempts(&self, student_id: &str, exam_id: &str) -> Result<i64, StoreError>;
}

pub trait ResultStore: Send + Sync {
    /// Attempts in the current payment cycle.
    fn count_attempts(&self, student_id: &str, exam_id: &str) -> Result<i64, StoreError>;

    fn has_passed(&self, student_id: &str, exam_id: &str) -> Result<bool, StoreError>;

    fn insert_result(&self, result: &ExamResult) -> Result<(), StoreError>;
}

/// Everything the integrity services need from one backend.
pub trait IntegrityStore:
    PolicyStore + IncidentStore + SuspensionStore + PaymentStore + ResultStore
{
}

impl<T> IntegrityStore for T where
    T: PolicyStore + IncidentStore + SuspensionStore + PaymentStore + ResultStore
{
}
