use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::quota::{AttemptQuota, QuotaCalculator};
use crate::error::{IntegrityError, StoreError};
use crate::lock::{LockKey, LockManager, DEFAULT_LOCK_TIMEOUT};
use crate::model::{Actor, ExamResult};
use crate::store::{new_id, now, PaymentStore, PolicyStore, ResultStore, SuspensionStore};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamSubmission {
    pub score: f64,
    pub passed: bool,
}

/// Admission checks for starting and submitting an attempt.
pub struct ExamGate<S> {
    store: Arc<S>,
    quota: QuotaCalculator<S>,
    locks: Arc<LockManager>,
    lock_timeout: Duration,
}

impl<S> Clone for ExamGate<S> {
    fn clone(&self) -> Self {
        ExamGate {
            store: self.store.clone(),
            quota: self.quota.clone(),
            locks: self.locks.clone(),
            lock_timeout: self.lock_timeout,
        }
    }
}

impl<S> ExamGate<S>
where
    S: SuspensionStore + PaymentStore + ResultStore + PolicyStore,
{
    pub fn new(store: Arc<S>, locks: Arc<LockManager>) -> Self {
        ExamGate {
            quota: QuotaCalculator::new(store.clone()),
            store,
            locks,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn admit(&self, student_id: &str, exam_id: &str) -> Result<AttemptQuota, IntegrityError> {
        if let Some(active) = self.store.find_active(student_id, exam_id)? {
            tracing::info!("Student {} blocked on exam {} by suspension {}", student_id, exam_id, active.id);
            return Err(IntegrityError::Suspended);
        }
        self.quota.ensure_can_attempt(student_id, exam_id)
    }

    pub fn authorize_start(&self, actor: &Actor, exam_id: &str) -> Result<AttemptQuota, IntegrityError> {
        self.admit(&actor.student_id, exam_id)
    }

    /// Re-checks admission, since the client's view of its attempt number is
    /// never trusted, then records the result. Check and insert run under the
    /// pair's submission lock so concurrent submits cannot overrun the quota.
    pub fn submit(
        &self,
        actor: &Actor,
        exam_id: &str,
        submission: &ExamSubmission,
    ) -> Result<ExamResult, IntegrityError> {
        let key = LockKey::submission(&actor.student_id, exam_id);
        let _guard = self.locks.acquire(&key, self.lock_timeout).map_err(|timeout| {
            tracing::warn!("{}; rejecting submission", timeout);
            IntegrityError::Store(StoreError::Unavailable("submission already in progress".to_string()))
        })?;

        self.admit(&actor.student_id, exam_id)?;
        let result = ExamResult {
            id: new_id(),
            student_id: actor.student_id.clone(),
            exam_id: exam_id.to_string(),
            score: submission.score,
            passed: submission.passed,
            from_previous_payment_cycle: false,
            submitted_at: now(),
        };
        self.store.insert_result(&result)?;
        tracing::info!(
            "Result {} recorded for student {} on exam {} (passed: {})",
            result.id, actor.student_id, exam_id, result.passed
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BatchSettings, ExamSuspension};
    use crate::store::memory::MemoryStore;
    use std::sync::Barrier;
    use std::thread;

    fn gate(store: &Arc<MemoryStore>) -> ExamGate<MemoryStore> {
        ExamGate::new(store.clone(), Arc::new(LockManager::new(Duration::from_millis(1))))
    }

    fn submission(passed: bool) -> ExamSubmission {
        ExamSubmission { score: if passed { 80.0 } else { 20.0 }, passed }
    }

    #[test]
    fn submit_consumes_quota() {
        let store = Arc::new(MemoryStore::new());
        store
            .assign_batch("s", BatchSettings { batch_id: "b".into(), max_attempts: Some(2), ..Default::default() })
            .unwrap();
        let gate = gate(&store);
        let actor = Actor::student("s");

        assert_eq!(gate.authorize_start(&actor, "e").unwrap().remaining, 2);
        gate.submit(&actor, "e", &submission(false)).unwrap();
        gate.submit(&actor, "e", &submission(false)).unwrap();
        assert_eq!(
            gate.authorize_start(&actor, "e"),
            Err(IntegrityError::AttemptsExhausted { used: 2, total_allowed: 2 })
        );
    }

    #[test]
    fn active_suspension_blocks_start() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_suspension(
                &ExamSuspension {
                    id: "x".into(),
                    student_id: "s".into(),
                    exam_id: "e".into(),
                    incidents: vec![],
                    reason: "r".into(),
                    suspension_time: 0,
                    reviewed_by_admin: false,
                    admin_notes: None,
                    reviewed_at: None,
                    reviewed_by: None,
                    removed: false,
                    removed_at: None,
                },
                None,
            )
            .unwrap();
        let gate = gate(&store);
        assert_eq!(gate.authorize_start(&Actor::student("s"), "e"), Err(IntegrityError::Suspended));
        assert!(gate.authorize_start(&Actor::student("s"), "other").is_ok());
    }

    #[test]
    fn concurrent_submits_respect_quota() {
        let store = Arc::new(MemoryStore::new());
        store
            .assign_batch("s", BatchSettings { batch_id: "b".into(), max_attempts: Some(1), ..Default::default() })
            .unwrap();
        let gate = gate(&store);
        let barrier = Barrier::new(8);

        let accepted = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let actor = Actor::student("s");
                        barrier.wait();
                        gate.submit(&actor, "e", &submission(false))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|r| {
                    if let Err(e) = r {
                        assert_eq!(*e, IntegrityError::AttemptsExhausted { used: 1, total_allowed: 1 });
                    }
                    r.is_ok()
                })
                .count()
        });
        assert_eq!(accepted, 1);
        assert_eq!(store.count_attempts("s", "e").unwrap(), 1);
    }

    #[test]
    fn busy_submission_lock_is_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let locks = Arc::new(LockManager::new(Duration::from_millis(1)));
        let gate = ExamGate::new(store.clone(), locks.clone()).with_lock_timeout(Duration::from_millis(5));
        let _held = locks.acquire(&LockKey::submission("s", "e"), Duration::ZERO).unwrap();

        let err = gate.submit(&Actor::student("s"), "e", &submission(true)).unwrap_err();
        assert_eq!(err.status_code(), 503);
        assert_eq!(store.count_attempts("s", "e").unwrap(), 0);
        // Starting is read-only and does not wait on the submission lock.
        assert!(gate.authorize_start(&Actor::student("s"), "e").is_ok());
    }
}
