use serde::Serialize;
use std::sync::Arc;

use crate::error::IntegrityError;
use crate::settings::SettingsResolver;
use crate::store::{PaymentStore, PolicyStore, ResultStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptQuota {
    pub used: i64,
    pub total_allowed: i64,
    pub remaining: i64,
}

/// Attempt entitlement: batch base plus every successful attempt purchase.
/// Always recomputed from stored results and payments; suspensions and
/// incidents play no part.
pub struct QuotaCalculator<S> {
    store: Arc<S>,
    settings: SettingsResolver<S>,
}

impl<S> Clone for QuotaCalculator<S> {
    fn clone(&self) -> Self {
        QuotaCalculator { store: self.store.clone(), settings: self.settings.clone() }
    }
}

impl<S> QuotaCalculator<S>
where
    S: PaymentStore + ResultStore + PolicyStore,
{
    pub fn new(store: Arc<S>) -> Self {
        QuotaCalculator { settings: SettingsResolver::new(store.clone()), store }
    }

    pub fn remaining(&self, student_id: &str, exam_id: &str) -> Result<AttemptQuota, IntegrityError> {
        let base = i64::from(self.settings.lookup(student_id).max_attempts());
        let purchased = self.store.sum_additional_attempts(student_id, exam_id)?;
        let used = self.store.count_attempts(student_id, exam_id)?;
        let total_allowed = base + purchased;

        Ok(AttemptQuota { used, total_allowed, remaining: (total_allowed - used).max(0) })
    }

    pub fn ensure_can_attempt(
        &self,
        student_id: &str,
        exam_id: &str,
    ) -> Result<AttemptQuota, IntegrityError> {
        if self.store.has_passed(student_id, exam_id)? {
            return Err(IntegrityError::AlreadyPassed);
        }
        let quota = self.remaining(student_id, exam_id)?;
        if quota.used >= quota.total_allowed {
            return Err(IntegrityError::AttemptsExhausted {
                used: quota.used,
                total_allowed: quota.total_allowed,
            });
        }
        Ok(quota)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BatchSettings, ExamResult, Payment, PaymentStatus, PaymentType};
    use crate::store::memory::MemoryStore;
    use crate::store::new_id;

    fn result(passed: bool, previous_cycle: bool) -> ExamResult {
        ExamResult {
            id: new_id(),
            student_id: "s".into(),
            exam_id: "e".into(),
            score: 40.0,
            passed,
            from_previous_payment_cycle: previous_cycle,
            submitted_at: 0,
        }
    }

    fn purchase(order: &str, status: PaymentStatus, kind: PaymentType, attempts: i32) -> Payment {
        Payment {
            id: new_id(),
            student_id: "s".into(),
            exam_id: "e".into(),
            amount: 100,
            status,
            payment_type: kind,
            gateway_order_id: order.into(),
            gateway_payment_id: None,
            additional_attempts: Some(attempts),
            additional_attempts_granted: true,
            additional_attempts_granted_at: Some(0),
            reinstated_at: None,
            created_at: 0,
        }
    }

    fn store_with_base(base: i32) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .assign_batch("s", BatchSettings { batch_id: "b".into(), max_attempts: Some(base), ..Default::default() })
            .unwrap();
        store
    }

    #[test]
    fn base_quota_from_batch() {
        let store = store_with_base(3);
        store.insert_result(&result(false, false)).unwrap();
        let quota = QuotaCalculator::new(store).remaining("s", "e").unwrap();
        assert_eq!(quota, AttemptQuota { used: 1, total_allowed: 3, remaining: 2 });
    }

    #[test]
    fn only_successful_attempt_purchases_count() {
        let store = store_with_base(1);
        store.insert_payment(&purchase("o1", PaymentStatus::Success, PaymentType::MaxAttempts, 2)).unwrap();
        store.insert_payment(&purchase("o2", PaymentStatus::Success, PaymentType::MaxAttempts, 3)).unwrap();
        store.insert_payment(&purchase("o3", PaymentStatus::Failed, PaymentType::MaxAttempts, 9)).unwrap();
        store.insert_payment(&purchase("o4", PaymentStatus::Success, PaymentType::Suspended, 9)).unwrap();

        let quota = QuotaCalculator::new(store).remaining("s", "e").unwrap();
        assert_eq!(quota.total_allowed, 6);
    }

    #[test]
    fn previous_cycle_results_are_not_used() {
        let store = store_with_base(1);
        store.insert_result(&result(false, true)).unwrap();
        let calculator = QuotaCalculator::new(store.clone());
        assert_eq!(calculator.ensure_can_attempt("s", "e").unwrap().remaining, 1);

        store.insert_result(&result(false, false)).unwrap();
        assert_eq!(
            calculator.ensure_can_attempt("s", "e"),
            Err(IntegrityError::AttemptsExhausted { used: 1, total_allowed: 1 })
        );
    }

    #[test]
    fn passed_exam_blocks_further_attempts() {
        let store = store_with_base(5);
        store.insert_result(&result(true, false)).unwrap();
        assert_eq!(
            QuotaCalculator::new(store).ensure_can_attempt("s", "e"),
            Err(IntegrityError::AlreadyPassed)
        );
    }
}
