use serde::Deserialize;
use std::sync::Arc;

use crate::engine::quota::QuotaCalculator;
use crate::error::{IntegrityError, StoreError};
use crate::model::{Actor, Payment, PaymentStatus, PaymentType};
use crate::store::{new_id, now, PaymentStore, PolicyStore, ResultStore, SuspensionStore};

/// Order created with the gateway by the client-facing checkout flow.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub exam_id: String,
    pub payment_type: PaymentType,
    pub amount: i64,
    pub gateway_order_id: String,
}

/// Registers payment orders, refusing ones that would buy nothing.
pub struct PaymentIntake<S> {
    store: Arc<S>,
    quota: QuotaCalculator<S>,
}

impl<S> Clone for PaymentIntake<S> {
    fn clone(&self) -> Self {
        PaymentIntake { store: self.store.clone(), quota: self.quota.clone() }
    }
}

impl<S> PaymentIntake<S>
where
    S: SuspensionStore + PaymentStore + ResultStore + PolicyStore,
{
    pub fn new(store: Arc<S>) -> Self {
        PaymentIntake { quota: QuotaCalculator::new(store.clone()), store }
    }

    fn check_eligible(&self, student_id: &str, order: &OrderRequest) -> Result<(), IntegrityError> {
        match order.payment_type {
            PaymentType::Suspended => {
                if self.store.find_active(student_id, &order.exam_id)?.is_none() {
                    return Err(IntegrityError::PaymentNotEligible(
                        "no active suspension for this exam".to_string(),
                    ));
                }
            }
            PaymentType::MaxAttempts => {
                if self.store.has_passed(student_id, &order.exam_id)? {
                    return Err(IntegrityError::PaymentNotEligible("exam already passed".to_string()));
                }
                let quota = self.quota.remaining(student_id, &order.exam_id)?;
                if quota.remaining > 0 {
                    return Err(IntegrityError::PaymentNotEligible(format!(
                        "{} attempts still available",
                        quota.remaining
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn open_order(&self, actor: &Actor, order: &OrderRequest) -> Result<Payment, IntegrityError> {
        self.check_eligible(&actor.student_id, order)?;

        let payment = Payment {
            id: new_id(),
            student_id: actor.student_id.clone(),
            exam_id: order.exam_id.clone(),
            amount: order.amount,
            status: PaymentStatus::Created,
            payment_type: order.payment_type,
            gateway_order_id: order.gateway_order_id.clone(),
            gateway_payment_id: None,
            additional_attempts: None,
            additional_attempts_granted: false,
            additional_attempts_granted_at: None,
            reinstated_at: None,
            created_at: now(),
        };
        match self.store.insert_payment(&payment) {
            Ok(()) => {}
            Err(StoreError::Duplicate) => {
                return Err(IntegrityError::PaymentNotEligible("order already registered".to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!(
            "Payment order {} ({}) opened for student {} on exam {}",
            payment.gateway_order_id,
            payment.payment_type.as_str(),
            payment.student_id,
            payment.exam_id
        );
        Ok(payment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExamResult, ExamSuspension};
    use crate::store::memory::MemoryStore;

    fn order(kind: PaymentType, id: &str) -> OrderRequest {
        OrderRequest {
            exam_id: "e".into(),
            payment_type: kind,
            amount: 999,
            gateway_order_id: id.into(),
        }
    }

    #[test]
    fn suspension_payment_needs_active_suspension() {
        let store = Arc::new(MemoryStore::new());
        let intake = PaymentIntake::new(store.clone());
        let actor = Actor::student("s");
        assert!(matches!(
            intake.open_order(&actor, &order(PaymentType::Suspended, "o1")),
            Err(IntegrityError::PaymentNotEligible(_))
        ));

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
        let payment = intake.open_order(&actor, &order(PaymentType::Suspended, "o1")).unwrap();
        assert_eq!(payment.status, PaymentStatus::Created);
        assert!(matches!(
            intake.open_order(&actor, &order(PaymentType::Suspended, "o1")),
            Err(IntegrityError::PaymentNotEligible(_))
        ));
    }

    #[test]
    fn attempt_purchase_needs_exhausted_quota() {
        let store = Arc::new(MemoryStore::new());
        let intake = PaymentIntake::new(store.clone());
        let actor = Actor::student("s");
        assert!(intake.open_order(&actor, &order(PaymentType::MaxAttempts, "o2")).is_err());

        store
            .insert_result(&ExamResult {
                id: "r1".into(),
                student_id: "s".into(),
                exam_id: "e".into(),
                score: 10.0,
                passed: false,
                from_previous_payment_cycle: false,
                submitted_at: 0,
            })
            .unwrap();
        assert!(intake.open_order(&actor, &order(PaymentType::MaxAttempts, "o2")).is_ok());
    }
}
