use serde::Serialize;
use std::sync::Arc;

use crate::error::IntegrityError;
use crate::model::{IncidentType, NewIncident, Payment, PaymentStatus, PaymentType};
use crate::settings::SettingsResolver;
use crate::store::{now, IncidentStore, PaymentStore, PolicyStore, SuspensionStore};

/// Gateway identifiers sent back by the client after checkout.
#[derive(Debug, Clone)]
pub struct PaymentConfirmation {
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
}

/// Checks that a confirmation really came from the payment gateway.
pub trait PaymentVerifier: Send + Sync {
    fn verify_confirmation(&self, confirmation: &PaymentConfirmation) -> bool;
}

/// Gateway notification, already authenticated by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEvent {
    Captured { order_id: String, payment_id: String },
    Failed { order_id: String },
    Ignored(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReinstatementOutcome {
    pub payment: Payment,
    pub suspension_removed: bool,
    pub incidents_handled: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_incidents_allowed: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_attempts: Option<i32>,
    /// Nothing changed: this payment had already been applied.
    pub replayed: bool,
}

/// Applies successful payments. Every mutation is conditional, so the direct
/// client confirmation and the gateway webhook may both run for one payment.
pub struct ReinstatementHandler<S, V> {
    store: Arc<S>,
    settings: SettingsResolver<S>,
    verifier: Arc<V>,
}

impl<S, V> Clone for ReinstatementHandler<S, V> {
    fn clone(&self) -> Self {
        ReinstatementHandler {
            store: self.store.clone(),
            settings: self.settings.clone(),
            verifier: self.verifier.clone(),
        }
    }
}

impl<S, V> ReinstatementHandler<S, V>
where
    S: IncidentStore + SuspensionStore + PaymentStore + PolicyStore,
    V: PaymentVerifier,
{
    pub fn new(store: Arc<S>, verifier: Arc<V>) -> Self {
        ReinstatementHandler {
            settings: SettingsResolver::new(store.clone()),
            store,
            verifier,
        }
    }

    pub fn confirm(
        &self,
        confirmation: &PaymentConfirmation,
    ) -> Result<ReinstatementOutcome, IntegrityError> {
        if !self.verifier.verify_confirmation(confirmation) {
            tracing::warn!("Rejected payment confirmation for order {}", confirmation.order_id);
            return Err(IntegrityError::PaymentNotVerified);
        }
        self.apply_verified(&confirmation.order_id, Some(confirmation.payment_id.as_str()))
    }

    pub fn handle_event(&self, event: &PaymentEvent) -> Result<Option<ReinstatementOutcome>, IntegrityError> {
        match event {
            PaymentEvent::Captured { order_id, payment_id } => {
                self.apply_verified(order_id, Some(payment_id.as_str())).map(Some)
            }
            PaymentEvent::Failed { order_id } => {
                self.record_failure(order_id)?;
                Ok(None)
            }
            PaymentEvent::Ignored(kind) => {
                tracing::debug!("Ignoring payment event {}", kind);
                Ok(None)
            }
        }
    }

    /// Marks the payment successful and applies its effect. Callers must
    /// have verified the payment with the gateway first.
    pub fn apply_verified(
        &self,
        order_id: &str,
        gateway_payment_id: Option<&str>,
    ) -> Result<ReinstatementOutcome, IntegrityError> {
        let payment = self
            .store
            .payment_by_order(order_id)?
            .ok_or(IntegrityError::PaymentNotFound)?;
        let status_changed =
            self.store.mark_payment_status(order_id, PaymentStatus::Success, gateway_payment_id)?;
        let resolved = self.settings.lookup(&payment.student_id);
        let at = now();

        let mut outcome = ReinstatementOutcome {
            payment: payment.clone(),
            suspension_removed: false,
            incidents_handled: 0,
            additional_incidents_allowed: None,
            additional_attempts: None,
            replayed: false,
        };

        match payment.payment_type {
            PaymentType::Suspended => {
                let allowance = resolved.additional_incidents_after_removal();
                let note = NewIncident {
                    student_id: payment.student_id.clone(),
                    exam_id: payment.exam_id.clone(),
                    incident_type: IncidentType::SystemNote,
                    details: serde_json::json!({
                        "message": format!(
                            "Suspension removed after payment; {} additional incidents allowed",
                            allowance
                        ),
                        "additionalIncidentsAllowed": allowance,
                        "paymentId": payment.id,
                        "gatewayOrderId": payment.gateway_order_id,
                    }),
                    user_agent: None,
                    ip_address: None,
                };
                let reinstated =
                    self.store.reinstate(&payment.student_id, &payment.exam_id, &payment.id, note, at)?;

                outcome.suspension_removed = reinstated.removed.is_some();
                outcome.incidents_handled = reinstated.handled;
                outcome.additional_incidents_allowed = Some(allowance);
                outcome.replayed = !status_changed && reinstated.is_noop();

                if reinstated.is_noop() {
                    tracing::info!("Payment {} already applied to student {}", payment.id, payment.student_id);
                } else {
                    tracing::info!(
                        "Student {} reinstated on exam {} by payment {} ({} incidents handled, +{} allowance)",
                        payment.student_id, payment.exam_id, payment.id, reinstated.handled, allowance
                    );
                }
            }
            PaymentType::MaxAttempts => {
                let attempts = resolved.additional_attempts_after_payment();
                let granted = self.store.grant_additional_attempts(&payment.id, attempts, at)?;
                outcome.replayed = !status_changed && !granted;

                if granted {
                    tracing::info!(
                        "Granted {} additional attempts to student {} on exam {} (payment {})",
                        attempts, payment.student_id, payment.exam_id, payment.id
                    );
                }
            }
        }

        let refreshed = self
            .store
            .payment_by_order(order_id)?
            .ok_or(IntegrityError::PaymentNotFound)?;
        outcome.additional_attempts = refreshed.additional_attempts;
        outcome.payment = refreshed;
        Ok(outcome)
    }

    /// Returns whether the status changed. Never downgrades a success.
    pub fn record_failure(&self, order_id: &str) -> Result<bool, IntegrityError> {
        if self.store.payment_by_order(order_id)?.is_none() {
            return Err(IntegrityError::PaymentNotFound);
        }
        let changed = self.store.mark_payment_status(order_id, PaymentStatus::Failed, None)?;
        if changed {
            tracing::warn!("Payment for order {} failed", order_id);
        }
        Ok(changed)
    }
}
