pub mod admin;
pub mod gate;
pub mod intake;
pub mod quota;
pub mod reinstatement;
pub mod suspension;

use std::sync::Arc;
use std::time::Duration;

pub use admin::AdminReview;
pub use gate::{ExamGate, ExamSubmission};
pub use intake::{OrderRequest, PaymentIntake};
pub use quota::{AttemptQuota, QuotaCalculator};
pub use reinstatement::{
    PaymentConfirmation, PaymentEvent, PaymentVerifier, ReinstatementHandler, ReinstatementOutcome,
};
pub use suspension::{IncidentOutcome, IncidentReport, SecuritySettingsView, SuspensionEngine};

use crate::lock::LockManager;
use crate::store::IntegrityStore;

/// Every integrity service wired to one store, one lock manager and one
/// payment verifier.
pub struct IntegrityServices<S, V> {
    pub suspensions: SuspensionEngine<S>,
    pub reinstatement: ReinstatementHandler<S, V>,
    pub intake: PaymentIntake<S>,
    pub quota: QuotaCalculator<S>,
    pub gate: ExamGate<S>,
    pub admin: AdminReview<S>,
}

impl<S, V> Clone for IntegrityServices<S, V> {
    fn clone(&self) -> Self {
        IntegrityServices {
            suspensions: self.suspensions.clone(),
            reinstatement: self.reinstatement.clone(),
            intake: self.intake.clone(),
            quota: self.quota.clone(),
            gate: self.gate.clone(),
            admin: self.admin.clone(),
        }
    }
}

impl<S, V> IntegrityServices<S, V>
where
    S: IntegrityStore,
    V: PaymentVerifier,
{
    pub fn new(store: Arc<S>, verifier: Arc<V>, lock_timeout: Duration, poll_interval: Duration) -> Self {
        let locks = Arc::new(LockManager::new(poll_interval));
        IntegrityServices {
            suspensions: SuspensionEngine::new(store.clone(), locks.clone()).with_lock_timeout(lock_timeout),
            reinstatement: ReinstatementHandler::new(store.clone(), verifier),
            intake: PaymentIntake::new(store.clone()),
            quota: QuotaCalculator::new(store.clone()),
            gate: ExamGate::new(store.clone(), locks).with_lock_timeout(lock_timeout),
            admin: AdminReview::new(store),
        }
    }
}
