use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use examguard::engine::{
    ExamSubmission, IncidentReport, OrderRequest, PaymentConfirmation, PaymentEvent,
    PaymentVerifier,
};
use examguard::model::{Actor, BatchSettings, GlobalSettings, IncidentType, PaymentType};
use examguard::store::memory::MemoryStore;
use examguard::store::{IncidentStore, SuspensionStore};
use examguard::{IntegrityError, IntegrityServices};

struct SignatureIs(&'static str);

impl PaymentVerifier for SignatureIs {
    fn verify_confirmation(&self, confirmation: &PaymentConfirmation) -> bool {
        confirmation.signature == self.0
    }
}

fn services(store: Arc<MemoryStore>) -> IntegrityServices<MemoryStore, SignatureIs> {
    IntegrityServices::new(
        store,
        Arc::new(SignatureIs("signed")),
        Duration::from_secs(5),
        Duration::from_millis(5),
    )
}

fn auto_suspend_store(max_incidents: i32) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .set_global(GlobalSettings { max_incidents: Some(max_incidents), enable_auto_suspend: Some(true) })
        .unwrap();
    store
}

fn tab_switch() -> IncidentReport {
    IncidentReport {
        incident_type: IncidentType::TabSwitch,
        details: serde_json::json!({ "hiddenForMs": 1200 }),
        user_agent: Some("Mozilla/5.0".into()),
        ip_address: Some("10.0.0.7".into()),
    }
}

fn confirmation(order: &str) -> PaymentConfirmation {
    PaymentConfirmation {
        order_id: order.into(),
        payment_id: format!("pay_{}", order),
        signature: "signed".into(),
    }
}

#[test]
fn suspension_payment_and_second_suspension() {
    let store = auto_suspend_store(5);
    let svc = services(store.clone());
    let student = Actor::student("stu-1");

    for n in 1..5 {
        let outcome = svc.suspensions.report_incident(&student, "exam-1", tab_switch()).unwrap();
        assert!(!outcome.suspended, "incident {} must not suspend", n);
    }
    let fifth = svc.suspensions.report_incident(&student, "exam-1", tab_switch()).unwrap();
    assert!(fifth.suspended);
    assert!(fifth.incident.as_ref().is_some_and(|i| i.caused_suspension));
    let first = fifth.suspension.unwrap();
    assert_eq!(first.reason, "Automatically suspended after 5 security incidents (limit: 5)");
    assert_eq!(first.incidents.len(), 5);
    assert_eq!(svc.gate.authorize_start(&student, "exam-1"), Err(IntegrityError::Suspended));

    svc.intake
        .open_order(
            &student,
            &OrderRequest {
                exam_id: "exam-1".into(),
                payment_type: PaymentType::Suspended,
                amount: 49900,
                gateway_order_id: "order_a".into(),
            },
        )
        .unwrap();
    let applied = svc.reinstatement.confirm(&confirmation("order_a")).unwrap();
    assert!(applied.suspension_removed);
    assert_eq!(applied.incidents_handled, 5);
    assert_eq!(applied.additional_incidents_allowed, Some(3));
    assert!(svc.gate.authorize_start(&student, "exam-1").is_ok());

    let status = svc.suspensions.status("stu-1", "exam-1").unwrap();
    assert_eq!(status.incident_count, 0);
    assert_eq!(status.security_settings.effective_max_incidents, 8);

    for _ in 0..7 {
        assert!(!svc.suspensions.report_incident(&student, "exam-1", tab_switch()).unwrap().suspended);
    }
    let eighth = svc.suspensions.report_incident(&student, "exam-1", tab_switch()).unwrap();
    assert!(eighth.suspended);
    assert_eq!(eighth.suspension_count, 2);
    assert!(eighth.suspension.unwrap().reason.ends_with(" - suspension #2"));
}

#[test]
fn concurrent_reports_create_one_suspension() {
    const REPORTERS: usize = 12;
    let store = auto_suspend_store(3);
    let svc = services(store.clone());
    let student = Actor::student("stu-2");
    for _ in 0..2 {
        svc.suspensions.report_incident(&student, "exam-2", tab_switch()).unwrap();
    }

    let barrier = Barrier::new(REPORTERS);
    let outcomes: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..REPORTERS)
            .map(|_| {
                let svc = svc.clone();
                let student = student.clone();
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    svc.suspensions.report_incident(&student, "exam-2", tab_switch()).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(store.suspensions_for("stu-2", "exam-2").unwrap().len(), 1);
    let active = store.find_active("stu-2", "exam-2").unwrap().unwrap();
    assert!(outcomes.iter().all(|o| o.suspended));
    assert!(outcomes.iter().all(|o| o.suspension.as_ref().map(|s| &s.id) == Some(&active.id)));

    let triggers = store
        .incidents_for("stu-2", "exam-2")
        .unwrap()
        .iter()
        .filter(|i| i.caused_suspension)
        .count();
    assert_eq!(triggers, 1);
    assert_eq!(store.count_incidents("stu-2", "exam-2", false).unwrap(), 2 + REPORTERS as i64);
}

#[test]
fn confirmation_and_webhook_apply_once() {
    let store = auto_suspend_store(1);
    let svc = services(store.clone());
    let student = Actor::student("stu-3");
    assert!(svc.suspensions.report_incident(&student, "exam-3", tab_switch()).unwrap().suspended);

    svc.intake
        .open_order(
            &student,
            &OrderRequest {
                exam_id: "exam-3".into(),
                payment_type: PaymentType::Suspended,
                amount: 100,
                gateway_order_id: "order_b".into(),
            },
        )
        .unwrap();

    let forged = PaymentConfirmation { signature: "forged".into(), ..confirmation("order_b") };
    assert_eq!(svc.reinstatement.confirm(&forged).unwrap_err(), IntegrityError::PaymentNotVerified);
    assert!(store.find_active("stu-3", "exam-3").unwrap().is_some());

    let direct = svc.reinstatement.confirm(&confirmation("order_b")).unwrap();
    assert!(!direct.replayed);
    let webhook = svc
        .reinstatement
        .handle_event(&PaymentEvent::Captured { order_id: "order_b".into(), payment_id: "pay_order_b".into() })
        .unwrap()
        .unwrap();
    assert!(webhook.replayed);
    assert!(!webhook.suspension_removed);

    let notes = store
        .incidents_for("stu-3", "exam-3")
        .unwrap()
        .into_iter()
        .filter(|i| i.incident_type == IncidentType::SystemNote)
        .count();
    assert_eq!(notes, 1);

    svc.reinstatement.handle_event(&PaymentEvent::Failed { order_id: "order_b".into() }).unwrap();
    assert!(store.find_active("stu-3", "exam-3").unwrap().is_none());
}

#[test]
fn late_payment_replay_keeps_new_suspension() {
    let store = auto_suspend_store(1);
    let svc = services(store.clone());
    let student = Actor::student("stu-6");
    assert!(svc.suspensions.report_incident(&student, "exam-6", tab_switch()).unwrap().suspended);

    svc.intake
        .open_order(
            &student,
            &OrderRequest {
                exam_id: "exam-6".into(),
                payment_type: PaymentType::Suspended,
                amount: 100,
                gateway_order_id: "order_c".into(),
            },
        )
        .unwrap();
    assert!(svc.reinstatement.confirm(&confirmation("order_c")).unwrap().suspension_removed);

    // 1 + 3 allowance: the fourth fresh incident suspends again.
    for _ in 0..3 {
        assert!(!svc.suspensions.report_incident(&student, "exam-6", tab_switch()).unwrap().suspended);
    }
    assert!(svc.suspensions.report_incident(&student, "exam-6", tab_switch()).unwrap().suspended);
    let second = store.find_active("stu-6", "exam-6").unwrap().unwrap();

    let webhook = svc
        .reinstatement
        .handle_event(&PaymentEvent::Captured { order_id: "order_c".into(), payment_id: "pay_order_c".into() })
        .unwrap()
        .unwrap();
    assert!(webhook.replayed);
    let resent = svc.reinstatement.confirm(&confirmation("order_c")).unwrap();
    assert!(resent.replayed);

    assert_eq!(store.find_active("stu-6", "exam-6").unwrap().map(|s| s.id), Some(second.id));
    assert_eq!(store.count_incidents("stu-6", "exam-6", true).unwrap(), 4);
    assert!(svc.gate.authorize_start(&student, "exam-6").is_err());
}

#[test]
fn attempt_purchase_extends_quota() {
    let store = Arc::new(MemoryStore::new());
    store
        .assign_batch(
            "stu-4",
            BatchSettings {
                batch_id: "batch-a".into(),
                max_attempts: Some(1),
                additional_attempts_after_payment: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
    let svc = services(store.clone());
    let student = Actor::student("stu-4");
    let failed = ExamSubmission { score: 12.0, passed: false };

    svc.gate.submit(&student, "exam-4", &failed).unwrap();
    assert_eq!(
        svc.gate.authorize_start(&student, "exam-4"),
        Err(IntegrityError::AttemptsExhausted { used: 1, total_allowed: 1 })
    );

    svc.intake
        .open_order(
            &student,
            &OrderRequest {
                exam_id: "exam-4".into(),
                payment_type: PaymentType::MaxAttempts,
                amount: 250,
                gateway_order_id: "order_c".into(),
            },
        )
        .unwrap();
    svc.reinstatement.confirm(&confirmation("order_c")).unwrap();
    svc.reinstatement.confirm(&confirmation("order_c")).unwrap();

    let quota = svc.quota.remaining("stu-4", "exam-4").unwrap();
    assert_eq!((quota.used, quota.total_allowed, quota.remaining), (1, 3, 2));

    svc.gate.submit(&student, "exam-4", &ExamSubmission { score: 91.0, passed: true }).unwrap();
    assert_eq!(svc.gate.authorize_start(&student, "exam-4"), Err(IntegrityError::AlreadyPassed));
}

#[test]
fn admin_removal_grants_allowance_without_handling_incidents() {
    let store = auto_suspend_store(2);
    let svc = services(store.clone());
    let student = Actor::student("stu-5");
    svc.suspensions.report_incident(&student, "exam-5", tab_switch()).unwrap();
    let outcome = svc.suspensions.report_incident(&student, "exam-5", tab_switch()).unwrap();
    let suspension = outcome.suspension.unwrap();

    svc.admin.remove_suspension(&Actor::admin("proctor"), &suspension.id, Some("false positive")).unwrap();

    // Both incidents still count; the allowance lifts the threshold to 5.
    let status = svc.suspensions.status("stu-5", "exam-5").unwrap();
    assert!(!status.suspended);
    assert_eq!(status.incident_count, 2);
    assert_eq!(status.security_settings.effective_max_incidents, 5);

    svc.suspensions.report_incident(&student, "exam-5", tab_switch()).unwrap();
    svc.suspensions.report_incident(&student, "exam-5", tab_switch()).unwrap();
    assert!(svc.suspensions.report_incident(&student, "exam-5", tab_switch()).unwrap().suspended);
}
