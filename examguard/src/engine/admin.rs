use std::sync::Arc;

use crate::error::{IntegrityError, StoreError};
use crate::model::{Actor, ExamSuspension, ListFilter, Page, Paged, SecurityIncident};
use crate::store::{now, IncidentStore, SuspensionStore};

/// Review queue operations. Every call requires the admin role.
pub struct AdminReview<S> {
    store: Arc<S>,
}

impl<S> Clone for AdminReview<S> {
    fn clone(&self) -> Self {
        AdminReview { store: self.store.clone() }
    }
}

fn require_admin(actor: &Actor) -> Result<(), IntegrityError> {
    if actor.is_admin() { Ok(()) } else { Err(IntegrityError::Forbidden) }
}

impl<S> AdminReview<S>
where
    S: IncidentStore + SuspensionStore,
{
    pub fn new(store: Arc<S>) -> Self {
        AdminReview { store }
    }

    /// Lifts a suspension without payment. Incidents stay unhandled.
    pub fn remove_suspension(
        &self,
        actor: &Actor,
        suspension_id: &str,
        notes: Option<&str>,
    ) -> Result<ExamSuspension, IntegrityError> {
        require_admin(actor)?;
        let removed = self
            .store
            .remove_suspension(suspension_id, &actor.student_id, notes, now())?
            .ok_or(IntegrityError::InvalidSuspensionRemoval)?;
        tracing::info!(
            "Admin {} removed suspension {} (student {}, exam {})",
            actor.student_id, removed.id, removed.student_id, removed.exam_id
        );
        Ok(removed)
    }

    /// Marks the suspension reviewed and leaves it in force.
    pub fn keep_suspension(
        &self,
        actor: &Actor,
        suspension_id: &str,
        notes: Option<&str>,
    ) -> Result<ExamSuspension, IntegrityError> {
        require_admin(actor)?;
        self.store
            .review_suspension(suspension_id, &actor.student_id, notes, now())?
            .ok_or(IntegrityError::Store(StoreError::NotFound))
    }

    pub fn list_incidents(
        &self,
        actor: &Actor,
        filter: &ListFilter,
        page: Page,
    ) -> Result<Paged<SecurityIncident>, IntegrityError> {
        require_admin(actor)?;
        Ok(self.store.list_incidents(filter, page)?)
    }

    pub fn list_suspensions(
        &self,
        actor: &Actor,
        filter: &ListFilter,
        page: Page,
    ) -> Result<Paged<ExamSuspension>, IntegrityError> {
        require_admin(actor)?;
        Ok(self.store.list_suspensions(filter, page)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .create_suspension(
                &ExamSuspension {
                    id: "susp".into(),
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
        store
    }

    #[test]
    fn students_cannot_use_admin_operations() {
        let review = AdminReview::new(seeded());
        let student = Actor::student("s");
        assert_eq!(review.remove_suspension(&student, "susp", None), Err(IntegrityError::Forbidden));
        assert_eq!(
            review.list_incidents(&student, &ListFilter::default(), Page::default()).unwrap_err(),
            IntegrityError::Forbidden
        );
    }

    #[test]
    fn removing_twice_is_invalid() {
        let store = seeded();
        let review = AdminReview::new(store.clone());
        let admin = Actor::admin("root");

        let removed = review.remove_suspension(&admin, "susp", Some("appeal accepted")).unwrap();
        assert!(removed.removed);
        assert_eq!(removed.reviewed_by.as_deref(), Some("root"));
        assert_eq!(
            review.remove_suspension(&admin, "susp", None),
            Err(IntegrityError::InvalidSuspensionRemoval)
        );
        assert_eq!(
            review.remove_suspension(&admin, "missing", None),
            Err(IntegrityError::InvalidSuspensionRemoval)
        );
    }

    #[test]
    fn keep_marks_reviewed_but_active() {
        let store = seeded();
        let review = AdminReview::new(store.clone());
        let kept = review.keep_suspension(&Actor::admin("root"), "susp", Some("confirmed")).unwrap();
        assert!(kept.reviewed_by_admin);
        assert!(!kept.removed);
        assert_eq!(kept.admin_notes.as_deref(), Some("confirmed"));
        assert!(store.find_active("s", "e").unwrap().is_some());

        let page = review
            .list_suspensions(&Actor::admin("root"), &ListFilter::default(), Page::default())
            .unwrap();
        assert_eq!(page.total, 1);
    }
}
