// Storage contracts implemented over the shared SQLite connection
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sqlite::Sqlite;
use std::sync::MutexGuard;

use examguard::model::{
    BatchSettings, ExamResult, ExamSuspension, GlobalSettings, IncidentType, ListFilter,
    NewIncident, Page, Paged, Payment, PaymentStatus, PaymentType, SecurityIncident,
};
use examguard::settings::{SETTING_ENABLE_AUTO_SUSPEND, SETTING_MAX_INCIDENTS};
use examguard::store::{
    new_id, now, IncidentStore, PaymentStore, PolicyStore, Reinstatement, ResultStore,
    SuspensionStore,
};
use examguard::StoreError;

use crate::db::models::{
    BatchRow, IncidentRow, PaymentRow, ResultRow, SettingRow, StudentRow, SuspensionRow,
};
use crate::db::schema::*;
use crate::db::DbPool;

fn store_err(e: DieselError) -> StoreError {
    match e {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => StoreError::Duplicate,
        DieselError::NotFound => StoreError::NotFound,
        other => {
            tracing::error!("Database error: {:?}", other);
            StoreError::Unavailable(other.to_string())
        }
    }
}

/// SQLite-backed [`examguard::IntegrityStore`]. Every call takes the pool
/// mutex for its whole duration; multi-row changes also run in a
/// transaction so a crash never leaves them half applied.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        SqliteStore { db }
    }

    fn conn(&self) -> Result<MutexGuard<'_, SqliteConnection>, StoreError> {
        self.db
            .lock()
            .map_err(|_| StoreError::Unavailable("database connection mutex poisoned".to_string()))
    }
}

// Fixture helpers; students, batches and settings are owned by other services.
#[cfg(test)]
impl SqliteStore {
    pub fn upsert_batch(&self, batch: &BatchRow) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::replace_into(batches::table)
            .values(batch)
            .execute(&mut *conn)
            .map_err(store_err)?;
        Ok(())
    }

    pub fn upsert_student(&self, student: &StudentRow) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::replace_into(students::table)
            .values(student)
            .execute(&mut *conn)
            .map_err(store_err)?;
        Ok(())
    }

    pub fn put_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        let row = SettingRow { key: key.to_string(), value: value.to_string(), updated_at: now() };
        let mut conn = self.conn()?;
        diesel::replace_into(settings::table)
            .values(&row)
            .execute(&mut *conn)
            .map_err(store_err)?;
        Ok(())
    }
}

fn incident_query<'a>(filter: &'a ListFilter) -> security_incidents::BoxedQuery<'a, Sqlite> {
    let mut query = security_incidents::table.into_boxed();
    if let Some(student_id) = &filter.student_id {
        query = query.filter(security_incidents::student_id.eq(student_id));
    }
    if let Some(exam_id) = &filter.exam_id {
        query = query.filter(security_incidents::exam_id.eq(exam_id));
    }
    query
}

fn suspension_query<'a>(filter: &'a ListFilter) -> exam_suspensions::BoxedQuery<'a, Sqlite> {
    let mut query = exam_suspensions::table.into_boxed();
    if let Some(student_id) = &filter.student_id {
        query = query.filter(exam_suspensions::student_id.eq(student_id));
    }
    if let Some(exam_id) = &filter.exam_id {
        query = query.filter(exam_suspensions::exam_id.eq(exam_id));
    }
    query
}

fn find_active_row(
    conn: &mut SqliteConnection,
    student_id: &str,
    exam_id: &str,
) -> Result<Option<SuspensionRow>, DieselError> {
    exam_suspensions::table
        .filter(exam_suspensions::student_id.eq(student_id))
        .filter(exam_suspensions::exam_id.eq(exam_id))
        .filter(exam_suspensions::removed.eq(false))
        .first::<SuspensionRow>(conn)
        .optional()
}

fn suspension_by_id(
    conn: &mut SqliteConnection,
    suspension_id: &str,
) -> Result<Option<SuspensionRow>, DieselError> {
    exam_suspensions::table
        .filter(exam_suspensions::id.eq(suspension_id))
        .first::<SuspensionRow>(conn)
        .optional()
}

fn parse_setting<T: serde::de::DeserializeOwned>(row: &SettingRow) -> Option<T> {
    match serde_json::from_str(&row.value) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Ignoring unparsable setting {} = {:?}: {}", row.key, row.value, e);
            None
        }
    }
}

// ==================== POLICY ====================

impl PolicyStore for SqliteStore {
    fn global_settings(&self) -> Result<GlobalSettings, StoreError> {
        let mut conn = self.conn()?;
        let rows = settings::table
            .filter(settings::key.eq_any([SETTING_MAX_INCIDENTS, SETTING_ENABLE_AUTO_SUSPEND]))
            .load::<SettingRow>(&mut *conn)
            .map_err(store_err)?;

        let mut global = GlobalSettings::default();
        for row in &rows {
            match row.key.as_str() {
                SETTING_MAX_INCIDENTS => global.max_incidents = parse_setting(row),
                SETTING_ENABLE_AUTO_SUSPEND => global.enable_auto_suspend = parse_setting(row),
                _ => {}
            }
        }
        Ok(global)
    }

    fn batch_for_student(&self, student_id: &str) -> Result<Option<BatchSettings>, StoreError> {
        let mut conn = self.conn()?;
        let student = students::table
            .filter(students::id.eq(student_id))
            .first::<StudentRow>(&mut *conn)
            .optional()
            .map_err(store_err)?;
        let Some(batch_id) = student.and_then(|s| s.batch_id) else {
            return Ok(None);
        };

        let batch = batches::table
            .filter(batches::id.eq(&batch_id))
            .first::<BatchRow>(&mut *conn)
            .optional()
            .map_err(store_err)?;
        Ok(batch.map(BatchSettings::from))
    }
}

// ==================== INCIDENTS ====================

impl IncidentStore for SqliteStore {
    fn record(&self, incident: NewIncident) -> Result<SecurityIncident, StoreError> {
        let row = IncidentRow::new(new_id(), incident, now());
        let mut conn = self.conn()?;
        diesel::insert_into(security_incidents::table)
            .values(&row)
            .execute(&mut *conn)
            .map_err(store_err)?;
        row.into_model()
    }

    fn count_incidents(
        &self,
        student_id: &str,
        exam_id: &str,
        exclude_handled: bool,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn()?;
        let mut query = security_incidents::table
            .filter(security_incidents::student_id.eq(student_id))
            .filter(security_incidents::exam_id.eq(exam_id))
            .filter(security_incidents::incident_type.ne(IncidentType::SystemNote.as_str()))
            .into_boxed();
        if exclude_handled {
            query = query.filter(security_incidents::handled_by_payment.eq(false));
        }
        query.count().get_result::<i64>(&mut *conn).map_err(store_err)
    }

    fn incident_ids(&self, student_id: &str, exam_id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn()?;
        security_incidents::table
            .filter(security_incidents::student_id.eq(student_id))
            .filter(security_incidents::exam_id.eq(exam_id))
            .filter(security_incidents::incident_type.ne(IncidentType::SystemNote.as_str()))
            .order((security_incidents::reported_at.asc(), security_incidents::id.asc()))
            .select(security_incidents::id)
            .load::<String>(&mut *conn)
            .map_err(store_err)
    }

    fn list_incidents(
        &self,
        filter: &ListFilter,
        page: Page,
    ) -> Result<Paged<SecurityIncident>, StoreError> {
        let mut conn = self.conn()?;
        let total = incident_query(filter)
            .count()
            .get_result::<i64>(&mut *conn)
            .map_err(store_err)?;
        let rows = incident_query(filter)
            .order((security_incidents::reported_at.desc(), security_incidents::id.desc()))
            .limit(i64::from(page.per_page))
            .offset(page.offset() as i64)
            .load::<IncidentRow>(&mut *conn)
            .map_err(store_err)?;

        Ok(Paged {
            items: rows.into_iter().map(IncidentRow::into_model).collect::<Result<_, _>>()?,
            total: total as u64,
            page: page.page,
            per_page: page.per_page,
        })
    }
}

// ==================== SUSPENSIONS ====================

impl SuspensionStore for SqliteStore {
    fn find_active(
        &self,
        student_id: &str,
        exam_id: &str,
    ) -> Result<Option<ExamSuspension>, StoreError> {
        let mut conn = self.conn()?;
        find_active_row(&mut conn, student_id, exam_id)
            .map_err(store_err)?
            .map(SuspensionRow::into_model)
            .transpose()
    }

    fn count_suspensions(&self, student_id: &str, exam_id: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn()?;
        exam_suspensions::table
            .filter(exam_suspensions::student_id.eq(student_id))
            .filter(exam_suspensions::exam_id.eq(exam_id))
            .count()
            .get_result::<i64>(&mut *conn)
            .map_err(store_err)
    }

    fn latest_removed(
        &self,
        student_id: &str,
        exam_id: &str,
    ) -> Result<Option<ExamSuspension>, StoreError> {
        let mut conn = self.conn()?;
        exam_suspensions::table
            .filter(exam_suspensions::student_id.eq(student_id))
            .filter(exam_suspensions::exam_id.eq(exam_id))
            .filter(exam_suspensions::removed.eq(true))
            .order(exam_suspensions::removed_at.desc())
            .first::<SuspensionRow>(&mut *conn)
            .optional()
            .map_err(store_err)?
            .map(SuspensionRow::into_model)
            .transpose()
    }

    fn create_suspension(
        &self,
        suspension: &ExamSuspension,
        trigger_incident_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let row = SuspensionRow::from_model(suspension)?;
        let mut conn = self.conn()?;
        conn.transaction::<_, DieselError, _>(|conn| {
            diesel::insert_into(exam_suspensions::table).values(&row).execute(conn)?;
            if let Some(trigger) = trigger_incident_id {
                diesel::update(security_incidents::table.filter(security_incidents::id.eq(trigger)))
                    .set(security_incidents::caused_suspension.eq(true))
                    .execute(conn)?;
            }
            Ok(())
        })
        .map_err(store_err)
    }

    fn reinstate(
        &self,
        student_id: &str,
        exam_id: &str,
        payment_ref: &str,
        note: NewIncident,
        now: i64,
    ) -> Result<Reinstatement, StoreError> {
        let note_row = IncidentRow::new(new_id(), note, now);
        let mut conn = self.conn()?;

        let (removed, handled, note) = conn
            .transaction::<_, DieselError, _>(|conn| {
                let consumed = diesel::update(
                    payments::table
                        .filter(payments::id.eq(payment_ref))
                        .filter(payments::reinstated_at.is_null()),
                )
                .set(payments::reinstated_at.eq(Some(now)))
                .execute(conn)?;
                if consumed == 0 {
                    payments::table
                        .find(payment_ref)
                        .select(payments::id)
                        .first::<String>(conn)?;
                    return Ok((None, 0, None));
                }

                let mut removed = None;
                if let Some(active) = find_active_row(conn, student_id, exam_id)? {
                    let updated = diesel::update(
                        exam_suspensions::table
                            .filter(exam_suspensions::id.eq(&active.id))
                            .filter(exam_suspensions::removed.eq(false)),
                    )
                    .set((
                        exam_suspensions::removed.eq(true),
                        exam_suspensions::removed_at.eq(Some(now)),
                    ))
                    .execute(conn)?;
                    if updated > 0 {
                        removed = suspension_by_id(conn, &active.id)?;
                    }
                }

                let handled = diesel::update(
                    security_incidents::table
                        .filter(security_incidents::student_id.eq(student_id))
                        .filter(security_incidents::exam_id.eq(exam_id))
                        .filter(security_incidents::handled_by_payment.eq(false))
                        .filter(security_incidents::incident_type.ne(IncidentType::SystemNote.as_str())),
                )
                .set((
                    security_incidents::handled_by_payment.eq(true),
                    security_incidents::handled_at.eq(Some(now)),
                    security_incidents::suspension_removal_payment_ref.eq(Some(payment_ref)),
                ))
                .execute(conn)?;

                let mut note = None;
                if removed.is_some() || handled > 0 {
                    diesel::insert_into(security_incidents::table).values(&note_row).execute(conn)?;
                    note = Some(note_row.clone());
                }
                Ok((removed, handled, note))
            })
            .map_err(store_err)?;

        Ok(Reinstatement {
            removed: removed.map(SuspensionRow::into_model).transpose()?,
            handled,
            note: note.map(IncidentRow::into_model).transpose()?,
        })
    }

    fn remove_suspension(
        &self,
        suspension_id: &str,
        reviewer: &str,
        notes: Option<&str>,
        now: i64,
    ) -> Result<Option<ExamSuspension>, StoreError> {
        let mut conn = self.conn()?;
        let row = conn
            .transaction::<_, DieselError, _>(|conn| {
                let target = exam_suspensions::table
                    .filter(exam_suspensions::id.eq(suspension_id))
                    .filter(exam_suspensions::removed.eq(false));
                let updated = diesel::update(target)
                    .set((
                        exam_suspensions::removed.eq(true),
                        exam_suspensions::removed_at.eq(Some(now)),
                        exam_suspensions::reviewed_by_admin.eq(true),
                        exam_suspensions::reviewed_by.eq(Some(reviewer)),
                        exam_suspensions::reviewed_at.eq(Some(now)),
                    ))
                    .execute(conn)?;
                if updated == 0 {
                    return Ok(None);
                }
                if let Some(notes) = notes {
                    diesel::update(exam_suspensions::table.filter(exam_suspensions::id.eq(suspension_id)))
                        .set(exam_suspensions::admin_notes.eq(Some(notes)))
                        .execute(conn)?;
                }
                suspension_by_id(conn, suspension_id)
            })
            .map_err(store_err)?;
        row.map(SuspensionRow::into_model).transpose()
    }

    fn review_suspension(
        &self,
        suspension_id: &str,
        reviewer: &str,
        notes: Option<&str>,
        now: i64,
    ) -> Result<Option<ExamSuspension>, StoreError> {
        let mut conn = self.conn()?;
        let row = conn
            .transaction::<_, DieselError, _>(|conn| {
                let updated = diesel::update(
                    exam_suspensions::table.filter(exam_suspensions::id.eq(suspension_id)),
                )
                .set((
                    exam_suspensions::reviewed_by_admin.eq(true),
                    exam_suspensions::reviewed_by.eq(Some(reviewer)),
                    exam_suspensions::reviewed_at.eq(Some(now)),
                ))
                .execute(conn)?;
                if updated == 0 {
                    return Ok(None);
                }
                if let Some(notes) = notes {
                    diesel::update(exam_suspensions::table.filter(exam_suspensions::id.eq(suspension_id)))
                        .set(exam_suspensions::admin_notes.eq(Some(notes)))
                        .execute(conn)?;
                }
                suspension_by_id(conn, suspension_id)
            })
            .map_err(store_err)?;
        row.map(SuspensionRow::into_model).transpose()
    }

    fn get_suspension(&self, suspension_id: &str) -> Result<Option<ExamSuspension>, StoreError> {
        let mut conn = self.conn()?;
        suspension_by_id(&mut conn, suspension_id)
            .map_err(store_err)?
            .map(SuspensionRow::into_model)
            .transpose()
    }

    fn list_suspensions(
        &self,
        filter: &ListFilter,
        page: Page,
    ) -> Result<Paged<ExamSuspension>, StoreError> {
        let mut conn = self.conn()?;
        let total = suspension_query(filter)
            .count()
            .get_result::<i64>(&mut *conn)
            .map_err(store_err)?;
        let rows = suspension_query(filter)
            .order((exam_suspensions::suspension_time.desc(), exam_suspensions::id.desc()))
            .limit(i64::from(page.per_page))
            .offset(page.offset() as i64)
            .load::<SuspensionRow>(&mut *conn)
            .map_err(store_err)?;

        Ok(Paged {
            items: rows.into_iter().map(SuspensionRow::into_model).collect::<Result<_, _>>()?,
            total: total as u64,
            page: page.page,
            per_page: page.per_page,
        })
    }
}

// ==================== PAYMENTS ====================

impl PaymentStore for SqliteStore {
    fn insert_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::insert_into(payments::table)
            .values(&PaymentRow::from(payment))
            .execute(&mut *conn)
            .map_err(store_err)?;
        Ok(())
    }

    fn payment_by_order(&self, gateway_order_id: &str) -> Result<Option<Payment>, StoreError> {
        let mut conn = self.conn()?;
        payments::table
            .filter(payments::gateway_order_id.eq(gateway_order_id))
            .first::<PaymentRow>(&mut *conn)
            .optional()
            .map_err(store_err)?
            .map(PaymentRow::into_model)
            .transpose()
    }

    fn mark_payment_status(
        &self,
        gateway_order_id: &str,
        status: PaymentStatus,
        gateway_payment_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let target = payments::table
            .filter(payments::gateway_order_id.eq(gateway_order_id))
            .filter(payments::status.ne(PaymentStatus::Success.as_str()))
            .filter(payments::status.ne(status.as_str()));

        let updated = match gateway_payment_id {
            Some(payment_id) => diesel::update(target)
                .set((
                    payments::status.eq(status.as_str()),
                    payments::gateway_payment_id.eq(Some(payment_id)),
                ))
                .execute(&mut *conn),
            None => diesel::update(target)
                .set(payments::status.eq(status.as_str()))
                .execute(&mut *conn),
        }
        .map_err(store_err)?;
        Ok(updated > 0)
    }

    fn grant_additional_attempts(
        &self,
        payment_id: &str,
        attempts: i32,
        now: i64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let updated = diesel::update(
            payments::table
                .filter(payments::id.eq(payment_id))
                .filter(payments::additional_attempts_granted.eq(false)),
        )
        .set((
            payments::additional_attempts.eq(Some(attempts)),
            payments::additional_attempts_granted.eq(true),
            payments::additional_attempts_granted_at.eq(Some(now)),
        ))
        .execute(&mut *conn)
        .map_err(store_err)?;
        Ok(updated > 0)
    }

    fn sum_additional_attempts(&self, student_id: &str, exam_id: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn()?;
        let granted = payments::table
            .filter(payments::student_id.eq(student_id))
            .filter(payments::exam_id.eq(exam_id))
            .filter(payments::status.eq(PaymentStatus::Success.as_str()))
            .filter(payments::payment_type.eq(PaymentType::MaxAttempts.as_str()))
            .select(payments::additional_attempts)
            .load::<Option<i32>>(&mut *conn)
            .map_err(store_err)?;
        Ok(granted.into_iter().flatten().map(i64::from).sum())
    }
}

// ==================== RESULTS ====================

impl ResultStore for SqliteStore {
    fn count_attempts(&self, student_id: &str, exam_id: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn()?;
        exam_results::table
            .filter(exam_results::student_id.eq(student_id))
            .filter(exam_results::exam_id.eq(exam_id))
            .filter(exam_results::from_previous_payment_cycle.eq(false))
            .count()
            .get_result::<i64>(&mut *conn)
            .map_err(store_err)
    }

    fn has_passed(&self, student_id: &str, exam_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let passed = exam_results::table
            .filter(exam_results::student_id.eq(student_id))
            .filter(exam_results::exam_id.eq(exam_id))
            .filter(exam_results::passed.eq(true))
            .count()
            .get_result::<i64>(&mut *conn)
            .map_err(store_err)?;
        Ok(passed > 0)
    }

    fn insert_result(&self, result: &ExamResult) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        diesel::insert_into(exam_results::table)
            .values(&ResultRow::from(result))
            .execute(&mut *conn)
            .map_err(store_err)?;
        Ok(())
    }
}
