// Row models for the examguard database and their conversions to the
// integrity model
use diesel::prelude::*;
use super::schema::*;

use examguard::model::{
    BatchSettings, ExamResult, ExamSuspension, IncidentType, NewIncident, Payment, PaymentStatus,
    PaymentType, SecurityIncident,
};
use examguard::StoreError;

fn corrupt(what: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(format!("corrupt {} row: {}", what, detail))
}

#[derive(Insertable, Queryable, Clone, Debug)]
#[diesel(table_name = students)]
pub struct StudentRow {
    pub id: String,
    pub batch_id: Option<String>,
    pub created_at: i64,
}

#[derive(Insertable, Queryable, Clone, Debug)]
#[diesel(table_name = batches)]
pub struct BatchRow {
    pub id: String,
    pub name: String,
    pub max_attempts: Option<i32>,
    pub max_security_incidents: Option<i32>,
    pub enable_auto_suspend: Option<bool>,
    pub additional_security_incidents_after_removal: Option<i32>,
    pub additional_attempts_after_payment: Option<i32>,
    pub created_at: i64,
}

impl From<BatchRow> for BatchSettings {
    fn from(row: BatchRow) -> Self {
        BatchSettings {
            batch_id: row.id,
            max_attempts: row.max_attempts,
            max_security_incidents: row.max_security_incidents,
            enable_auto_suspend: row.enable_auto_suspend,
            additional_security_incidents_after_removal: row.additional_security_incidents_after_removal,
            additional_attempts_after_payment: row.additional_attempts_after_payment,
        }
    }
}

/// Global setting document; `value` holds JSON.
#[derive(Insertable, Queryable, Clone, Debug)]
#[diesel(table_name = settings)]
pub struct SettingRow {
    pub key: String,
    pub value: String,
    pub updated_at: i64,
}

#[derive(Insertable, Queryable, Clone, Debug)]
#[diesel(table_name = security_incidents)]
pub struct IncidentRow {
    pub id: String,
    pub student_id: String,
    pub exam_id: String,
    pub incident_type: String,         // wire name, e.g. "TAB_SWITCH"
    pub details: String,               // JSON document
    pub reported_at: i64,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub caused_suspension: bool,
    pub handled_by_payment: bool,
    pub handled_at: Option<i64>,
    pub suspension_removal_payment_ref: Option<String>,
}

impl IncidentRow {
    pub fn new(id: String, incident: NewIncident, reported_at: i64) -> Self {
        IncidentRow {
            id,
            student_id: incident.student_id,
            exam_id: incident.exam_id,
            incident_type: incident.incident_type.as_str().to_string(),
            details: incident.details.to_string(),
            reported_at,
            user_agent: incident.user_agent,
            ip_address: incident.ip_address,
            caused_suspension: false,
            handled_by_payment: false,
            handled_at: None,
            suspension_removal_payment_ref: None,
        }
    }

    pub fn into_model(self) -> Result<SecurityIncident, StoreError> {
        let incident_type: IncidentType =
            self.incident_type.parse().map_err(|e: String| corrupt("incident", e))?;
        let details = serde_json::from_str(&self.details).map_err(|e| corrupt("incident", e))?;
        Ok(SecurityIncident {
            id: self.id,
            student_id: self.student_id,
            exam_id: self.exam_id,
            incident_type,
            details,
            timestamp: self.reported_at,
            user_agent: self.user_agent,
            ip_address: self.ip_address,
            caused_suspension: self.caused_suspension,
            handled_by_payment: self.handled_by_payment,
            handled_at: self.handled_at,
            suspension_removal_payment_ref: self.suspension_removal_payment_ref,
        })
    }
}

#[derive(Insertable, Queryable, Clone, Debug)]
#[diesel(table_name = exam_suspensions)]
pub struct SuspensionRow {
    pub id: String,
    pub student_id: String,
    pub exam_id: String,
    pub incidents: String,             // JSON array of incident ids
    pub reason: String,
    pub suspension_time: i64,
    pub reviewed_by_admin: bool,
    pub admin_notes: Option<String>,
    pub reviewed_at: Option<i64>,
    pub reviewed_by: Option<String>,
    pub removed: bool,
    pub removed_at: Option<i64>,
}

impl SuspensionRow {
    pub fn from_model(suspension: &ExamSuspension) -> Result<Self, StoreError> {
        let incidents =
            serde_json::to_string(&suspension.incidents).map_err(|e| corrupt("suspension", e))?;
        Ok(SuspensionRow {
            id: suspension.id.clone(),
            student_id: suspension.student_id.clone(),
            exam_id: suspension.exam_id.clone(),
            incidents,
            reason: suspension.reason.clone(),
            suspension_time: suspension.suspension_time,
            reviewed_by_admin: suspension.reviewed_by_admin,
            admin_notes: suspension.admin_notes.clone(),
            reviewed_at: suspension.reviewed_at,
            reviewed_by: suspension.reviewed_by.clone(),
            removed: suspension.removed,
            removed_at: suspension.removed_at,
        })
    }

    pub fn into_model(self) -> Result<ExamSuspension, StoreError> {
        let incidents = serde_json::from_str(&self.incidents).map_err(|e| corrupt("suspension", e))?;
        Ok(ExamSuspension {
            id: self.id,
            student_id: self.student_id,
            exam_id: self.exam_id,
            incidents,
            reason: self.reason,
            suspension_time: self.suspension_time,
            reviewed_by_admin: self.reviewed_by_admin,
            admin_notes: self.admin_notes,
            reviewed_at: self.reviewed_at,
            reviewed_by: self.reviewed_by,
            removed: self.removed,
            removed_at: self.removed_at,
        })
    }
}

#[derive(Insertable, Queryable, Clone, Debug)]
#[diesel(table_name = payments)]
pub struct PaymentRow {
    pub id: String,
    pub student_id: String,
    pub exam_id: String,
    pub amount: i64,                   // minor currency units
    pub status: String,                // "created", "pending", "success", "failed"
    pub payment_type: String,          // "suspended" or "max_attempts"
    pub gateway_order_id: String,
    pub gateway_payment_id: Option<String>,
    pub additional_attempts: Option<i32>,
    pub additional_attempts_granted: bool,
    pub additional_attempts_granted_at: Option<i64>,
    pub reinstated_at: Option<i64>,
    pub created_at: i64,
}

impl From<&Payment> for PaymentRow {
    fn from(payment: &Payment) -> Self {
        PaymentRow {
            id: payment.id.clone(),
            student_id: payment.student_id.clone(),
            exam_id: payment.exam_id.clone(),
            amount: payment.amount,
            status: payment.status.as_str().to_string(),
            payment_type: payment.payment_type.as_str().to_string(),
            gateway_order_id: payment.gateway_order_id.clone(),
            gateway_payment_id: payment.gateway_payment_id.clone(),
            additional_attempts: payment.additional_attempts,
            additional_attempts_granted: payment.additional_attempts_granted,
            additional_attempts_granted_at: payment.additional_attempts_granted_at,
            reinstated_at: payment.reinstated_at,
            created_at: payment.created_at,
        }
    }
}

impl PaymentRow {
    pub fn into_model(self) -> Result<Payment, StoreError> {
        let status: PaymentStatus = self.status.parse().map_err(|e: String| corrupt("payment", e))?;
        let payment_type: PaymentType =
            self.payment_type.parse().map_err(|e: String| corrupt("payment", e))?;
        Ok(Payment {
            id: self.id,
            student_id: self.student_id,
            exam_id: self.exam_id,
            amount: self.amount,
            status,
            payment_type,
            gateway_order_id: self.gateway_order_id,
            gateway_payment_id: self.gateway_payment_id,
            additional_attempts: self.additional_attempts,
            additional_attempts_granted: self.additional_attempts_granted,
            additional_attempts_granted_at: self.additional_attempts_granted_at,
            reinstated_at: self.reinstated_at,
            created_at: self.created_at,
        })
    }
}

#[derive(Insertable, Queryable, Clone, Debug)]
#[diesel(table_name = exam_results)]
pub struct ResultRow {
    pub id: String,
    pub student_id: String,
    pub exam_id: String,
    pub score: f64,
    pub passed: bool,
    pub from_previous_payment_cycle: bool,
    pub submitted_at: i64,
}

impl From<&ExamResult> for ResultRow {
    fn from(result: &ExamResult) -> Self {
        ResultRow {
            id: result.id.clone(),
            student_id: result.student_id.clone(),
            exam_id: result.exam_id.clone(),
            score: result.score,
            passed: result.passed,
            from_previous_payment_cycle: result.from_previous_payment_cycle,
            submitted_at: result.submitted_at,
        }
    }
}
