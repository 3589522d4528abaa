use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Proctoring violation categories reported by the exam client.
///
/// `SystemNote` is never reported by a client. It marks audit entries written
/// by the server (allowance changes after payment) and is excluded from every
/// threshold count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncidentType {
    #[serde(rename = "TAB_SWITCH")]
    TabSwitch,
    #[serde(rename = "EXIT_FULLSCREEN")]
    ExitFullscreen,
    #[serde(rename = "BROWSER_MINIMIZE")]
    BrowserMinimize,
    #[serde(rename = "BROWSER_CLOSE")]
    BrowserClose,
    #[serde(rename = "DEV_TOOLS_OPEN")]
    DevToolsOpen,
    #[serde(rename = "COPY_ATTEMPT")]
    CopyAttempt,
    #[serde(rename = "MULTIPLE_WINDOWS")]
    MultipleWindows,
    #[serde(rename = "NETWORK_CHANGE")]
    NetworkChange,
    #[serde(rename = "SCREENSHOT_ATTEMPT")]
    ScreenshotAttempt,
    #[serde(rename = "CAMERA_INACTIVE")]
    CameraInactive,
    #[serde(rename = "OTHER")]
    Other,
    #[serde(rename = "system_note")]
    SystemNote,
}

impl IncidentType {
    pub const ALL: [IncidentType; 12] = [
        IncidentType::TabSwitch,
        IncidentType::ExitFullscreen,
        IncidentType::BrowserMinimize,
        IncidentType::BrowserClose,
        IncidentType::DevToolsOpen,
        IncidentType::CopyAttempt,
        IncidentType::MultipleWindows,
        IncidentType::NetworkChange,
        IncidentType::ScreenshotAttempt,
        IncidentType::CameraInactive,
        IncidentType::Other,
        IncidentType::SystemNote,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentType::TabSwitch => "TAB_SWITCH",
            IncidentType::ExitFullscreen => "EXIT_FULLSCREEN",
            IncidentType::BrowserMinimize => "BROWSER_MINIMIZE",
            IncidentType::BrowserClose => "BROWSER_CLOSE",
            IncidentType::DevToolsOpen => "DEV_TOOLS_OPEN",
            IncidentType::CopyAttempt => "COPY_ATTEMPT",
            IncidentType::MultipleWindows => "MULTIPLE_WINDOWS",
            IncidentType::NetworkChange => "NETWORK_CHANGE",
            IncidentType::ScreenshotAttempt => "SCREENSHOT_ATTEMPT",
            IncidentType::CameraInactive => "CAMERA_INACTIVE",
            IncidentType::Other => "OTHER",
            IncidentType::SystemNote => "system_note",
        }
    }

    /// Whether a client may submit this type.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, IncidentType::SystemNote)
    }

    pub fn counts_toward_threshold(&self) -> bool {
        !matches!(self, IncidentType::SystemNote)
    }
}

impl fmt::Display for IncidentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IncidentType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown incident type: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityIncident {
    pub id: String,
    pub student_id: String,
    pub exam_id: String,
    pub incident_type: IncidentType,
    pub details: serde_json::Value,
    pub timestamp: i64,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub caused_suspension: bool,
    pub handled_by_payment: bool,
    pub handled_at: Option<i64>,
    pub suspension_removal_payment_ref: Option<String>,
}

/// Incident as submitted to the store, before it gets an id and timestamp.
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub student_id: String,
    pub exam_id: String,
    pub incident_type: IncidentType,
    pub details: serde_json::Value,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl NewIncident {
    pub fn into_incident(self, id: String, timestamp: i64) -> SecurityIncident {
        SecurityIncident {
            id,
            student_id: self.student_id,
            exam_id: self.exam_id,
            incident_type: self.incident_type,
            details: self.details,
            timestamp,
            user_agent: self.user_agent,
            ip_address: self.ip_address,
            caused_suspension: false,
            handled_by_payment: false,
            handled_at: None,
            suspension_removal_payment_ref: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamSuspension {
    pub id: String,
    pub student_id: String,
    pub exam_id: String,
    pub incidents: Vec<String>,
    pub reason: String,
    pub suspension_time: i64,
    pub reviewed_by_admin: bool,
    pub admin_notes: Option<String>,
    pub reviewed_at: Option<i64>,
    pub reviewed_by: Option<String>,
    pub removed: bool,
    pub removed_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Created,
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Created => "created",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(PaymentStatus::Created),
            "pending" => Ok(PaymentStatus::Pending),
            "success" => Ok(PaymentStatus::Success),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(format!("unknown payment status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    /// Pays off an active suspension.
    Suspended,
    /// Buys extra exam attempts.
    MaxAttempts,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::Suspended => "suspended",
            PaymentType::MaxAttempts => "max_attempts",
        }
    }
}

impl FromStr for PaymentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "suspended" => Ok(PaymentType::Suspended),
            "max_attempts" => Ok(PaymentType::MaxAttempts),
            other => Err(format!("unknown payment type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub student_id: String,
    pub exam_id: String,
    pub amount: i64,
    pub status: PaymentStatus,
    pub payment_type: PaymentType,
    pub gateway_order_id: String,
    pub gateway_payment_id: Option<String>,
    pub additional_attempts: Option<i32>,
    pub additional_attempts_granted: bool,
    pub additional_attempts_granted_at: Option<i64>,
    /// Set once this payment has lifted a suspension.
    pub reinstated_at: Option<i64>,
    pub created_at: i64,
}

/// Security and attempt settings carried by a batch. `None` means "not set on
/// the batch", so the global setting or the hardcoded default applies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSettings {
    pub batch_id: String,
    pub max_attempts: Option<i32>,
    pub max_security_incidents: Option<i32>,
    pub enable_auto_suspend: Option<bool>,
    pub additional_security_incidents_after_removal: Option<i32>,
    pub additional_attempts_after_payment: Option<i32>,
}

/// Snapshot of the global `security.*` setting documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    pub max_incidents: Option<i32>,
    pub enable_auto_suspend: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamResult {
    pub id: String,
    pub student_id: String,
    pub exam_id: String,
    pub score: f64,
    pub passed: bool,
    pub from_previous_payment_cycle: bool,
    pub submitted_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Admin,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Role::Student),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Identity handed over by the auth layer. Trusted as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub student_id: String,
    pub role: Role,
}

impl Actor {
    pub fn student(id: &str) -> Self {
        Actor { student_id: id.to_string(), role: Role::Student }
    }

    pub fn admin(id: &str) -> Self {
        Actor { student_id: id.to_string(), role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub page: u32,
    pub per_page: u32,
}

impl Page {
    pub const MAX_PER_PAGE: u32 = 100;

    pub fn new(page: u32, per_page: u32) -> Self {
        Page {
            page: page.max(1),
            per_page: per_page.clamp(1, Self::MAX_PER_PAGE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.per_page)
    }
}

impl Default for Page {
    fn default() -> Self {
        Page::new(1, 20)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

/// Optional (student, exam) narrowing for admin listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    pub student_id: Option<String>,
    pub exam_id: Option<String>,
}

impl ListFilter {
    pub fn matches(&self, student_id: &str, exam_id: &str) -> bool {
        self.student_id.as_deref().is_none_or(|s| s == student_id)
            && self.exam_id.as_deref().is_none_or(|e| e == exam_id)
    }
}
