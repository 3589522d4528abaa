use std::fmt;

/// Failures reported by a storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    Duplicate,
    NotFound,
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Duplicate => write!(f, "Uniqueness constraint violated"),
            StoreError::NotFound => write!(f, "Record not found"),
            StoreError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug, Clone, PartialEq)]
pub enum IntegrityError {
    Store(StoreError),
    PaymentNotVerified,
    PaymentNotFound,
    PaymentNotEligible(String),
    InvalidSuspensionRemoval,
    InvalidIncidentType(String),
    Suspended,
    AttemptsExhausted { used: i64, total_allowed: i64 },
    AlreadyPassed,
    Forbidden,
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityError::Store(e) => write!(f, "{}", e),
            IntegrityError::PaymentNotVerified => write!(f, "Payment could not be verified"),
            IntegrityError::PaymentNotFound => write!(f, "Payment not found"),
            IntegrityError::PaymentNotEligible(why) => write!(f, "Payment not allowed: {}", why),
            IntegrityError::InvalidSuspensionRemoval => {
                write!(f, "Suspension not found or already removed")
            }
            IntegrityError::InvalidIncidentType(t) => write!(f, "Invalid incident type: {}", t),
            IntegrityError::Suspended => write!(f, "Exam access suspended"),
            IntegrityError::AttemptsExhausted { used, total_allowed } => write!(
                f,
                "Maximum attempts reached ({} of {})",
                used, total_allowed
            ),
            IntegrityError::AlreadyPassed => write!(f, "Exam already passed"),
            IntegrityError::Forbidden => write!(f, "Admin privileges required"),
        }
    }
}

impl std::error::Error for IntegrityError {}

impl From<StoreError> for IntegrityError {
    fn from(e: StoreError) -> Self {
        IntegrityError::Store(e)
    }
}

impl IntegrityError {
    pub fn status_code(&self) -> u16 {
        match self {
            IntegrityError::Store(StoreError::NotFound) => 404,
            IntegrityError::Store(StoreError::Duplicate) => 409,
            IntegrityError::Store(StoreError::Unavailable(_)) => 503,
            IntegrityError::PaymentNotVerified => 400,
            IntegrityError::PaymentNotFound => 404,
            IntegrityError::PaymentNotEligible(_) => 409,
            IntegrityError::InvalidSuspensionRemoval => 404,
            IntegrityError::InvalidIncidentType(_) => 400,
            IntegrityError::Suspended |
            IntegrityError::AttemptsExhausted { .. } |
            IntegrityError::AlreadyPassed |
            IntegrityError::Forbidden => 403,
        }
    }

    /// Log the error at a level matching its severity
    pub fn log_event(&self) {
        match self {
            IntegrityError::Store(e) => {
                tracing::error!("Storage failure: {}", e);
            }
            IntegrityError::PaymentNotVerified => {
                tracing::warn!("Payment signature rejected - possible forged confirmation");
            }
            IntegrityError::Forbidden => {
                tracing::warn!("Non-admin actor attempted an admin operation");
            }
            other => {
                tracing::debug!("Request refused: {}", other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(IntegrityError::PaymentNotVerified.status_code(), 400);
        assert_eq!(IntegrityError::InvalidSuspensionRemoval.status_code(), 404);
        assert_eq!(IntegrityError::Suspended.status_code(), 403);
        assert_eq!(
            IntegrityError::AttemptsExhausted { used: 2, total_allowed: 2 }.status_code(),
            403
        );
        assert_eq!(IntegrityError::from(StoreError::Unavailable("down".into())).status_code(), 503);
    }

    #[test]
    fn display_carries_details() {
        let e = IntegrityError::AttemptsExhausted { used: 3, total_allowed: 3 };
        assert_eq!(e.to_string(), "Maximum attempts reached (3 of 3)");
    }
}
