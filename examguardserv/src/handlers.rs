use actix_web::{http::StatusCode, web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};

use examguard::engine::{
    ExamSubmission, IncidentReport, OrderRequest, PaymentConfirmation, PaymentEvent,
};
use examguard::model::{Actor, IncidentType, Role};
use examguard::{IntegrityError, IntegrityServices};

use crate::db::SqliteStore;
use crate::verifier::{parse_webhook_event, GatewaySignatureVerifier};

pub type Services = IntegrityServices<SqliteStore, GatewaySignatureVerifier>;

pub const STUDENT_HEADER: &str = "X-Student-Id";
pub const ROLE_HEADER: &str = "X-User-Role";
pub const SIGNATURE_HEADER: &str = "X-Gateway-Signature";

fn json_error(status: StatusCode, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(serde_json::json!({ "error": message }))
}

pub fn error_response(e: &IntegrityError) -> HttpResponse {
    e.log_event();
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_error(status, &e.to_string())
}

/// Identity set by the upstream auth layer.
pub fn actor_from(req: &HttpRequest) -> Result<Actor, HttpResponse> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let Some(student_id) = header(STUDENT_HEADER) else {
        return Err(json_error(StatusCode::UNAUTHORIZED, "missing identity"));
    };
    let role = match header(ROLE_HEADER) {
        None => Role::Student,
        Some(raw) => match raw.parse::<Role>() {
            Ok(role) => role,
            Err(e) => {
                tracing::warn!("Rejected request with {}: {}", ROLE_HEADER, e);
                return Err(json_error(StatusCode::UNAUTHORIZED, "invalid role"));
            }
        },
    };
    Ok(Actor { student_id: student_id.to_string(), role })
}

/// Run an engine call on the blocking pool; the lock manager may sleep.
pub async fn run_blocking<T, F>(status: StatusCode, f: F) -> HttpResponse
where
    F: FnOnce() -> Result<T, IntegrityError> + Send + 'static,
    T: Serialize + Send + 'static,
{
    match web::block(f).await {
        Ok(Ok(value)) => HttpResponse::build(status).json(value),
        Ok(Err(e)) => error_response(&e),
        Err(e) => {
            tracing::error!("Blocking task failed: {:?}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

macro_rules! actor_or_reject {
    ($req:expr) => {
        match $crate::handlers::actor_from(&$req) {
            Ok(actor) => actor,
            Err(resp) => return resp,
        }
    };
}
pub(crate) use actor_or_reject;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentRequest {
    pub incident_type: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub user_agent: Option<String>,
}

pub async fn report_incident(
    services: web::Data<Services>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<IncidentRequest>,
) -> HttpResponse {
    let actor = actor_or_reject!(req);
    let exam_id = path.into_inner();
    let body = body.into_inner();

    let incident_type = match body.incident_type.parse::<IncidentType>() {
        Ok(t) => t,
        Err(_) => return error_response(&IntegrityError::InvalidIncidentType(body.incident_type)),
    };
    let user_agent = body.user_agent.or_else(|| {
        req.headers()
            .get(actix_web::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });
    let report = IncidentReport {
        incident_type,
        details: body.details,
        user_agent,
        ip_address: req.connection_info().realip_remote_addr().map(str::to_string),
    };

    let services = services.into_inner();
    run_blocking(StatusCode::OK, move || {
        services.suspensions.report_incident(&actor, &exam_id, report)
    })
    .await
}

pub async fn suspension_status(
    services: web::Data<Services>,
    req: HttpRequest,
    path: web::Path<String>,
) -> HttpResponse {
    let actor = actor_or_reject!(req);
    let exam_id = path.into_inner();
    let services = services.into_inner();
    run_blocking(StatusCode::OK, move || services.suspensions.status(&actor.student_id, &exam_id)).await
}

pub async fn start_exam(
    services: web::Data<Services>,
    req: HttpRequest,
    path: web::Path<String>,
) -> HttpResponse {
    let actor = actor_or_reject!(req);
    let exam_id = path.into_inner();
    let services = services.into_inner();
    run_blocking(StatusCode::OK, move || services.gate.authorize_start(&actor, &exam_id)).await
}

pub async fn submit_exam(
    services: web::Data<Services>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<ExamSubmission>,
) -> HttpResponse {
    let actor = actor_or_reject!(req);
    let exam_id = path.into_inner();
    let submission = body.into_inner();
    let services = services.into_inner();
    run_blocking(StatusCode::CREATED, move || services.gate.submit(&actor, &exam_id, &submission)).await
}

pub async fn attempts(
    services: web::Data<Services>,
    req: HttpRequest,
    path: web::Path<String>,
) -> HttpResponse {
    let actor = actor_or_reject!(req);
    let exam_id = path.into_inner();
    let services = services.into_inner();
    run_blocking(StatusCode::OK, move || services.quota.remaining(&actor.student_id, &exam_id)).await
}

pub async fn create_order(
    services: web::Data<Services>,
    req: HttpRequest,
    body: web::Json<OrderRequest>,
) -> HttpResponse {
    let actor = actor_or_reject!(req);
    let order = body.into_inner();
    let services = services.into_inner();
    run_blocking(StatusCode::CREATED, move || services.intake.open_order(&actor, &order)).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
}

pub async fn verify_payment(
    services: web::Data<Services>,
    req: HttpRequest,
    body: web::Json<VerifyRequest>,
) -> HttpResponse {
    let actor = actor_or_reject!(req);
    let body = body.into_inner();
    tracing::info!("Payment confirmation for order {} from student {}", body.order_id, actor.student_id);

    let confirmation = PaymentConfirmation {
        order_id: body.order_id,
        payment_id: body.payment_id,
        signature: body.signature,
    };
    let services = services.into_inner();
    run_blocking(StatusCode::OK, move || services.reinstatement.confirm(&confirmation)).await
}

/// Gateway callback. Authenticated by the body signature, not by identity
/// headers.
pub async fn payment_webhook(
    services: web::Data<Services>,
    verifier: web::Data<GatewaySignatureVerifier>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    let signature = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verifier.verify_webhook(&body, signature) {
        tracing::warn!("Rejected payment webhook with invalid signature");
        return json_error(StatusCode::BAD_REQUEST, "invalid signature");
    }

    let event = match parse_webhook_event(&body) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!("Malformed payment webhook: {}", e);
            return json_error(StatusCode::BAD_REQUEST, "malformed webhook payload");
        }
    };
    if let PaymentEvent::Ignored(kind) = &event {
        tracing::debug!("Ignoring webhook event {}", kind);
    }

    let services = services.into_inner();
    run_blocking(StatusCode::OK, move || {
        services.reinstatement.handle_event(&event).map(|outcome| {
            serde_json::json!({ "status": "ok", "outcome": outcome })
        })
    })
    .await
}
