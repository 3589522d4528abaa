use actix_web::{http::StatusCode, web, HttpRequest, HttpResponse};
use serde::Deserialize;

use examguard::model::{ListFilter, Page};

use crate::handlers::{actor_or_reject, run_blocking, Services};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub student_id: Option<String>,
    pub exam_id: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl ListQuery {
    fn split(self) -> (ListFilter, Page) {
        let defaults = Page::default();
        let page = Page::new(
            self.page.unwrap_or(defaults.page),
            self.per_page.unwrap_or(defaults.per_page),
        );
        (ListFilter { student_id: self.student_id, exam_id: self.exam_id }, page)
    }
}

#[derive(Deserialize, Default)]
pub struct ReviewRequest {
    pub notes: Option<String>,
}

pub async fn list_incidents(
    services: web::Data<Services>,
    req: HttpRequest,
    query: web::Query<ListQuery>,
) -> HttpResponse {
    let actor = actor_or_reject!(req);
    let (filter, page) = query.into_inner().split();
    let services = services.into_inner();
    run_blocking(StatusCode::OK, move || services.admin.list_incidents(&actor, &filter, page)).await
}

pub async fn list_suspensions(
    services: web::Data<Services>,
    req: HttpRequest,
    query: web::Query<ListQuery>,
) -> HttpResponse {
    let actor = actor_or_reject!(req);
    let (filter, page) = query.into_inner().split();
    let services = services.into_inner();
    run_blocking(StatusCode::OK, move || services.admin.list_suspensions(&actor, &filter, page)).await
}

/// Lift a suspension without payment. The student's incidents stay
/// unhandled; the post-removal allowance applies from now on.
pub async fn remove_suspension(
    services: web::Data<Services>,
    req: HttpRequest,
    path: web::Path<String>,
    body: Option<web::Json<ReviewRequest>>,
) -> HttpResponse {
    let actor = actor_or_reject!(req);
    let suspension_id = path.into_inner();
    let notes = body.map(|b| b.into_inner()).unwrap_or_default().notes;
    let services = services.into_inner();
    run_blocking(StatusCode::OK, move || {
        services.admin.remove_suspension(&actor, &suspension_id, notes.as_deref())
    })
    .await
}

pub async fn keep_suspension(
    services: web::Data<Services>,
    req: HttpRequest,
    path: web::Path<String>,
    body: Option<web::Json<ReviewRequest>>,
) -> HttpResponse {
    let actor = actor_or_reject!(req);
    let suspension_id = path.into_inner();
    let notes = body.map(|b| b.into_inner()).unwrap_or_default().notes;
    let services = services.into_inner();
    run_blocking(StatusCode::OK, move || {
        services.admin.keep_suspension(&actor, &suspension_id, notes.as_deref())
    })
    .await
}
