use crate::state::AppState;
use actix_web::{web, HttpResponse};

pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "connections": state.hub.connection_count(),
        "ready": state.is_ready(),
    }))
}

pub async fn liveness() -> HttpResponse {
    HttpResponse::Ok().finish()
}

pub async fn readiness(state: web::Data<AppState>) -> HttpResponse {
    if state.is_ready() {
        HttpResponse::Ok().finish()
    } else {
        HttpResponse::ServiceUnavailable().finish()
    }
}
