/// HTTP handlers for the live-update service
pub mod events;
pub mod health;
pub mod processed;
pub mod sns;
pub mod upload;

pub use events::events;
pub use health::{health, liveness, readiness};
pub use processed::list_processed;
pub use sns::sns_processed;
pub use upload::upload;

use actix_web::web;

/// Register every route on an `App`
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/upload", web::post().to(upload))
        .route("/events", web::get().to(events))
        .route("/sns/processed", web::post().to(sns_processed))
        .route("/processed", web::get().to(list_processed))
        .route("/api/v1/health", web::get().to(health))
        .route("/api/v1/health/live", web::get().to(liveness))
        .route("/api/v1/health/ready", web::get().to(readiness))
        .route("/metrics", web::get().to(crate::metrics::serve_metrics));
}
