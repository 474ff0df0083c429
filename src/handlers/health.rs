//! Defines handlers for health check HTTP endpoints.

use actix_web::{web, HttpResponse, Responder};
use serde::Serialize;

use crate::application::Lifecycle;
use crate::models::Response;
use crate::service::JobService;

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Serialize)]
struct Health {
    status: HealthStatus,
    lifecycle: Lifecycle,

    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Health {
    fn new_healthy(lifecycle: Lifecycle) -> Self {
        Health {
            status: HealthStatus::Healthy,
            lifecycle,
            error: None,
        }
    }

    fn new_from_error<S: Into<String>>(lifecycle: Lifecycle, err: S) -> Self {
        Health {
            status: HealthStatus::Unhealthy,
            lifecycle,
            error: Some(err.into()),
        }
    }
}

/// Handles `GET /health` requests.
///
/// Always 200, the envelope's `data.status` says whether Redis answered.
pub async fn index(data: web::Data<JobService>) -> impl Responder {
    let manager = data.manager();
    let lifecycle = manager.lifecycle();
    let health = match manager.health().await {
        Ok(()) if lifecycle == Lifecycle::Running => Health::new_healthy(lifecycle),
        Ok(()) => Health::new_from_error(lifecycle, format!("queue system is {}", lifecycle)),
        Err(err) => Health::new_from_error(lifecycle, err.to_string()),
    };
    HttpResponse::Ok().json(Response::ok(health))
}
