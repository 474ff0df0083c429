//! Handler for queue metrics.

use actix_web::http::StatusCode;
use actix_web::{web, Responder};

use super::reply;
use crate::service::JobService;

/// Handles `GET /metrics` requests.
///
/// # Returns
///
/// * 200 - counters since startup plus live per-queue counts
/// * 500 - queue counts couldn't be read from Redis
/// * 503 - Redis connection unavailable, or metrics already shut down
pub async fn index(data: web::Data<JobService>) -> impl Responder {
    reply(StatusCode::OK, data.get_metrics().await)
}
