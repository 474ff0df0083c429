//! HTTP handlers for `/queue/*` inspection endpoints.

use actix_web::http::StatusCode;
use actix_web::{web, Responder};
use serde::Deserialize;

use super::reply;
use crate::service::JobService;
use crate::store::DEFAULT_FAILED_LIMIT;

#[derive(Debug, Deserialize)]
pub struct FailedParams {
    limit: Option<usize>,
}

/// Handles `GET /queue/{name}/failed` requests.
///
/// # Returns
///
/// * 200 - terminally failed jobs, newest first (at most `?limit=`, default 100)
/// * 400 - unknown queue name
/// * 503 - Redis connection unavailable
pub async fn failed_jobs(
    path: web::Path<String>,
    params: web::Query<FailedParams>,
    data: web::Data<JobService>,
) -> impl Responder {
    let limit = params.limit.unwrap_or(DEFAULT_FAILED_LIMIT);
    reply(StatusCode::OK, data.failed_jobs(&path, limit).await)
}

/// Handles `GET /queue/{name}/job/{job_id}` requests.
///
/// # Returns
///
/// * 200 - everything stored about the job
/// * 400 - unknown queue name
/// * 404 - no job with given ID in this queue
/// * 503 - Redis connection unavailable
pub async fn job(path: web::Path<(String, String)>, data: web::Data<JobService>) -> impl Responder {
    let (queue_name, job_id) = path.into_inner();
    reply(StatusCode::OK, data.job(&queue_name, &job_id).await)
}
