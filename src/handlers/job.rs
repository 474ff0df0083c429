//! HTTP handlers for job submission.
//!
//! The request body is the job's JSON payload. An optional `?priority=` query parameter
//! overrides the queue's default priority.

use actix_web::http::StatusCode;
use actix_web::{web, Responder};
use serde::Deserialize;
use serde_json::Value;

use super::reply;
use crate::service::JobService;

#[derive(Debug, Default, Deserialize)]
pub struct SubmitParams {
    priority: Option<u8>,
}

/// Handles `POST /calls/{call_sid}/{action}` requests.
///
/// # Returns
///
/// * 201 - job queued, envelope data contains the job ID
/// * 400 - unknown action, payload missing required fields, invalid priority, or a body that
///   isn't JSON
/// * 409 - a job with the same ID already exists
/// * 413 - body larger than the configured limit
/// * 503 - Redis connection unavailable, or the queue is shutting down
pub async fn add_call(
    path: web::Path<(String, String)>,
    params: web::Query<SubmitParams>,
    payload: web::Json<Value>,
    data: web::Data<JobService>,
) -> impl Responder {
    let (call_sid, action) = path.into_inner();
    let result = data
        .add_call_to_queue(&call_sid, &action, payload.into_inner(), params.priority)
        .await;
    reply(StatusCode::CREATED, result)
}

/// Handles `POST /analytics/{job_type}` requests.
///
/// Same responses as `add_call`.
pub async fn add_analytics(
    path: web::Path<String>,
    params: web::Query<SubmitParams>,
    payload: web::Json<Value>,
    data: web::Data<JobService>,
) -> impl Responder {
    let result = data
        .add_analytics_job(&path, payload.into_inner(), params.priority)
        .await;
    reply(StatusCode::CREATED, result)
}

/// Handles `POST /integrations/{job_type}` requests.
pub async fn add_integration(
    path: web::Path<String>,
    params: web::Query<SubmitParams>,
    payload: web::Json<Value>,
    data: web::Data<JobService>,
) -> impl Responder {
    let result = data
        .add_integration_job(&path, payload.into_inner(), params.priority)
        .await;
    reply(StatusCode::CREATED, result)
}
