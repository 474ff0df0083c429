//! Module containing HTTP handlers. Mapping to these from various routes is configured in
//! `callqueue-server.rs`.

use actix_web::error::InternalError;
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use log::warn;
use serde::Serialize;

use crate::models::{QueueError, Response};
use crate::service::Reply;

pub mod health;
pub mod job;
pub mod metrics;
pub mod queue;

/// HTTP status a failed operation is reported with.
pub fn status_for(err: &QueueError) -> StatusCode {
    match err {
        QueueError::Validation(_) => StatusCode::BAD_REQUEST,
        QueueError::Conflict(_) => StatusCode::CONFLICT,
        QueueError::NoSuchJob(_) => StatusCode::NOT_FOUND,
        QueueError::RedisConnection(_) | QueueError::Closed(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// JSON body extractor config. Bodies that are too large or not valid JSON are answered with
/// the envelope.
pub fn json_config(limit: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(limit)
        .error_handler(|err, req| rejected(req, err))
}

/// Query string extractor config, e.g. `?priority=300` is answered with the envelope.
pub fn query_config() -> web::QueryConfig {
    web::QueryConfig::default().error_handler(|err, req| rejected(req, err))
}

pub fn path_config() -> web::PathConfig {
    web::PathConfig::default().error_handler(|err, req| rejected(req, err))
}

/// Turn an extractor failure into an enveloped response with the extractor's own status.
fn rejected<E>(req: &HttpRequest, err: E) -> actix_web::Error
where
    E: ResponseError + 'static,
{
    let body: Response<()> = Response::err(err.to_string());
    warn!(
        "[request:{}] {} {} rejected: {}",
        body.request_id,
        req.method(),
        req.path(),
        err
    );
    let response = HttpResponse::build(err.status_code()).json(body);
    InternalError::from_response(err, response).into()
}

/// Respond with the reply's envelope, using `success` as the status unless the operation failed.
fn reply<T: Serialize>(success: StatusCode, reply: Reply<T>) -> HttpResponse {
    let status = reply.error.as_ref().map_or(success, status_for);
    HttpResponse::build(status).json(reply.response)
}
