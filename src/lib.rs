//! Redis-backed job queues and bounded worker pools for call post-processing, analytics and
//! outbound integrations.

pub mod application;
pub mod config;
pub mod connection;
pub mod handlers;
pub mod models;
pub mod service;
pub mod store;
