//! HTTP/REST API layer for stratum.
//!
//! Axum-based REST API at `/api/v1/` with the envelope response format and
//! CORS support. Callers are not authenticated; inbound webhooks verify
//! their own signatures.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
