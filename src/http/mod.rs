//! HTTP adapter: applies the rate limiter to every inbound request.

mod middleware;
mod server;

pub use middleware::{rate_limit, RejectionBody, HEADER_REMAINING, HEADER_RESET};
pub use server::{router, HttpServer};
