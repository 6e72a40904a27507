//! Glider - Distributed Rate Limiting Service
//!
//! This crate implements a sliding-window rate limiter shared by any number
//! of service instances. Each instance answers from local caches, batches its
//! writes to a shared store, and learns about bans set elsewhere through
//! pub/sub.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
