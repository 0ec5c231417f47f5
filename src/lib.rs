//! Quotaguard - Distributed Request Rate Limiting
//!
//! This crate throttles how many operations a caller may perform per time
//! window. Buckets live either in process memory or in Redis, and the same
//! enforcement semantics apply to both. A tower middleware layers a burst
//! policy on top of path-selected sustained policies and fails open when the
//! backend misbehaves.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
