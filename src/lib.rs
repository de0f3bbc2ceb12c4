//! Turnstile - fixed-window rate limiting gateway
//!
//! This crate admits or rejects requests per identity (client address or
//! credential token). Each identity gets a one second counting window; an
//! identity that exceeds its limit is blocked for a configurable cool-down.
//! State lives either in process memory or in Redis, behind the same
//! [`storage::Storage`] trait.

pub mod config;
pub mod deadline;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod storage;
