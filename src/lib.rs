//! Tollgate - Request Admission Gate
//!
//! This crate implements an HTTP admission gate that rate limits callers by
//! token or network address. Window counters and block flags live in a
//! shared counter store (Redis in production), so any number of gate
//! instances can run side by side without process-local state.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
