//! Tollgate - Per-Organization Admission Control
//!
//! This crate implements the admission-control layer of an LLM request
//! gateway. Every inbound request is counted against its organization's
//! fixed-window budget in a shared counter store, so all gateway processes
//! behind a load balancer reach the same decision without coordinating with
//! each other.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
