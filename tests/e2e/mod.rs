//! End-to-End Tests for Resumable Uploadr
//!
//! Drives a real server over HTTP and checks what lands on disk and in the
//! record database.

pub mod auth_flow;
pub mod client_flow;
pub mod common;
pub mod concat_flow;
pub mod error_scenarios;
pub mod load_test;
pub mod upload_flow;
