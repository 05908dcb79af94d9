//! Core types for fifostack
//!
//! This crate provides the error vocabulary and request identifiers shared by
//! the queue engine and the server binary.

pub mod error;
pub mod request_id;

pub use error::{AwsError, ErrorCode};
pub use request_id::RequestId;
