//! `erpbus-core`: identity primitives shared by every bus component.
//!
//! This crate is pure data: no IO, no async, no transport concerns.

pub mod error;
pub mod id;
pub mod service;

pub use error::{CoreError, CoreResult};
pub use id::EventId;
pub use service::ServiceName;
