//! Error catalog and definitions for pushci
//!
//! Each subsystem has its own `thiserror` enum (`EventError`, `FetchError`,
//! `MaterializeError`, ...). Every variant maps onto a stable code from the
//! catalog through a `code()` method so job reports and logs carry the same
//! identifiers.

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};
