//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `peril-pubsub` crate.
//!
//! This module centralizes the error taxonomy and the logging setup so that
//! the library and the `peril` binary report failures the same way.

pub mod error;
pub mod logging;
