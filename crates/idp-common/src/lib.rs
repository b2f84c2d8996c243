//! IDP Common Library
//!
//! Shared types, utilities, and error handling for the IDP project.
//!
//! # Overview
//!
//! This crate provides common functionality used across all IDP workspace members:
//!
//! - **Error Handling**: The `ImportError` taxonomy and result type
//! - **Logging**: Centralized tracing initialization
//! - **Checksums**: Content hashing for staged payloads and record keys

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{ImportError, Result};
