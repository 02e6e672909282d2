//! # revkb Testkit
//!
//! Test utilities for revkb.
//!
//! This crate provides:
//! - Test fixtures, a demo schema and knowledge base helpers
//! - Property-based test generators using proptest
//! - A history harness checking every past revision against a model
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use revkb_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_knowledge_base() {
//!     with_temp_kb(|kb| {
//!         let ctx = kb.begin_transaction("ada").unwrap();
//!         let person = create_person(&ctx, "ada");
//!         // ... test operations
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
