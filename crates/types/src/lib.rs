//! Shared type definitions for Stepline.
//!
//! [`pipeline`] holds the authored document schema and [`plan`] holds the
//! concrete job instances and staged plans derived from it.

pub mod pipeline;
pub mod plan;

pub use pipeline::*;
pub use plan::*;
