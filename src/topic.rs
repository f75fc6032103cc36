//! Topic handling module
//!
//! This module provides components for working with AMQP topic patterns:
//! parsing binding patterns into segments, compiling them into anchored
//! matchers and validating routing keys used for publishing.

// Submodules
pub mod error;
/// Binding pattern parsing and matching
pub mod topic_pattern;


// Re-export commonly used types for convenience
pub use error::RoutingKeyError;
// Re-export constants and validation utilities
pub use error::{limits, validation};
pub use topic_pattern::{TopicPattern, TopicPatternError, TopicPatternItem};
