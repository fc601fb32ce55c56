//! Helmet classification engine
//!
//! Contains the multi-frame fusion of the external classifier.

mod fusion;

#[cfg(test)]
pub use fusion::MockFrameClassifier;
pub use fusion::{decide, ClassTally, FrameClassifier, FusionEngine, FusionResult, TiePolicy};
