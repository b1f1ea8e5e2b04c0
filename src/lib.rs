//! Basis-Band Backend Library
//!
//! Minute-level DEX/CEX basis-band feature pipeline and latent state estimator.
//! Exposes modules for use by the `feature_run` binary and tests.

pub mod estimator;
pub mod pipeline;
