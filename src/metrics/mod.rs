//! Metrics module for sample smoothing.

pub mod smoothing;

pub use smoothing::RollingAverage;
