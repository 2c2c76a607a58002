//! Operator-facing pieces of the `cadence` binary.

pub mod supervisor;
pub mod telemetry;
