//! Integration tests for phaselock acceptance testing.

mod cancellation_test;
mod common;
mod drift_test;
mod failure_test;
