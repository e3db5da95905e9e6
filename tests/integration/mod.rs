//! Integration test suite for the conductor runtime.
//!
//! These tests drive a real engine over the in-memory store with a
//! scripted reasoning worker, from submission to terminal state.
//!
//! # Test Categories
//!
//! - `scenarios`: agent loop, process execution and sub-task fan-out
//! - `safety`: consecutive-call ceilings, concurrency, holds and stepping
//! - `cancellation`: cancel, deadlines and isolation between trees
//! - `replay`: event log replay determinism
//!
//! # CI Compatibility
//!
//! No test talks to a real model; every worker reply is scripted.

mod fixtures;

mod cancellation;
mod replay;
mod safety;
mod scenarios;
