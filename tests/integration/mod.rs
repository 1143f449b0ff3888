//! Integration test suite for braid.
//!
//! These tests drive the coordinator end to end against a scripted
//! producer, so no generation backend is needed.
//!
//! # Test Categories
//!
//! - `scenarios`: Reference graphs run to completion
//! - `parallel_units`: Concurrency bounds, failure policies, data flow
//! - `recovery`: Cancellation, checkpoints and resume
//! - `properties`: Property tests for ordering, digests and quality


mod parallel_units;
mod properties;
mod recovery;
