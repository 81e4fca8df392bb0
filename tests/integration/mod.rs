//! Integration test suite for wavefront.
//!
//! These tests drive real git repositories and real `sh` subprocesses
//! standing in for the coding agent, so they run offline.
//!
//! # Test Categories
//!
//! - `planning`: plan files to waves
//! - `execution`: full runs through the orchestrator (Ralph Loop, ordered
//!   merges, conflicts, leases, the board)
//! - `cli`: the `wavefront` binary

mod fixtures;

mod cli;
mod execution;
mod planning;
