// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for captain: partitioning test files across CI workers, retrying failed
//! tests, and quarantining tests that are known to fail intermittently.
//!
//! The entry points are [`partition::Partitioner`] for the `partition` command, and
//! [`suite::SuiteRunner`] for running a suite end to end.

pub mod artifacts;
pub mod backend;
pub mod command;
pub mod config;
pub mod errors;
pub mod file_glob;
mod helpers;
pub mod identity;
pub mod parser;
pub mod partition;
pub mod retry;
pub mod suite;

pub use helpers::plural;
