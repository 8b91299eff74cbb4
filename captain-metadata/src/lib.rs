// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Machine-readable test result schema and exit codes for captain.
//!
//! The types in this crate are what captain reads from test result files and what it writes
//! back out once retries and quarantines have been applied.

mod exit_codes;
mod test_results;

pub use exit_codes::*;
pub use test_results::*;
