// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Partition test files across CI workers, retry failed tests, and quarantine tests that are
//! known to fail intermittently.
//!
//! This crate is the `captain` binary. The logic lives in `captain-runner`.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod helpers;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::OutputWriter;
