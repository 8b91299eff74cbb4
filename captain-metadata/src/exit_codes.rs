// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `captain` failures.
///
/// `captain run` passes through the exit code of the test command when tests fail. The codes
/// below are used when captain itself fails before or around the test command.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum CaptainExitCode {}

impl CaptainExitCode {
    /// No errors occurred and captain exited normally.
    pub const OK: i32 = 0;

    /// One or more tests failed, and the test command didn't report an exit code of its own.
    pub const TEST_RUN_FAILED: i32 = 1;

    /// A configuration issue was found while setting up a captain invocation.
    pub const SETUP_ERROR: i32 = 96;

    /// The invocation itself was invalid: for example, no command was provided.
    pub const INPUT_ERROR: i32 = 97;

    /// Captain encountered a state it should never be in. This is a bug in captain.
    pub const INTERNAL_ERROR: i32 = 98;

    /// An operating system operation failed: for example, a command could not be spawned.
    pub const SYSTEM_ERROR: i32 = 99;
}
