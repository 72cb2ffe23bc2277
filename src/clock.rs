// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::std::time::{
    SystemTime,
    UNIX_EPOCH,
};

//==============================================================================
// Standalone Functions
//==============================================================================

/// Returns the current wall-clock time in milliseconds. Timers are anchored to
/// this clock on purpose: wall-clock time can move backwards, and the timer
/// set detects that rollback instead of stalling forever.
pub fn now_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as u64,
        // The host clock is before the epoch; report zero and let rollback
        // detection sort it out.
        Err(_) => 0,
    }
}
