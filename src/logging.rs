// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::flexi_logger::{
    Logger,
    LoggerHandle,
};
use ::once_cell::sync::OnceCell;
use ::std::sync::Once;

//==============================================================================
// Static Variables
//==============================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

/// Keeps the logger alive for the lifetime of the process.
static LOG_HANDLE: OnceCell<LoggerHandle> = OnceCell::new();

//==============================================================================
// Standalone Functions
//==============================================================================

/// Initializes logging features. Log level is driven by the RUST_LOG
/// environment variable and defaults to `info`.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        if let Ok(logger) = Logger::try_with_env_or_str("info") {
            if let Ok(handle) = logger.start() {
                let _ = LOG_HANDLE.set(handle);
            }
        }
    });
}
