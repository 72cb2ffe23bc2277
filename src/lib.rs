// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A user-space cooperative concurrency runtime: fibers multiplexed over a
//! pool of OS worker threads, a deadline-ordered timer set, and an
//! epoll-driven I/O manager that turns would-block socket operations into
//! fiber suspension points.

#![deny(clippy::all)]

#[macro_use]
extern crate log;

::cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("weft requires Linux: the I/O manager is built on epoll");
    }
}

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod clock;
pub mod config;
pub mod fail;
pub mod fiber;
pub mod hook;
pub mod io;
pub mod logging;
pub mod pal;
pub mod scheduler;
pub mod timer;

pub use crate::{
    fail::Fail,
    fiber::{
        Fiber,
        FiberState,
        SharedFiber,
    },
    io::{
        Event,
        IoManager,
    },
    scheduler::{
        Runnable,
        Scheduler,
    },
    timer::{
        Timer,
        TimerManager,
    },
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equal, bailing out of the calling test
/// with a descriptive error otherwise.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {{
        let left = &$left;
        let right = &$right;
        if *left != *right {
            ::anyhow::bail!(
                "ensure_eq failed at {}:{}: `{:?}` != `{:?}`",
                file!(),
                line!(),
                left,
                right,
            );
        }
    }};
}

/// Ensures that two expressions are not equal, bailing out of the calling
/// test with a descriptive error otherwise.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr $(,)?) => {{
        let left = &$left;
        let right = &$right;
        if *left == *right {
            ::anyhow::bail!(
                "ensure_neq failed at {}:{}: `{:?}` == `{:?}`",
                file!(),
                line!(),
                left,
                right,
            );
        }
    }};
}
