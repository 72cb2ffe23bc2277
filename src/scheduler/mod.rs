// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

mod entry;
mod hooks;
#[allow(clippy::module_inception)]
mod scheduler;

pub use self::{
    entry::{
        Callback,
        Runnable,
        Tid,
    },
    hooks::SchedulerHooks,
    scheduler::Scheduler,
};
