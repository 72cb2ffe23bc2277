// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::fail::Fail;
use ::once_cell::sync::Lazy;
use ::parking_lot::{
    Mutex,
    RwLock,
};
use ::std::{
    fs::File,
    io::Read,
    sync::Arc,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Runtime tunables. These apply to every scheduler and I/O manager in the process.
mod runtime_config {
    pub const SECTION_NAME: &str = "runtime";
    // Default timeout for hooked connect() calls, in milliseconds.
    pub const TCP_CONNECT_TIMEOUT: &str = "tcp_connect_timeout";
    // Maximum number of events drained per epoll_wait call.
    pub const EPOLL_MAX_EVENTS: &str = "epoll_max_events";
    // Upper bound on a single idle epoll_wait, in milliseconds.
    pub const IDLE_WAIT_MS: &str = "idle_wait_ms";
}

/// Default timeout for hooked connect() calls, in milliseconds.
const DEFAULT_TCP_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Default number of events drained per epoll_wait call.
const DEFAULT_EPOLL_MAX_EVENTS: usize = 256;

/// Default upper bound on a single idle epoll_wait. Bounding the wait keeps
/// periodic clock-rollback checks from starving even when no timer is armed.
const DEFAULT_IDLE_WAIT_MS: u64 = 3000;

//======================================================================================================================
// Static Variables
//======================================================================================================================

static TCP_CONNECT_TIMEOUT: Lazy<Tunable<u64>> = Lazy::new(|| Tunable::new(DEFAULT_TCP_CONNECT_TIMEOUT_MS));
static EPOLL_MAX_EVENTS: Lazy<Tunable<usize>> = Lazy::new(|| Tunable::new(DEFAULT_EPOLL_MAX_EVENTS));
static IDLE_WAIT_MS: Lazy<Tunable<u64>> = Lazy::new(|| Tunable::new(DEFAULT_IDLE_WAIT_MS));

//======================================================================================================================
// Structures
//======================================================================================================================

/// A process-wide tunable value. Reads take the fast path; writers notify the
/// registered change listeners with the old and new values.
pub struct Tunable<T: Copy> {
    inner: Arc<TunableInner<T>>,
}

struct TunableInner<T: Copy> {
    value: RwLock<T>,
    listeners: Mutex<Vec<Box<dyn Fn(T, T) + Send + Sync>>>,
}

/// Runtime configuration loaded from a YAML document.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<T: Copy> Tunable<T> {
    fn new(value: T) -> Self {
        Self {
            inner: Arc::new(TunableInner {
                value: RwLock::new(value),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns the current value.
    pub fn get(&self) -> T {
        *self.inner.value.read()
    }

    /// Replaces the current value and notifies every registered listener with
    /// the old and new values.
    pub fn set(&self, new_value: T) {
        let old_value: T = {
            let mut value = self.inner.value.write();
            let old: T = *value;
            *value = new_value;
            old
        };
        for listener in self.inner.listeners.lock().iter() {
            listener(old_value, new_value);
        }
    }

    /// Registers a change listener invoked on every [Tunable::set].
    pub fn on_change<F: Fn(T, T) + Send + Sync + 'static>(&self, listener: F) {
        self.inner.listeners.lock().push(Box::new(listener));
    }
}

impl<T: Copy> Clone for Tunable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Associated functions for the runtime configuration object.
impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn from_file(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        let mut file: File = match File::open(config_path) {
            Ok(file) => file,
            Err(e) => return Err(Fail::new(e.raw_os_error().unwrap_or(libc::ENOENT), "cannot open config file")),
        };
        if file.read_to_string(&mut config_s).is_err() {
            return Err(Fail::new(libc::EIO, "cannot read config file"));
        }
        Self::from_yaml_str(&config_s)
    }

    /// Parses a YAML document into a [Config] object.
    pub fn from_yaml_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(_) => return Err(Fail::new(libc::EINVAL, "malformed config file")),
        };
        let config_obj: &Yaml = match &config[..] {
            &[ref c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "wrong number of config objects")),
        };
        Ok(Self(config_obj.clone()))
    }

    /// Pushes the values found in the `runtime` section into the process-wide
    /// tunables. Missing keys leave the current values untouched.
    pub fn apply(&self) {
        let section: &Yaml = &self.0[runtime_config::SECTION_NAME];
        if section.is_badvalue() {
            return;
        }
        if let Some(ms) = section[runtime_config::TCP_CONNECT_TIMEOUT].as_i64() {
            tcp_connect_timeout().set(ms as u64);
        }
        if let Some(n) = section[runtime_config::EPOLL_MAX_EVENTS].as_i64() {
            epoll_max_events().set(n as usize);
        }
        if let Some(ms) = section[runtime_config::IDLE_WAIT_MS].as_i64() {
            idle_wait_ms().set(ms as u64);
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Default timeout for hooked connect() calls, in milliseconds.
pub fn tcp_connect_timeout() -> &'static Tunable<u64> {
    &TCP_CONNECT_TIMEOUT
}

/// Maximum number of events drained per epoll_wait call.
pub fn epoll_max_events() -> &'static Tunable<usize> {
    &EPOLL_MAX_EVENTS
}

/// Upper bound on a single idle epoll_wait, in milliseconds.
pub fn idle_wait_ms() -> &'static Tunable<u64> {
    &IDLE_WAIT_MS
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
