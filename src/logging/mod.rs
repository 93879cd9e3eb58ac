// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Compile-time configurable logging system.
//!
//! Four severity levels — `zg_debug!`, `zg_info!`, `zg_warn!`, `zg_error!` —
//! that expand to no-ops unless the `logging` feature is enabled, backed by a
//! pluggable [`Output`] destination. Ambient infrastructure failures (socket
//! bind/join/connect/recv errors) log through the ordinary `log` crate facade
//! instead (see `assembly`), since those are always worth surfacing; this
//! module is for protocol-level diagnostics — malformed packets, version
//! mismatches — where a caller needs to suppress repeats explicitly rather
//! than rely on an external subscriber's own throttling.

#[cfg(feature = "logging")]
pub mod logger;
#[cfg(feature = "logging")]
mod output;

#[cfg(feature = "logging")]
pub use logger::{flush_logger, init_logger};
#[cfg(feature = "logging")]
pub use output::{ConsoleOutput, FileOutput, LogLevel, Output};

mod rate_limiter;
pub use rate_limiter::RateLimiter;

/// Debug-level log message. Compiles to nothing unless `logging` is enabled.
#[macro_export]
#[cfg(feature = "logging")]
macro_rules! zg_debug {
    ($($arg:tt)*) => {
        let _ = $crate::logging::logger::log_message(
            $crate::logging::LogLevel::Debug,
            &format!($($arg)*),
        );
    };
}

/// Info-level log message. Compiles to nothing unless `logging` is enabled.
#[macro_export]
#[cfg(feature = "logging")]
macro_rules! zg_info {
    ($($arg:tt)*) => {
        let _ = $crate::logging::logger::log_message(
            $crate::logging::LogLevel::Info,
            &format!($($arg)*),
        );
    };
}

/// Warning-level log message. Compiles to nothing unless `logging` is enabled.
#[macro_export]
#[cfg(feature = "logging")]
macro_rules! zg_warn {
    ($($arg:tt)*) => {
        let _ = $crate::logging::logger::log_message(
            $crate::logging::LogLevel::Warning,
            &format!($($arg)*),
        );
    };
}

/// Error-level log message. Compiles to nothing unless `logging` is enabled.
#[macro_export]
#[cfg(feature = "logging")]
macro_rules! zg_error {
    ($($arg:tt)*) => {
        let _ = $crate::logging::logger::log_message(
            $crate::logging::LogLevel::Error,
            &format!($($arg)*),
        );
    };
}

// The `if false` arm still type-checks its arguments (so callers never see a
// bogus "unused variable" warning from a value only used in a log line) but
// is unreachable, so the formatting never actually runs.

#[macro_export]
#[cfg(not(feature = "logging"))]
macro_rules! zg_debug {
    ($($arg:tt)*) => {
        if false { let _ = format!($($arg)*); }
    };
}

#[macro_export]
#[cfg(not(feature = "logging"))]
macro_rules! zg_info {
    ($($arg:tt)*) => {
        if false { let _ = format!($($arg)*); }
    };
}

#[macro_export]
#[cfg(not(feature = "logging"))]
macro_rules! zg_warn {
    ($($arg:tt)*) => {
        if false { let _ = format!($($arg)*); }
    };
}

#[macro_export]
#[cfg(not(feature = "logging"))]
macro_rules! zg_error {
    ($($arg:tt)*) => {
        if false { let _ = format!($($arg)*); }
    };
}

/// Call-stack entry trace, active only when both `logging` and `trace` are
/// enabled. Compiles to nothing otherwise.
#[macro_export]
#[cfg(all(feature = "logging", feature = "trace"))]
macro_rules! zg_trace {
    ($fn_name:expr) => {
        let _ = $crate::logging::logger::trace_entry($fn_name);
    };
}

/// No-op trace macro (when the `trace` feature is disabled).
#[macro_export]
#[cfg(not(all(feature = "logging", feature = "trace")))]
macro_rules! zg_trace {
    ($fn_name:expr) => {};
}
