//! Logging macros that set target to "mysql_auth_proxy" for all log calls.
//!
//! Without an explicit target, tracing uses the full module path
//! (e.g., "mysql_auth_proxy::users::manager"), creating overly verbose
//! logger names for embedders that map targets to their own logger tree.
//! These macros ensure all logs from this crate use a single
//! "mysql_auth_proxy" target.

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "mysql_auth_proxy", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "mysql_auth_proxy", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "mysql_auth_proxy", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "mysql_auth_proxy", $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "mysql_auth_proxy", $($arg)*) };
}

/// Like `warn!`, but suppressed by the global log throttle when the same
/// call site floods. The threshold-crossing emit carries a suffix telling
/// the reader how long similar messages will be dropped.
macro_rules! throttled_warn {
    ($($arg:tt)*) => {{
        let throttle = $crate::throttle::global();
        match throttle.status(file!(), line!()) {
            $crate::throttle::Suppression::NotSuppressed => warn!($($arg)*),
            $crate::throttle::Suppression::Suppressed => warn!(
                "{} (subsequent similar messages suppressed for {} ms)",
                format_args!($($arg)*),
                throttle.suppress_ms()
            ),
            $crate::throttle::Suppression::StillSuppressed => {}
        }
    }};
}

