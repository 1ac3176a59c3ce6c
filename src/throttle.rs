//! Duplicate log message suppression.
//!
//! Repeated error/warning emits from the same call site within a short
//! window are collapsed: once a site has logged `count_threshold` times
//! inside `window_ms`, further emits are dropped until `suppress_ms` has
//! passed, after which the counter resets. A message that is logged 10
//! times in 1 second will be suppressed for 10 seconds under the defaults.
//!
//! The registry is keyed by call site: the address of the `file!()`
//! string literal plus the line number. File literals are interned by the
//! compiler, so pointer identity distinguishes sites without hashing long
//! path strings.

use std::sync::OnceLock;
use std::time::Instant;

use dashmap::DashMap;

/// Throttling parameters. Setting any field to zero disables throttling.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    /// How many emits a site may make within `window_ms` before suppression.
    pub count_threshold: usize,
    /// Length of the counting window in milliseconds.
    pub window_ms: u64,
    /// How long emits are dropped once the threshold is crossed.
    pub suppress_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            count_threshold: 10,
            window_ms: 1000,
            suppress_ms: 10000,
        }
    }
}

/// Verdict for a single emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    /// Emit normally.
    NotSuppressed,
    /// Threshold crossed on this emit; emit once more with a suffix
    /// announcing the suppression.
    Suppressed,
    /// Drop silently.
    StillSuppressed,
}

/// Call-site identity: interned file literal address + line number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SiteKey {
    file: usize,
    line: u32,
}

#[derive(Debug)]
struct SiteStats {
    /// When the site first emitted in the current window.
    first_ms: u64,
    /// Emits seen in the current window.
    count: usize,
}

impl SiteStats {
    fn update(&mut self, now_ms: u64, t: &ThrottleConfig) -> Suppression {
        self.count += 1;

        if self.count < t.count_threshold {
            Suppression::NotSuppressed
        } else if self.count == t.count_threshold {
            if now_ms - self.first_ms < t.window_ms {
                Suppression::Suppressed
            } else {
                // The flooding situation is analyzed window by window; a
                // flood straddling two windows without filling either goes
                // undetected, but then it was a spike and stops anyway.
                self.first_ms = now_ms;
                self.count = 1;
                Suppression::NotSuppressed
            }
        } else if now_ms - self.first_ms < t.window_ms + t.suppress_ms {
            Suppression::StillSuppressed
        } else {
            self.first_ms = now_ms;
            self.count = 1;
            Suppression::NotSuppressed
        }
    }
}

/// Registry of emit sites and their suppression state.
pub struct LogThrottle {
    config: ThrottleConfig,
    epoch: Instant,
    sites: DashMap<SiteKey, SiteStats>,
}

impl LogThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            sites: DashMap::new(),
        }
    }

    /// The configured suppression period, for use in emitted messages.
    pub fn suppress_ms(&self) -> u64 {
        self.config.suppress_ms
    }

    /// Record an emit from `(file, line)` and return its verdict.
    ///
    /// `file` must be a compile-time literal (`file!()`): identity is the
    /// literal's address, not its contents.
    pub fn status(&self, file: &'static str, line: u32) -> Suppression {
        let t = self.config;
        if t.count_threshold == 0 || t.window_ms == 0 || t.suppress_ms == 0 {
            return Suppression::NotSuppressed;
        }

        let key = SiteKey {
            file: file.as_ptr() as usize,
            line,
        };
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let mut stats = self.sites.entry(key).or_insert_with(|| SiteStats {
            first_ms: now_ms,
            count: 0,
        });
        stats.update(now_ms, &t)
    }
}

static GLOBAL: OnceLock<LogThrottle> = OnceLock::new();

/// The process-wide throttle used by `throttled_warn!`/`throttled_error!`.
pub fn global() -> &'static LogThrottle {
    GLOBAL.get_or_init(|| LogThrottle::new(ThrottleConfig::default()))
}

/// Install a non-default configuration for the global throttle.
///
/// Returns false if logging has already gone through the throttle and the
/// default configuration is in place.
pub fn init_global(config: ThrottleConfig) -> bool {
    GLOBAL.set(LogThrottle::new(config)).is_ok()
}
