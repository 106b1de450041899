use crate::unix_now;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Rolling failure window, anchored at the first failure.
const WINDOW_SECS: u64 = 600;
/// Failures tolerated inside the window; one more locks the account.
const MAX_FAILURES: u32 = 3;
/// Login-history ring size.
const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptKind {
    Basic,
    Bearer,
    Code,
    FailPassword,
    FailCode,
    FailUnknown,
    FailLocked,
}

impl AttemptKind {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            AttemptKind::FailPassword
                | AttemptKind::FailCode
                | AttemptKind::FailUnknown
                | AttemptKind::FailLocked
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub user: String,
    pub kind: AttemptKind,
    pub at: u64,
}

struct Window {
    first: u64,
    count: u32,
}

/// Thread-safe login-attempt tracker.
///
/// More than [`MAX_FAILURES`] failures for one username inside a rolling
/// ten-minute window locks the account until the window expires; any
/// success clears it. Recent attempts are retained for the info endpoint.
pub struct Throttle {
    windows: DashMap<String, Window>,
    history: Mutex<VecDeque<Attempt>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self { windows: DashMap::new(), history: Mutex::new(VecDeque::new()) }
    }

    /// True when the user has run out of tolerated failures and the window
    /// is still open. Expired windows are dropped on consultation.
    pub fn locked(&self, user: &str) -> bool {
        let now = unix_now();
        if let Some(window) = self.windows.get(user) {
            if now >= window.first + WINDOW_SECS {
                drop(window);
                self.windows.remove(user);
                return false;
            }
            return window.count > MAX_FAILURES;
        }
        false
    }

    /// Record an attempt. Failures bump (or re-anchor) the user's window;
    /// a locked-out attempt advances the window; success clears it.
    pub fn record(&self, user: &str, kind: AttemptKind) {
        let now = unix_now();

        if kind.is_failure() {
            let mut entry = self
                .windows
                .entry(user.to_string())
                .or_insert(Window { first: now, count: 0 });
            if now >= entry.first + WINDOW_SECS {
                entry.first = now;
                entry.count = 0;
            } else if kind == AttemptKind::FailLocked {
                entry.first = now;
            }
            entry.count += 1;
        } else {
            self.windows.remove(user);
        }

        let mut history = self.history.lock().expect("history lock");
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(Attempt { user: user.to_string(), kind, at: now });
    }

    /// Recent attempts, oldest first, for the info endpoint.
    pub fn history(&self) -> Value {
        let history = self.history.lock().expect("history lock");
        serde_json::to_value(history.iter().collect::<Vec<_>>()).unwrap_or(Value::Null)
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new()
    }
}
