use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Rejections tolerated inside the sliding window before lockout.
const MAX_REJECTIONS: usize = 5;
/// Sliding window over which rejections are counted.
const WINDOW: Duration = Duration::from_secs(60);
/// Lockout duration once the window fills up.
const LOCKOUT: Duration = Duration::from_secs(300);

struct UserRecord {
    rejections: VecDeque<Instant>,
    locked_until: Option<Instant>,
}

/// Per-user throttle on verification attempts.
///
/// Only identity rejections count toward lockout. A liveness failure
/// (timed-out gesture) is an honest miss, not an impersonation signal,
/// so it never increments the counter.
pub struct RateLimiter {
    records: HashMap<String, UserRecord>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// `Ok(())` if the user may start a verification, `Err(message)`
    /// with the remaining lockout otherwise.
    pub fn check(&mut self, user: &str) -> Result<(), String> {
        let now = Instant::now();
        let Some(record) = self.records.get_mut(user) else {
            return Ok(());
        };

        if let Some(locked_until) = record.locked_until {
            if now < locked_until {
                let remaining = locked_until.duration_since(now).as_secs();
                return Err(format!(
                    "too many rejected attempts; try again in {remaining}s"
                ));
            }
            self.records.remove(user);
            return Ok(());
        }

        while let Some(&oldest) = record.rejections.front() {
            if now.duration_since(oldest) >= WINDOW {
                record.rejections.pop_front();
            } else {
                break;
            }
        }

        Ok(())
    }

    /// Record an identity rejection. May trigger a lockout.
    pub fn record_rejection(&mut self, user: &str) {
        let now = Instant::now();
        let record = self.records.entry(user.to_string()).or_insert(UserRecord {
            rejections: VecDeque::new(),
            locked_until: None,
        });

        while let Some(&oldest) = record.rejections.front() {
            if now.duration_since(oldest) >= WINDOW {
                record.rejections.pop_front();
            } else {
                break;
            }
        }

        record.rejections.push_back(now);
        if record.rejections.len() >= MAX_REJECTIONS {
            record.locked_until = Some(now + LOCKOUT);
            tracing::warn!(
                user,
                rejections = record.rejections.len(),
                lockout_secs = LOCKOUT.as_secs(),
                "rate limit triggered — locking user"
            );
        } else {
            tracing::debug!(
                user,
                rejections = record.rejections.len(),
                max = MAX_REJECTIONS,
                "identity rejected — counting toward lockout"
            );
        }
    }

    /// Record a successful verification — the slate is wiped.
    pub fn record_success(&mut self, user: &str) {
        self.records.remove(user);
    }
}
