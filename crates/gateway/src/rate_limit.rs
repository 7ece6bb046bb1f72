use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A request quota, configured as strings like `"100/m"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuota {
    pub limit: u32,
    pub window: Duration,
}

impl RateQuota {
    pub fn parse(raw: &str) -> Option<Self> {
        let (limit, unit) = raw.trim().split_once('/')?;
        let limit = limit.trim().parse::<u32>().ok()?;
        let window = match unit.trim() {
            "s" => Duration::from_secs(1),
            "m" => Duration::from_secs(60),
            "h" => Duration::from_secs(60 * 60),
            _ => return None,
        };
        Some(Self { limit, window })
    }
}

/// Sliding-window limiter over per-key event queues. Counting is
/// approximate under concurrency but monotonic; the key map is bounded so
/// hostile key churn cannot grow it without limit.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    max_keys: usize,
}

impl RateLimiter {
    pub fn new(max_keys: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max_keys,
        }
    }

    pub fn allow(&self, key: &str, quota: RateQuota) -> bool {
        if quota.limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let queue = inner.entry(key.to_string()).or_default();
        prune_queue(queue, now, quota.window);
        if queue.len() >= quota.limit as usize {
            return false;
        }
        queue.push_back(now);

        inner.retain(|_, events| {
            prune_queue(events, now, quota.window);
            !events.is_empty()
        });

        if inner.len() > self.max_keys {
            let mut overflow = inner.len() - self.max_keys;
            let keys = inner.keys().cloned().collect::<Vec<_>>();
            for key in keys {
                if overflow == 0 {
                    break;
                }
                if inner.remove(&key).is_some() {
                    overflow -= 1;
                }
            }
        }

        true
    }
}

fn prune_queue(queue: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = queue.front() {
        if now.duration_since(*front) > window {
            queue.pop_front();
        } else {
            break;
        }
    }
}
