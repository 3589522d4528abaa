use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Key for the per-pair critical section: `student:exam`.
pub struct LockKey;

impl LockKey {
    pub fn pair(student_id: &str, exam_id: &str) -> String {
        format!("{}:{}", student_id, exam_id)
    }

    /// Serializes result submissions for a pair, apart from suspension
    /// creation.
    pub fn submission(student_id: &str, exam_id: &str) -> String {
        format!("submit:{}:{}", student_id, exam_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTimeout {
    pub key: String,
    pub waited: Duration,
}

impl fmt::Display for LockTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock {} not acquired after {:?}", self.key, self.waited)
    }
}

impl std::error::Error for LockTimeout {}

/// Process-local keyed mutex.
///
/// Only serializes requests handled by this process. Replicas do not see each
/// other's locks; the storage uniqueness constraint covers that case.
pub struct LockManager {
    held: Mutex<HashSet<String>>,
    poll_interval: Duration,
}

impl Default for LockManager {
    fn default() -> Self {
        LockManager::new(DEFAULT_POLL_INTERVAL)
    }
}

impl LockManager {
    pub fn new(poll_interval: Duration) -> Self {
        LockManager {
            held: Mutex::new(HashSet::new()),
            poll_interval,
        }
    }

    /// Mark `key` as held if it is free. Poisoning is ignored: the set holds
    /// no invariant a panicking holder could break.
    fn try_mark(&self, key: &str) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        held.insert(key.to_string())
    }

    fn unmark(&self, key: &str) {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        held.remove(key);
    }

    /// Poll until `key` is free or `timeout` elapses.
    pub fn acquire(&self, key: &str, timeout: Duration) -> Result<LockGuard<'_>, LockTimeout> {
        let started = Instant::now();
        loop {
            if self.try_mark(key) {
                tracing::debug!("Lock {} acquired after {:?}", key, started.elapsed());
                return Ok(LockGuard { manager: self, key: key.to_string() });
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockTimeout { key: key.to_string(), waited });
            }
            thread::sleep(self.poll_interval.min(timeout - waited));
        }
    }

    pub fn is_held(&self, key: &str) -> bool {
        let held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        held.contains(key)
    }
}

/// Releases the key on drop.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    key: String,
}

impl LockGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn release(self) {}
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.manager.unmark(&self.key);
        tracing::debug!("Lock {} released", self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn acquire_and_release() {
        let locks = LockManager::default();
        let guard = locks.acquire("s:e", Duration::from_millis(10)).unwrap();
        assert_eq!(guard.key(), "s:e");
        assert!(locks.is_held("s:e"));
        guard.release();
        assert!(!locks.is_held("s:e"));
    }

    #[test]
    fn held_key_times_out() {
        let locks = LockManager::new(Duration::from_millis(5));
        let _guard = locks.acquire("s:e", Duration::from_millis(10)).unwrap();
        let err = locks.acquire("s:e", Duration::from_millis(30)).err().unwrap();
        assert_eq!(err.key, "s:e");
        assert!(err.waited >= Duration::from_millis(30));
    }

    #[test]
    fn distinct_keys_do_not_block() {
        let locks = LockManager::default();
        let _a = locks.acquire(&LockKey::pair("s1", "e"), Duration::ZERO).unwrap();
        let _b = locks.acquire(&LockKey::pair("s2", "e"), Duration::ZERO).unwrap();
    }

    #[test]
    fn waiter_gets_the_lock_after_release() {
        let locks = LockManager::new(Duration::from_millis(2));
        let inside = AtomicUsize::new(0);
        let max_inside = AtomicUsize::new(0);
        let barrier = Barrier::new(8);

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    barrier.wait();
                    let guard = locks.acquire("s:e", Duration::from_secs(5)).unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(3));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                });
            }
        });

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(!locks.is_held("s:e"));
    }
}
