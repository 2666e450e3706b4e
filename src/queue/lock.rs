use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock a mutex, recovering the inner state when a previous holder panicked.
///
/// Pool bookkeeping stays usable after a producer panics on another thread; the
/// worst case is a stale statistic or a shell that is dropped instead of reused.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned render queue lock"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn recovers_from_poisoned_mutex() {
        let lock = Mutex::new(vec![1_u32]);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().expect("lock should be acquired");
            panic!("poison the lock");
        }));

        let mut guard = mutex_lock(&lock, "queue::lock::tests", "push");
        guard.push(2);
        assert_eq!(guard.as_slice(), &[1, 2]);
    }
}
