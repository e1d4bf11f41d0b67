use std::sync::{Mutex, OnceLock};

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Serializes config tests that mutate the process environment.
pub(crate) fn with_locked_env<R>(run: impl FnOnce() -> R) -> R {
    let _guard = env_lock().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    run()
}

/// # Safety
/// Callers must hold `with_locked_env` so parallel tests never race on the environment.
pub(crate) fn set_env_var(key: &str, value: &str) {
    // SAFETY: guarded by `with_locked_env`.
    unsafe {
        std::env::set_var(key, value);
    }
}

pub(crate) fn remove_env_var(key: &str) {
    // SAFETY: guarded by `with_locked_env`.
    unsafe {
        std::env::remove_var(key);
    }
}
