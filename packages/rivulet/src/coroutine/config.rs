//! Coroutine pool configuration.

use std::{num::NonZeroUsize, thread, time::Duration};


// pool size used when the host parallelism cannot be determined.
const FALLBACK_CONCURRENCY: usize = 4;
// how long a request may go unanswered before it is rejected.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_THREAD_NAME: &str = "rivulet-worker";


/// Configuration for a [`Coroutine`](super::Coroutine) pool
///
/// Mutating setters (`set_*`) and ownership-chaining setters (`with_*`) are both provided.
#[derive(Debug, Clone)]
pub struct CoroutineConfig {
    concurrency: usize,
    timeout: Duration,
    retire_on_panic: bool,
    thread_name: String,
}

impl Default for CoroutineConfig {
    /// Concurrency defaults to the host-reported parallelism, falling back to 4. Requests time
    /// out after 30 seconds. Workers whose handler panics are retired.
    fn default() -> Self {
        CoroutineConfig {
            concurrency: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(FALLBACK_CONCURRENCY),
            timeout: DEFAULT_TIMEOUT,
            retire_on_panic: true,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

impl CoroutineConfig {
    /// Maximum number of worker units alive at once
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// How long a task request may wait for its reply
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether a worker whose handler panicked is shut down and replaced
    pub fn retire_on_panic(&self) -> bool {
        self.retire_on_panic
    }

    /// Prefix of worker thread names, which are suffixed with the worker id
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Set the maximum number of worker units
    ///
    /// Panics if `concurrency` is zero.
    pub fn set_concurrency(&mut self, concurrency: usize) -> &mut Self {
        assert!(concurrency > 0, "coroutine concurrency must be non-zero");
        self.concurrency = concurrency;
        self
    }

    /// Ownership-chaining version of [`set_concurrency`](Self::set_concurrency)
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.set_concurrency(concurrency);
        self
    }

    /// Set the per-request timeout
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// Ownership-chaining version of [`set_timeout`](Self::set_timeout)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.set_timeout(timeout);
        self
    }

    /// Set whether panicking workers are retired
    pub fn set_retire_on_panic(&mut self, retire_on_panic: bool) -> &mut Self {
        self.retire_on_panic = retire_on_panic;
        self
    }

    /// Ownership-chaining version of [`set_retire_on_panic`](Self::set_retire_on_panic)
    pub fn with_retire_on_panic(mut self, retire_on_panic: bool) -> Self {
        self.set_retire_on_panic(retire_on_panic);
        self
    }

    /// Set the worker thread name prefix
    pub fn set_thread_name(&mut self, thread_name: impl Into<String>) -> &mut Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Ownership-chaining version of [`set_thread_name`](Self::set_thread_name)
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.set_thread_name(thread_name);
        self
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CoroutineConfig::default();
        assert!(config.concurrency() >= 1);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(config.retire_on_panic());
        assert_eq!(config.thread_name(), "rivulet-worker");
    }

    #[test]
    fn chaining_setters() {
        let config = CoroutineConfig::default()
            .with_concurrency(2)
            .with_timeout(Duration::from_millis(100))
            .with_retire_on_panic(false)
            .with_thread_name("crunch");
        assert_eq!(config.concurrency(), 2);
        assert_eq!(config.timeout(), Duration::from_millis(100));
        assert!(!config.retire_on_panic());
        assert_eq!(config.thread_name(), "crunch");
    }

    #[test]
    #[should_panic]
    fn zero_concurrency_rejected() {
        CoroutineConfig::default().set_concurrency(0);
    }
}
