use std::num::NonZeroUsize;

const DEFAULT_RUN_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_SMALL_STACK: usize = 16 * 1024;
const DEFAULT_NORMAL_STACK: usize = 256 * 1024;
const DEFAULT_LARGE_STACK: usize = 2 * 1024 * 1024;
const DEFAULT_KEY_TABLE_POOL_SIZE: usize = 64;

/// Tunables for a [`crate::Runtime`].
///
/// Built with [`RuntimeConfigBuilder`], mirroring the builder this codebase's thread pool
/// uses for its own thread-count/stack-size/naming knobs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub(crate) worker_count: usize,
    pub(crate) run_queue_capacity: usize,
    pub(crate) stack_size_small: usize,
    pub(crate) stack_size_normal: usize,
    pub(crate) stack_size_large: usize,
    pub(crate) key_table_pool_size: usize,
    pub(crate) thread_name: String,
    pub(crate) log_task_lifecycle: bool,
    pub(crate) log_context_switch: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfigBuilder::new().build()
    }
}

/// Builder for [`RuntimeConfig`].
///
/// ```
/// # use mthread_rt::RuntimeConfigBuilder;
/// let config = RuntimeConfigBuilder::new()
///     .worker_count(4)
///     .run_queue_capacity(2048)
///     .build();
/// ```
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    worker_count: Option<NonZeroUsize>,
    run_queue_capacity: Option<usize>,
    stack_size_small: Option<usize>,
    stack_size_normal: Option<usize>,
    stack_size_large: Option<usize>,
    key_table_pool_size: Option<usize>,
    thread_name: Option<String>,
    log_task_lifecycle: Option<bool>,
    log_context_switch: Option<bool>,
}

impl RuntimeConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of worker OS threads. Defaults to [`std::thread::available_parallelism`].
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = NonZeroUsize::new(count);
        self
    }

    /// Capacity of each worker's bounded run-queue. Exceeding it does not spill to a
    /// neighboring worker; the producer backs off and retries (see [`crate::worker`]).
    pub fn run_queue_capacity(mut self, capacity: usize) -> Self {
        self.run_queue_capacity = Some(capacity);
        self
    }

    /// Default stack size for `StackClass::Small`.
    pub fn stack_size_small(mut self, bytes: usize) -> Self {
        self.stack_size_small = Some(bytes);
        self
    }

    /// Default stack size for `StackClass::Normal`.
    pub fn stack_size_normal(mut self, bytes: usize) -> Self {
        self.stack_size_normal = Some(bytes);
        self
    }

    /// Default stack size for `StackClass::Large`.
    pub fn stack_size_large(mut self, bytes: usize) -> Self {
        self.stack_size_large = Some(bytes);
        self
    }

    /// Depth of each attribute's pooled key-table free-list.
    pub fn key_table_pool_size(mut self, size: usize) -> Self {
        self.key_table_pool_size = Some(size);
        self
    }

    /// Worker threads are named `{thread_name} ({id})`. Default: `"mthread-worker"`.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    /// Log task spawn/exit at `info!`. Default: `false`.
    pub fn log_task_lifecycle(mut self, enabled: bool) -> Self {
        self.log_task_lifecycle = Some(enabled);
        self
    }

    /// Log context switches at `trace!`. Only takes effect when the `switch-trace` feature
    /// is enabled. Default: `false`.
    pub fn log_context_switch(mut self, enabled: bool) -> Self {
        self.log_context_switch = Some(enabled);
        self
    }

    pub fn build(self) -> RuntimeConfig {
        let worker_count = self
            .worker_count
            .or_else(|| std::thread::available_parallelism().ok())
            .map(NonZeroUsize::get)
            .unwrap_or(1);

        RuntimeConfig {
            worker_count,
            run_queue_capacity: self.run_queue_capacity.unwrap_or(DEFAULT_RUN_QUEUE_CAPACITY),
            stack_size_small: self.stack_size_small.unwrap_or(DEFAULT_SMALL_STACK),
            stack_size_normal: self.stack_size_normal.unwrap_or(DEFAULT_NORMAL_STACK),
            stack_size_large: self.stack_size_large.unwrap_or(DEFAULT_LARGE_STACK),
            key_table_pool_size: self
                .key_table_pool_size
                .unwrap_or(DEFAULT_KEY_TABLE_POOL_SIZE),
            thread_name: self.thread_name.unwrap_or_else(|| "mthread-worker".into()),
            log_task_lifecycle: self.log_task_lifecycle.unwrap_or(false),
            log_context_switch: self.log_context_switch.unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.worker_count >= 1);
        assert_eq!(cfg.run_queue_capacity, DEFAULT_RUN_QUEUE_CAPACITY);
    }

    #[test]
    fn builder_overrides_apply() {
        let cfg = RuntimeConfigBuilder::new()
            .worker_count(3)
            .run_queue_capacity(16)
            .thread_name("custom")
            .build();
        assert_eq!(cfg.worker_count, 3);
        assert_eq!(cfg.run_queue_capacity, 16);
        assert_eq!(cfg.thread_name, "custom");
    }
}
