//! Bounded worker pool and the asynchronous device wrapper.
//!
//! Device operations block the calling thread for the duration of the driver
//! call. [`AsyncWrapper`] moves those calls onto a shared [`WorkerPool`] and
//! hands back a [`TaskHandle`] immediately:
//!
//! ```text
//! wrapper.move_by(d) ──► pool.submit(|| motor.move_by(d)) ──► TaskHandle
//!                              │                                 │
//!                              ▼                                 ▼
//!                  blocking thread (≤ capacity)        wait() / is_finished() / .await
//! ```
//!
//! The pool is bounded: at most `capacity` tasks run at once and further
//! submissions queue until a thread frees up. Errors raised by the task are
//! captured on the handle and returned from `wait()`.
//!
//! Which methods go through the pool is declared per driver type with
//! [`async_interface!`](crate::async_interface). Everything else on the
//! wrapper dereferences to the wrapped instance and runs synchronously.

use futures::future::join_all;
use once_cell::sync::OnceCell;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::{Builder, Runtime};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, trace, warn};

use crate::config::{ExecutionMode, ExecutorConfig};
use crate::error::{DeviceError, Result};

/// Capacity of the process-wide pool unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 10;

static GLOBAL: OnceCell<Arc<WorkerPool>> = OnceCell::new();

// =============================================================================
// WorkerPool
// =============================================================================

/// Fixed-capacity pool running blocking device calls.
pub struct WorkerPool {
    runtime: Option<Runtime>,
    capacity: usize,
}

impl WorkerPool {
    /// Pool running at most `capacity` tasks at once.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(DeviceError::Other(anyhow::anyhow!(
                "worker pool capacity must be at least 1"
            )));
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(capacity)
            .thread_name("beamline-worker")
            .enable_time()
            .build()
            .map_err(|e| anyhow::anyhow!("failed to start worker pool: {e}"))?;

        debug!(capacity, "worker pool started");
        Ok(Self {
            runtime: Some(runtime),
            capacity,
        })
    }

    /// Pool that runs every submission synchronously on the caller's thread.
    pub fn inline() -> Self {
        Self {
            runtime: None,
            capacity: 1,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Result<Self> {
        match config.mode {
            ExecutionMode::Pooled => Self::new(config.capacity),
            ExecutionMode::Inline => Ok(Self::inline()),
        }
    }

    /// Install the process-wide pool from configuration.
    ///
    /// Returns `false` if the global pool was already created, in which case
    /// `config` is ignored.
    pub fn init_global(config: &ExecutorConfig) -> Result<bool> {
        let mut installed = false;
        GLOBAL.get_or_try_init(|| {
            installed = true;
            Self::from_config(config).map(Arc::new)
        })?;
        if !installed {
            warn!("global worker pool already initialized, configuration ignored");
        }
        Ok(installed)
    }

    /// The process-wide pool, created with [`DEFAULT_CAPACITY`] on first use.
    pub fn global() -> Arc<WorkerPool> {
        GLOBAL
            .get_or_init(|| {
                Arc::new(Self::new(DEFAULT_CAPACITY).unwrap_or_else(|e| {
                    error!(error = %e, "worker pool unavailable, running tasks inline");
                    Self::inline()
                }))
            })
            .clone()
    }

    /// Maximum number of concurrently running tasks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether submissions run on the caller's thread.
    pub fn is_inline(&self) -> bool {
        self.runtime.is_none()
    }

    /// Run `task` on the pool.
    ///
    /// Never fails: when all threads are busy the task waits in the queue.
    pub fn submit<R, F>(&self, task: F) -> TaskHandle<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        match &self.runtime {
            Some(runtime) => {
                trace!("task submitted");
                TaskHandle {
                    state: HandleState::Pending(runtime.spawn_blocking(task)),
                }
            }
            None => TaskHandle::ready(task()),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Shutting down without waiting is allowed from async contexts too.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("inline", &self.is_inline())
            .finish()
    }
}

// =============================================================================
// TaskHandle
// =============================================================================

/// Result of a submitted task, available once it finishes.
///
/// Block on it with [`TaskHandle::wait`], poll it with
/// [`TaskHandle::is_finished`], or `.await` it.
#[must_use = "a task handle does nothing unless waited on or polled"]
pub struct TaskHandle<R> {
    state: HandleState<R>,
}

enum HandleState<R> {
    Pending(JoinHandle<Result<R>>),
    Ready(Option<Result<R>>),
}

// The handle never hands out pinned references to its fields.
impl<R> Unpin for TaskHandle<R> {}

impl<R> TaskHandle<R> {
    /// Handle that is already finished with `result`.
    pub fn ready(result: Result<R>) -> Self {
        Self {
            state: HandleState::Ready(Some(result)),
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            HandleState::Pending(handle) => handle.is_finished(),
            HandleState::Ready(_) => true,
        }
    }

    /// Block the current thread until the task finishes and return its
    /// result.
    ///
    /// Do not call this from inside an async task; `.await` the handle
    /// instead.
    pub fn wait(self) -> Result<R> {
        futures::executor::block_on(self)
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            HandleState::Pending(handle) => Pin::new(handle)
                .poll(cx)
                .map(|joined| joined.unwrap_or_else(|e| Err(join_error(e)))),
            HandleState::Ready(result) => Poll::Ready(result.take().unwrap_or_else(|| {
                Err(DeviceError::TaskFailed(
                    "result already taken".to_string(),
                ))
            })),
        }
    }
}

impl<R> fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn join_error(e: JoinError) -> DeviceError {
    if e.is_panic() {
        let payload = e.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(%message, "task panicked");
        DeviceError::TaskFailed(format!("task panicked: {message}"))
    } else {
        DeviceError::TaskFailed("task cancelled".to_string())
    }
}

/// Block until every handle finishes; results keep submission order.
pub fn wait_all<R>(handles: impl IntoIterator<Item = TaskHandle<R>>) -> Vec<Result<R>> {
    futures::executor::block_on(join_all(handles))
}

// =============================================================================
// AsyncWrapper
// =============================================================================

/// Wraps one device instance and runs its declared operations on a pool.
///
/// Clones share the instance and the pool.
pub struct AsyncWrapper<D> {
    inner: Arc<D>,
    pool: Arc<WorkerPool>,
}

impl<D> Clone for AsyncWrapper<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl<D: Send + Sync + 'static> AsyncWrapper<D> {
    /// Wrap `inner`, submitting to the process-wide pool.
    pub fn new(inner: D) -> Self {
        Self::with_pool(inner, WorkerPool::global())
    }

    pub fn with_pool(inner: D, pool: Arc<WorkerPool>) -> Self {
        Self {
            inner: Arc::new(inner),
            pool,
        }
    }

    /// Submit `operation` against the wrapped instance.
    pub fn call<R, F>(&self, operation: F) -> TaskHandle<R>
    where
        F: FnOnce(&D) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let inner = self.inner.clone();
        self.pool.submit(move || operation(&inner))
    }

    /// The wrapped instance.
    pub fn inner(&self) -> &Arc<D> {
        &self.inner
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
}

impl<D> Deref for AsyncWrapper<D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.inner
    }
}

impl<D: fmt::Debug> fmt::Debug for AsyncWrapper<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncWrapper")
            .field("inner", &self.inner)
            .field("pool", &self.pool)
            .finish()
    }
}

/// Declare which methods of a type run on the pool when it is wrapped.
///
/// Generates a trait with one method per declared operation, returning a
/// [`TaskHandle`] of the operation's success type, and implements it for
/// [`AsyncWrapper`] of the type. The wrapped type must have methods of the
/// same names returning `Result<T>`. With the trait in scope, calls on the
/// wrapper go through the pool; without it they fall through to the
/// synchronous method.
///
/// ```rust
/// use beamline_core::async_interface;
/// use beamline_core::executor::{AsyncWrapper, WorkerPool};
/// use std::sync::Arc;
///
/// struct Pump;
///
/// impl Pump {
///     fn start(&self, rate: f64) -> beamline_core::Result<f64> {
///         Ok(rate)
///     }
/// }
///
/// async_interface! {
///     pub trait PumpAsync for Pump {
///         fn start(rate: f64) -> f64;
///     }
/// }
///
/// let pump = AsyncWrapper::with_pool(Pump, Arc::new(WorkerPool::new(2)?));
/// let handle = pump.start(1.5);
/// assert_eq!(handle.wait()?, 1.5);
/// # Ok::<(), beamline_core::DeviceError>(())
/// ```
#[macro_export]
macro_rules! async_interface {
    (
        $(#[$meta:meta])*
        $vis:vis trait $name:ident for $ty:ty {
            $( fn $op:ident ( $( $arg:ident : $arg_ty:ty ),* $(,)? ) -> $ret:ty; )*
        }
    ) => {
        $(#[$meta])*
        $vis trait $name {
            $(
                #[doc = concat!("Submit `", stringify!($op), "` to the worker pool.")]
                fn $op(&self, $( $arg: $arg_ty ),* ) -> $crate::executor::TaskHandle<$ret>;
            )*
        }

        impl $name for $crate::executor::AsyncWrapper<$ty> {
            $(
                fn $op(&self, $( $arg: $arg_ty ),* ) -> $crate::executor::TaskHandle<$ret> {
                    self.call(move |inner: &$ty| inner.$op($( $arg ),*))
                }
            )*
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn test_submit_and_wait() {
        let pool = WorkerPool::new(2).unwrap();
        let handle = pool.submit(|| Ok(21 * 2));
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn test_error_captured_on_handle() {
        let pool = WorkerPool::new(2).unwrap();
        let handle = pool.submit(|| -> Result<()> { Err(DeviceError::hardware("jammed")) });
        assert_eq!(handle.wait().unwrap_err().to_string(), "Hardware error: jammed");
    }

    #[test]
    fn test_panic_becomes_task_failed() {
        let pool = WorkerPool::new(1).unwrap();
        let handle = pool.submit(|| -> Result<()> { panic!("driver bug") });
        let err = handle.wait().unwrap_err();
        assert!(matches!(err, DeviceError::TaskFailed(ref m) if m.contains("driver bug")));
    }

    #[test]
    fn test_capacity_bounds_concurrency() {
        let pool = WorkerPool::new(2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let (running, peak) = (running.clone(), peak.clone());
                pool.submit(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        assert!(wait_all(handles).iter().all(Result::is_ok));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_is_finished() {
        let pool = WorkerPool::new(1).unwrap();
        let gate = Arc::new(Barrier::new(2));
        let task_gate = gate.clone();

        let handle = pool.submit(move || {
            task_gate.wait();
            Ok(())
        });
        assert!(!handle.is_finished());
        gate.wait();
        handle.wait().unwrap();
    }

    #[test]
    fn test_inline_runs_on_caller() {
        let pool = WorkerPool::inline();
        let caller = std::thread::current().id();
        let handle = pool.submit(move || Ok(std::thread::current().id() == caller));
        assert!(handle.is_finished());
        assert!(handle.wait().unwrap());
    }

    #[test]
    fn test_from_config() {
        let pooled = WorkerPool::from_config(&ExecutorConfig::default()).unwrap();
        assert_eq!(pooled.capacity(), DEFAULT_CAPACITY);
        assert!(!pooled.is_inline());

        let inline = WorkerPool::from_config(&ExecutorConfig {
            capacity: 4,
            mode: ExecutionMode::Inline,
        })
        .unwrap();
        assert!(inline.is_inline());

        assert!(WorkerPool::new(0).is_err());
    }

    #[tokio::test]
    async fn test_handle_is_a_future() {
        let pool = WorkerPool::new(1).unwrap();
        let value = pool.submit(|| Ok("done")).await.unwrap();
        assert_eq!(value, "done");
    }

    struct Counter {
        count: Mutex<i64>,
    }

    impl Counter {
        fn add(&self, n: i64) -> Result<i64> {
            let mut count = self.count.lock();
            *count += n;
            Ok(*count)
        }

        fn fail(&self) -> Result<()> {
            Err(DeviceError::hardware("counter overflow"))
        }

        fn peek(&self) -> i64 {
            *self.count.lock()
        }
    }

    crate::async_interface! {
        trait CounterAsync for Counter {
            fn add(n: i64) -> i64;
            fn fail() -> ();
        }
    }

    #[test]
    fn test_wrapper_intercepts_declared_operations() {
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        let counter = AsyncWrapper::with_pool(
            Counter {
                count: Mutex::new(0),
            },
            pool,
        );

        let handles: Vec<TaskHandle<i64>> = (0..5).map(|_| counter.add(2)).collect();
        for result in wait_all(handles) {
            result.unwrap();
        }

        // Undeclared methods pass through synchronously.
        assert_eq!(counter.peek(), 10);
        assert!(counter.fail().wait().is_err());
    }

    #[test]
    fn test_global_pool_is_shared() {
        assert!(Arc::ptr_eq(&WorkerPool::global(), &WorkerPool::global()));
        assert_eq!(WorkerPool::global().capacity(), DEFAULT_CAPACITY);
    }
}
