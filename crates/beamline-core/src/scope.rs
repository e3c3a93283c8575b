//! Scoped acquisition of several lockable resources.
//!
//! A [`ScopedResource`] is anything with an enter hook that hands back an
//! exit handle. [`MultiLock`] enters an ordered list of them and returns a
//! [`MultiGuard`] that releases every one again.
//!
//! ```text
//! enter:  r[0].enter ─► r[1].enter ─► ... ─► r[n-1].enter
//!                    (failure: release what was acquired, report the entry error)
//! exit:   x[0].exit  ─► x[1].exit  ─► ... ─► x[n-1].exit
//!                    (every exit runs; failures are collected into ReleaseFailed)
//! ```
//!
//! Resources are acquired in the order given. Callers needing deadlock freedom
//! across threads must agree on that order.
//!
//! Device locks are not reentrant: listing the same device twice, or entering
//! a device the current thread already holds, blocks forever.

use std::fmt;
use tracing::{trace, warn};

use crate::error::{DeviceError, Result};

/// Handle returned by [`ScopedResource::enter`]; consuming it releases the
/// resource.
pub trait ScopeExit {
    /// Release the resource.
    fn exit(self: Box<Self>) -> Result<()>;
}

/// A resource with enter/exit hooks.
pub trait ScopedResource {
    /// Acquire the resource. The returned handle must be exited (or dropped)
    /// to release it.
    fn enter(&self) -> Result<Box<dyn ScopeExit + '_>>;
}

/// An ordered set of resources entered and exited together.
pub struct MultiLock<'a> {
    resources: Vec<&'a dyn ScopedResource>,
}

impl<'a> MultiLock<'a> {
    pub fn new(resources: impl IntoIterator<Item = &'a dyn ScopedResource>) -> Self {
        Self {
            resources: resources.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Enter every resource in order.
    ///
    /// If an enter hook fails, the resources acquired so far are released
    /// before the entry error is returned.
    pub fn enter(&self) -> Result<MultiGuard<'a>> {
        let mut held = Vec::with_capacity(self.resources.len());

        for (index, resource) in self.resources.iter().copied().enumerate() {
            match resource.enter() {
                Ok(handle) => {
                    trace!(index, "acquired");
                    held.push(handle);
                }
                Err(e) => {
                    warn!(index, error = %e, "enter failed, releasing acquired resources");
                    if let Err(release) = release_all(held) {
                        warn!(error = %release, "release after failed enter");
                    }
                    return Err(e);
                }
            }
        }

        Ok(MultiGuard { held })
    }
}

impl fmt::Debug for MultiLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiLock")
            .field("resources", &self.resources.len())
            .finish()
    }
}

/// Exit handles of an entered [`MultiLock`].
///
/// Dropping the guard without calling [`MultiGuard::exit`] still releases
/// every resource; failures are then only logged.
#[must_use = "dropping the guard releases every resource immediately"]
pub struct MultiGuard<'a> {
    held: Vec<Box<dyn ScopeExit + 'a>>,
}

impl MultiGuard<'_> {
    /// Number of acquired resources.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Release every resource in order and report all failures together.
    pub fn exit(mut self) -> Result<()> {
        release_all(std::mem::take(&mut self.held))
    }
}

impl Drop for MultiGuard<'_> {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        if let Err(e) = release_all(std::mem::take(&mut self.held)) {
            warn!(error = %e, "release on drop");
        }
    }
}

impl fmt::Debug for MultiGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiGuard")
            .field("held", &self.held.len())
            .finish()
    }
}

fn release_all<'a>(held: Vec<Box<dyn ScopeExit + 'a>>) -> Result<()> {
    let failures: Vec<DeviceError> = held
        .into_iter()
        .enumerate()
        .filter_map(|(index, handle)| match handle.exit() {
            Ok(()) => {
                trace!(index, "released");
                None
            }
            Err(e) => Some(e),
        })
        .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        Err(DeviceError::ReleaseFailed(failures))
    }
}

/// Run `body` while holding every resource.
///
/// Resources are released whether or not `body` succeeds. A body error takes
/// precedence over a release error.
pub fn with_all<'a, R>(
    resources: impl IntoIterator<Item = &'a dyn ScopedResource>,
    body: impl FnOnce() -> Result<R>,
) -> Result<R> {
    let guard = MultiLock::new(resources).enter()?;
    let outcome = body();
    let released = guard.exit();

    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release)) => {
            warn!(error = %release, "release after failed body");
            Err(e)
        }
    }
}
