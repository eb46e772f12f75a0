//! Manage write engine shutdown
//!
//! This crate provides a set of types for stopping the background workers of a write engine in
//! either of two ways:
//!
//! * [`ShutdownMode::Drain`]: stop accepting new work, but keep sending everything already queued
//!   until the queues are empty and nothing is in flight.
//! * [`ShutdownMode::Abort`]: stop accepting new work and fail whatever is still queued. Work that
//!   is already in flight is allowed to finish.
//!
//! # Coordinate shutdown with the [`ShutdownManager`] type
//!
//! Workers are started through [`ShutdownManager::spawn`] so the manager can track them, and each
//! obtains a [`ShutdownToken`] via [`register`][ShutdownManager::register] that it uses to
//! [`wait_for_shutdown`][ShutdownToken::wait_for_shutdown] and inspect the requested
//! [`mode`][ShutdownToken::mode]. [`join`][ShutdownManager::join] completes once every tracked
//! worker has returned.
//!
//! A drain can be escalated to an abort by calling [`shutdown`][ShutdownManager::shutdown] a
//! second time with [`ShutdownMode::Abort`]; an abort is never downgraded.
use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::info;

/// Wait for a `SIGTERM` or `SIGINT` to stop the process on UNIX systems
#[cfg(unix)]
pub async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).expect("failed to register signal handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to register signal handler");

    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = int.recv() => info!("Received SIGINT"),
    }
}

/// Wait for a `ctrl+c` to stop the process on Windows systems
#[cfg(windows)]
pub async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received SIGINT");
}

/// How queued work is treated once shutdown has been requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Finish all queued and in-flight work before stopping.
    Drain,
    /// Fail queued work, only letting in-flight work finish.
    Abort,
}

/// Manage shutdown of a set of background workers
#[derive(Debug)]
pub struct ShutdownManager {
    shutdown: CancellationToken,
    abort: CancellationToken,
    tasks: TaskTracker,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownManager {
    /// Create a [`ShutdownManager`]
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Obtain a [`ShutdownToken`] for a worker
    pub fn register(&self) -> ShutdownToken {
        ShutdownToken {
            shutdown: self.shutdown.clone(),
            abort: self.abort.clone(),
        }
    }

    /// Spawn `task` onto the current tokio runtime, tracking it so that
    /// [`join`][Self::join] waits for it to return.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(task)
    }

    /// Request shutdown in the given `mode`
    ///
    /// Wakes every [`wait_for_shutdown`][ShutdownToken::wait_for_shutdown] future. Requesting
    /// [`ShutdownMode::Abort`] after [`ShutdownMode::Drain`] escalates the shutdown.
    pub fn shutdown(&self, mode: ShutdownMode) {
        if mode == ShutdownMode::Abort && !self.abort.is_cancelled() {
            info!("aborting queued work");
            self.abort.cancel();
        }
        if !self.shutdown.is_cancelled() {
            info!(?mode, "shutdown requested");
            self.shutdown.cancel();
        }
    }

    /// The requested shutdown mode, if shutdown has been requested
    pub fn mode(&self) -> Option<ShutdownMode> {
        mode(&self.shutdown, &self.abort)
    }

    /// Returns `true` once shutdown has been requested in any mode
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Waits for every spawned task to return
    ///
    /// No further tasks may be spawned once this has been called.
    pub async fn join(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// A token that a worker obtains via [`register`][ShutdownManager::register]
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    shutdown: CancellationToken,
    abort: CancellationToken,
}

impl ShutdownToken {
    /// Future that completes when shutdown is requested in any mode
    pub async fn wait_for_shutdown(&self) {
        self.shutdown.cancelled().await;
    }

    /// Future that completes when [`ShutdownMode::Abort`] is requested
    pub async fn wait_for_abort(&self) {
        self.abort.cancelled().await;
    }

    /// Returns `true` once shutdown has been requested in any mode
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// The requested shutdown mode, if shutdown has been requested
    pub fn mode(&self) -> Option<ShutdownMode> {
        mode(&self.shutdown, &self.abort)
    }
}

fn mode(shutdown: &CancellationToken, abort: &CancellationToken) -> Option<ShutdownMode> {
    if abort.is_cancelled() {
        Some(ShutdownMode::Abort)
    } else if shutdown.is_cancelled() {
        Some(ShutdownMode::Drain)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    use futures::FutureExt;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_join_waits_for_workers() {
        let shutdown_manager = ShutdownManager::new();
        let clean = Arc::new(AtomicBool::new(false));

        let token = shutdown_manager.register();
        let worker_clean = Arc::clone(&clean);
        shutdown_manager.spawn(async move {
            loop {
                futures::select! {
                    _ = token.wait_for_shutdown().fuse() => {
                        assert_eq!(token.mode(), Some(ShutdownMode::Drain));
                        worker_clean.store(true, Ordering::SeqCst);
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(10)).fuse() => {
                        // sleeping... 😴
                    }
                }
            }
        });

        assert_eq!(shutdown_manager.mode(), None);
        shutdown_manager.shutdown(ShutdownMode::Drain);
        shutdown_manager.join().await;
        assert!(
            clean.load(Ordering::SeqCst),
            "worker did not observe shutdown"
        );
    }

    #[test]
    fn test_abort_escalates_drain() {
        let shutdown_manager = ShutdownManager::new();
        let token = shutdown_manager.register();

        shutdown_manager.shutdown(ShutdownMode::Drain);
        assert_eq!(token.mode(), Some(ShutdownMode::Drain));
        assert!(token.is_shutdown());

        shutdown_manager.shutdown(ShutdownMode::Abort);
        assert_eq!(token.mode(), Some(ShutdownMode::Abort));

        // An abort is never downgraded.
        shutdown_manager.shutdown(ShutdownMode::Drain);
        assert_eq!(shutdown_manager.mode(), Some(ShutdownMode::Abort));
    }

    #[test_log::test(tokio::test)]
    async fn test_wait_for_abort_ignores_drain() {
        let shutdown_manager = ShutdownManager::new();
        let token = shutdown_manager.register();

        shutdown_manager.shutdown(ShutdownMode::Drain);
        token.wait_for_shutdown().await;
        assert!(token.wait_for_abort().now_or_never().is_none());

        shutdown_manager.shutdown(ShutdownMode::Abort);
        assert!(token.wait_for_abort().now_or_never().is_some());
    }
}
