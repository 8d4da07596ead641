//! Fixed-interval background poller.
//!
//! Used by the session client to check, once a minute by default, that the
//! identity provider still honours the access token.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::token::FetchError;

/// What to do after a failed poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollDirective {
    pub keep_polling: bool,
}

impl PollDirective {
    pub const CONTINUE: Self = Self { keep_polling: true };
    pub const STOP: Self = Self {
        keep_polling: false,
    };
}

pub type PollFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), FetchError>> + Send + Sync>;
pub type ShouldPollFn = Arc<dyn Fn() -> bool + Send + Sync>;
pub type OnErrorFn = Arc<dyn Fn(&FetchError) -> PollDirective + Send + Sync>;

#[derive(Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub poll: PollFn,
    /// Checked before every tick; `false` skips the tick without stopping.
    pub should_poll: ShouldPollFn,
    pub on_error: OnErrorFn,
}

impl std::fmt::Debug for PollerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerConfig")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// One start..stop cycle. Each cycle has its own stop flag so a stale loop
/// can never observe a later restart.
struct Run {
    stopped: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Run {
    fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

pub struct Poller {
    config: PollerConfig,
    run: Mutex<Option<Run>>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Poller {
    #[must_use]
    pub fn new(config: PollerConfig) -> Self {
        Self {
            config,
            run: Mutex::new(None),
        }
    }

    /// Start polling. No-op while already running. Must be called inside a
    /// tokio runtime.
    pub fn start(&self) {
        let mut run = self.run.lock();
        if run.as_ref().is_some_and(Run::is_live) {
            return;
        }
        let stopped = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(poll_loop(
            self.config.clone(),
            Arc::clone(&stopped),
            Arc::clone(&wake),
        ));
        debug!(interval_s = self.config.interval.as_secs(), "poller started");
        *run = Some(Run {
            stopped,
            wake,
            task,
        });
    }

    /// Stop polling. Safe to call when not running. A poll already in flight
    /// completes, but its result is ignored.
    pub fn stop(&self) {
        if let Some(run) = self.run.lock().take() {
            run.stop();
            debug!("poller stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.run.lock().as_ref().is_some_and(Run::is_live)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Some(run) = self.run.get_mut().take() {
            run.stop();
        }
    }
}

async fn poll_loop(config: PollerConfig, stopped: Arc<AtomicBool>, wake: Arc<Notify>) {
    let mut tick = 0u64;
    loop {
        tokio::select! {
            () = tokio::time::sleep(config.interval) => {}
            () = wake.notified() => {}
        }
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        if !(config.should_poll)() {
            trace!("poll skipped");
            continue;
        }

        tick += 1;
        let result = (config.poll)().await;
        if stopped.load(Ordering::SeqCst) {
            trace!(tick, "poll result ignored after stop");
            break;
        }
        if let Err(error) = result {
            let directive = (config.on_error)(&error);
            debug!(tick, status = ?error.status, keep_polling = directive.keep_polling, "poll failed");
            if !directive.keep_polling {
                stopped.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
}
