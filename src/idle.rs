//! Idle detection and the session-expiry guard.
//!
//! [`IdleTimer`] is a small actor: it counts down from the last reported
//! activity, emits [`IdleEvent::Prompt`] `prompt_before_idle` ahead of the
//! timeout and [`IdleEvent::Idle`] at the timeout. Activity resets the
//! countdown at any point until `Idle` has fired.
//!
//! [`run_expiry_guard`] is the consumer side: it shows a countdown on
//! prompt, dismisses it on activity and logs out on idle.
//!
//! ```text
//!   activity ──┐            activity (dialog open) ──→ Active, dismiss
//!              ▼
//!   [Counting] ──(timeout - prompt_before_idle)──→ [Prompted] ──(timeout)──→ Idle, logout
//! ```

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::client::SessionClient;
use crate::provider::IdentityProvider;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleConfig {
    /// Inactivity after which the session ends. Default: 15 minutes.
    pub timeout: Duration,
    /// How long before the timeout the warning is shown. Default: 60 seconds.
    pub prompt_before_idle: Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15 * 60),
            prompt_before_idle: Duration::from_secs(60),
        }
    }
}

impl IdleConfig {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_prompt_before_idle(mut self, prompt: Duration) -> Self {
        self.prompt_before_idle = prompt;
        self
    }

    /// Quiet time before the prompt. A warning window longer than the
    /// timeout prompts immediately.
    fn quiet_period(&self) -> Duration {
        self.timeout.saturating_sub(self.prompt_before_idle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// The user has `remaining` left before the session ends.
    Prompt { remaining: Duration },
    /// Activity resumed after a prompt.
    Active,
    /// The timeout elapsed. The timer stops after this.
    Idle,
}

enum Command {
    Activity,
    Stop,
}

/// Handle to a running idle countdown.
#[derive(Debug)]
pub struct IdleTimer {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl IdleTimer {
    /// Start counting down now. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(config: IdleConfig) -> (Self, mpsc::UnboundedReceiver<IdleEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_timer(config, cmd_rx, event_tx));
        (
            Self {
                commands: cmd_tx,
                task,
            },
            event_rx,
        )
    }

    /// Report user activity. Ignored once the timer has fired `Idle`.
    pub fn activity(&self) {
        let _ = self.commands.send(Command::Activity);
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Whether the countdown is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

async fn run_timer(
    config: IdleConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<IdleEvent>,
) {
    let mut last_activity = Instant::now();
    let mut prompted = false;

    loop {
        let deadline = if prompted {
            last_activity + config.timeout
        } else {
            last_activity + config.quiet_period()
        };

        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Activity) => {
                    last_activity = Instant::now();
                    if prompted {
                        prompted = false;
                        let _ = events.send(IdleEvent::Active);
                    }
                }
                Some(Command::Stop) | None => {
                    debug!("idle timer stopped");
                    break;
                }
            },
            () = sleep_until(deadline) => {
                if prompted {
                    debug!("idle timeout reached");
                    let _ = events.send(IdleEvent::Idle);
                    break;
                }
                prompted = true;
                let remaining = (last_activity + config.timeout).saturating_duration_since(Instant::now());
                debug!(remaining_s = remaining.as_secs(), "idle prompt");
                let _ = events.send(IdleEvent::Prompt { remaining });
            }
        }
    }
}

/// UI seam for the expiry warning dialog.
pub trait ExpiryPrompt: Send + Sync + 'static {
    /// Show (or refresh) the countdown dialog.
    fn show_countdown(&self, remaining: Duration);
    /// Close the dialog without logging out.
    fn dismiss(&self);
}

/// What ended [`run_expiry_guard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardExit {
    /// The user went idle and was logged out.
    LoggedOut,
    /// The timer stopped without an idle timeout.
    Stopped,
}

/// Drive the expiry dialog and force logout on idle.
pub async fn run_expiry_guard<P, U>(
    client: SessionClient<P>,
    mut events: mpsc::UnboundedReceiver<IdleEvent>,
    prompt: U,
) -> GuardExit
where
    P: IdentityProvider,
    U: ExpiryPrompt,
{
    let mut dialog_open = false;
    while let Some(event) = events.recv().await {
        match event {
            IdleEvent::Prompt { remaining } => {
                dialog_open = true;
                prompt.show_countdown(remaining);
            }
            IdleEvent::Active => {
                if dialog_open {
                    dialog_open = false;
                    prompt.dismiss();
                }
            }
            IdleEvent::Idle => {
                if dialog_open {
                    prompt.dismiss();
                }
                tracing::info!("Session idle timeout, logging out");
                client.logout();
                return GuardExit::LoggedOut;
            }
        }
    }
    GuardExit::Stopped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short() -> IdleConfig {
        IdleConfig::default()
            .with_timeout(Duration::from_secs(600))
            .with_prompt_before_idle(Duration::from_secs(60))
    }

    #[test]
    fn defaults() {
        let config = IdleConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(900));
        assert_eq!(config.prompt_before_idle, Duration::from_secs(60));
        assert_eq!(config.quiet_period(), Duration::from_secs(840));
    }

    #[test]
    fn oversized_prompt_window_prompts_immediately() {
        let config = IdleConfig::default()
            .with_timeout(Duration::from_secs(30))
            .with_prompt_before_idle(Duration::from_secs(60));
        assert_eq!(config.quiet_period(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_then_idle() {
        let start = Instant::now();
        let (timer, mut events) = IdleTimer::spawn(short());

        let first = events.recv().await.unwrap();
        assert_eq!(first, IdleEvent::Prompt { remaining: Duration::from_secs(60) });
        assert_eq!(start.elapsed(), Duration::from_secs(540));

        assert_eq!(events.recv().await.unwrap(), IdleEvent::Idle);
        assert_eq!(start.elapsed(), Duration::from_secs(600));

        assert_eq!(events.recv().await, None);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_after_prompt_resets() {
        let (timer, mut events) = IdleTimer::spawn(short());
        assert!(matches!(events.recv().await, Some(IdleEvent::Prompt { .. })));

        tokio::time::advance(Duration::from_secs(30)).await;
        let resumed_at = Instant::now();
        timer.activity();
        assert_eq!(events.recv().await, Some(IdleEvent::Active));

        // Full quiet period again from the activity.
        assert!(matches!(events.recv().await, Some(IdleEvent::Prompt { .. })));
        assert_eq!(resumed_at.elapsed(), Duration::from_secs(540));
    }

    #[tokio::test(start_paused = true)]
    async fn activity_before_prompt_postpones_it() {
        let start = Instant::now();
        let (timer, mut events) = IdleTimer::spawn(short());

        tokio::time::advance(Duration::from_secs(500)).await;
        timer.activity();

        assert!(matches!(events.recv().await, Some(IdleEvent::Prompt { .. })));
        assert_eq!(start.elapsed(), Duration::from_secs(1040));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_without_events() {
        let (timer, mut events) = IdleTimer::spawn(short());
        timer.stop();
        assert_eq!(events.recv().await, None);
        timer.activity();
    }
}
