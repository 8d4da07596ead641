mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{REFRESH_TOKEN, seed_user};
use housing_sales_auth::{
    EventKind, ExpiryPrompt, GuardExit, IdleConfig, IdleTimer, MemoryStorage, OidcClient,
    SessionClient, Status, run_expiry_guard,
};
use parking_lot::Mutex;

#[derive(Clone, Default)]
struct RecordingPrompt {
    shown: Arc<Mutex<Vec<Duration>>>,
    dismissed: Arc<AtomicUsize>,
}

impl ExpiryPrompt for RecordingPrompt {
    fn show_countdown(&self, remaining: Duration) {
        self.shown.lock().push(remaining);
    }

    fn dismiss(&self) {
        self.dismissed.fetch_add(1, Ordering::SeqCst);
    }
}

fn idle_config() -> IdleConfig {
    IdleConfig::default()
        .with_timeout(Duration::from_secs(15 * 60))
        .with_prompt_before_idle(Duration::from_secs(60))
}

/// A signed-in session restored from storage, so nothing goes over the network.
async fn session() -> (SessionClient<OidcClient>, Arc<MemoryStorage>) {
    let config = common::config_for(&"https://sso.example.com/".parse().unwrap())
        .with_auto_sign_in(false)
        .with_poll_interval(Duration::from_secs(24 * 3600));
    let storage = Arc::new(MemoryStorage::new());
    seed_user(storage.as_ref(), &config, REFRESH_TOKEN);
    let provider = OidcClient::new(config.oidc().clone(), storage.clone());
    let session = SessionClient::new(config, provider, storage.clone());
    session.init().await.unwrap().unwrap();
    assert_eq!(session.status(), Status::Authorized);
    (session, storage)
}

#[tokio::test(start_paused = true)]
async fn idle_user_is_logged_out() {
    let (session, storage) = session().await;
    let logging_out = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&logging_out);
    session.on(EventKind::LoggingOut, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let prompt = RecordingPrompt::default();
    let (_timer, events) = IdleTimer::spawn(idle_config());
    let exit = run_expiry_guard(session.clone(), events, prompt.clone()).await;

    assert_eq!(exit, GuardExit::LoggedOut);
    assert_eq!(*prompt.shown.lock(), vec![Duration::from_secs(60)]);
    assert_eq!(prompt.dismissed.load(Ordering::SeqCst), 1);
    assert_eq!(logging_out.load(Ordering::SeqCst), 1);
    assert_eq!(session.status(), Status::Unauthorized);
    assert!(session.access_token().is_none());
    assert!(storage.is_empty());
}

#[tokio::test(start_paused = true)]
async fn activity_during_prompt_keeps_session() {
    let (session, storage) = session().await;
    let logging_out = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&logging_out);
    session.on(EventKind::LoggingOut, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let prompt = RecordingPrompt::default();
    let (timer, events) = IdleTimer::spawn(idle_config());
    let guard = tokio::spawn(run_expiry_guard(session.clone(), events, prompt.clone()));

    tokio::time::sleep(Duration::from_secs(14 * 60 + 10)).await;
    assert_eq!(prompt.shown.lock().len(), 1);

    timer.activity();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(prompt.dismissed.load(Ordering::SeqCst), 1);

    timer.stop();
    assert_eq!(guard.await.unwrap(), GuardExit::Stopped);
    assert_eq!(logging_out.load(Ordering::SeqCst), 0);
    assert_eq!(session.status(), Status::Authorized);
    assert_eq!(session.access_token().as_deref(), Some("access-0"));
    assert!(!storage.is_empty());
}

#[tokio::test(start_paused = true)]
async fn activity_before_prompt_shows_nothing() {
    let (session, _storage) = session().await;
    let prompt = RecordingPrompt::default();
    let (timer, events) = IdleTimer::spawn(idle_config());
    let guard = tokio::spawn(run_expiry_guard(session.clone(), events, prompt.clone()));

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        timer.activity();
    }
    timer.stop();

    assert_eq!(guard.await.unwrap(), GuardExit::Stopped);
    assert!(prompt.shown.lock().is_empty());
    assert_eq!(prompt.dismissed.load(Ordering::SeqCst), 0);
    assert_eq!(session.status(), Status::Authorized);
}
