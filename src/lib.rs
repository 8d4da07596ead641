#![doc = include_str!("../README.md")]

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod idle;
pub mod oidc;
pub mod pkce;
pub mod poller;
pub mod provider;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod token;
pub mod types;
pub mod user;

// Re-exports for convenient access
pub use client::{InitOutcome, PendingInit, SessionClient, SessionClientBuilder};
pub use config::SessionConfig;
pub use error::Error;
pub use events::{Disposer, EventBus, EventKind, Listener, SessionEvent};
pub use idle::{ExpiryPrompt, GuardExit, IdleConfig, IdleEvent, IdleTimer, run_expiry_guard};
pub use oidc::{OidcClient, OidcConfig, TokenResponse};
pub use poller::{PollDirective, Poller, PollerConfig};
pub use provider::IdentityProvider;
pub use state::SessionState;
pub use storage::{MemoryStorage, SessionStorage};
pub use token::{ApiTokenCache, ApiTokenRequest, ApiTokens, FetchError};
pub use types::{Audience, ErrorKind, SessionError, Status, User};
pub use user::{OidcUser, Profile};
