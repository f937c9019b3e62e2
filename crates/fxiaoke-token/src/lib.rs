//! Corporate access token lifecycle
//!
//! `TokenManager` hands out a valid corporate access token per app, caching it
//! in a `TokenStore` and exchanging credentials through an `ApiGateway` only
//! when needed. Validation probes the live gateway and recovers from the
//! gateway's response codes with bounded retries.
//!
//! Validation lifecycle:
//! 1. Store lookup → hit returns the cached token, miss triggers a refresh
//! 2. Refresh is single-flight per app id: concurrent callers share one exchange
//! 3. Probe answers `0` → token returned
//! 4. Probe answers `20016` → record invalidated, token refreshed, probe repeated
//! 5. Probe answers `20003`/`504` → cancellable backoff, same token probed again
//! 6. Any other code or an exhausted budget → terminal error

pub mod error;
pub mod manager;
pub mod retry;
pub mod singleflight;
pub mod state;

pub use error::{Error, Result};
pub use manager::{ManagerConfig, ProbeSettings, TokenManager};
pub use retry::{ProbeVerdict, RetryPolicy, classify_code};
pub use singleflight::SingleFlight;
pub use state::{Progress, RetryAction, RetryEvent, RetryState, begin, handle_event};
pub use tokio_util::sync::CancellationToken;
