//! Fxiaoke open-API authentication primitives
//!
//! Provides the data model, the gateway adapter and the token stores used by
//! the token manager. This crate holds no policy: it performs one exchange or
//! one store operation per call and reports what happened. Retry, refresh and
//! invalidation decisions live in `fxiaoke-token`.
//!
//! Token flow:
//! 1. `AppCredential` is built from configuration (app id, secret, permanent code)
//! 2. `ApiGateway::exchange()` posts a `TokenRequest` to `TOKEN_PATH`
//! 3. The `UpstreamResponse` envelope is decoded into a `TokenGrant`
//! 4. `AccessToken::from_grant()` stamps the issue time
//! 5. `TokenStore::upsert()` persists it with a TTL of `expires_in_secs`

pub mod constants;
pub mod credentials;
pub mod error;
pub mod file_store;
pub mod gateway;
pub mod store;

pub use constants::*;
pub use credentials::{AccessToken, AppCredential, unix_millis};
pub use error::{Error, Result};
pub use file_store::FileTokenStore;
pub use gateway::{
    ApiGateway, GatewayConfig, HttpGateway, ProbeRequest, TokenGrant, TokenRequest,
    UpstreamResponse, to_body,
};
pub use store::{MemoryTokenStore, StoreFuture, TokenStore};
