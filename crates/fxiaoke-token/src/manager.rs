//! Token manager: lookup, single-flight refresh and probe-and-recover
//!
//! The manager drives the pure state machine in [`crate::state`] and performs
//! the I/O each action asks for. Every suspension point (store call, gateway
//! call, coalesced refresh, backoff) races the caller's `CancellationToken`
//! and is bounded by `operation_timeout`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fxiaoke_auth::{
    AccessToken, ApiGateway, AppCredential, DEFAULT_PROBE_PATH, DEFAULT_TIMEOUT_SECS,
    ProbeRequest, TOKEN_PATH, TokenGrant, TokenRequest, TokenStore, UpstreamResponse, to_body,
    unix_millis,
};
use metrics::counter;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, classify_code};
use crate::singleflight::SingleFlight;
use crate::state::{RetryAction, RetryEvent, begin, handle_event};

/// Probe request settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSettings {
    /// Gateway path the probe is posted to
    pub path: String,
    /// Open user id the probe is issued on behalf of
    pub current_open_user_id: String,
    /// Query payload; the default fetches one account name
    pub data: Value,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            path: DEFAULT_PROBE_PATH.to_string(),
            current_open_user_id: String::new(),
            data: default_probe_query(),
        }
    }
}

/// Cheapest useful query: one `AccountObj` row, `name` only.
pub fn default_probe_query() -> Value {
    json!({
        "dataObjectApiName": "AccountObj",
        "search_query_info": {
            "offset": 0,
            "limit": 1,
            "filters": [],
            "orders": [],
            "fieldProjection": ["name"],
        }
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    pub retry: RetryPolicy,
    pub probe: ProbeSettings,
    /// Upper bound for any single store or gateway call
    pub operation_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            probe: ProbeSettings::default(),
            operation_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// Hands out corporate access tokens, refreshing and validating on demand.
///
/// Store and gateway are injected; the manager holds no process-wide state.
pub struct TokenManager {
    store: Arc<dyn TokenStore>,
    gateway: Arc<dyn ApiGateway>,
    config: ManagerConfig,
    flights: SingleFlight<Result<Flight>>,
}

/// Outcome shared by every caller of one refresh flight.
#[derive(Debug, Clone)]
struct Flight {
    token: AccessToken,
    /// False when the re-check found a record and no exchange ran
    exchanged: bool,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn TokenStore>,
        gateway: Arc<dyn ApiGateway>,
        config: ManagerConfig,
    ) -> Self {
        info!(
            max_invalidations = config.retry.max_invalidations,
            max_attempts = config.retry.max_attempts,
            probe_path = %config.probe.path,
            "token manager initialized"
        );
        Self {
            store,
            gateway,
            config,
            flights: SingleFlight::new(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Cached token, or a freshly exchanged one on a miss. No probe.
    pub async fn get_token(
        &self,
        credential: &AppCredential,
        cancel: &CancellationToken,
    ) -> Result<AccessToken> {
        self.drive(credential, false, cancel).await
    }

    /// Like [`get_token`](Self::get_token), then probe the gateway and recover
    /// from invalid-token and transient answers within the retry budget.
    pub async fn get_validated_token(
        &self,
        credential: &AppCredential,
        cancel: &CancellationToken,
    ) -> Result<AccessToken> {
        self.drive(credential, true, cancel).await
    }

    /// Exchange credentials for a new token regardless of the cache.
    ///
    /// Coalesced with any refresh already in flight for the same app id.
    pub async fn refresh(
        &self,
        credential: &AppCredential,
        cancel: &CancellationToken,
    ) -> Result<AccessToken> {
        self.coalesced_refresh(credential, false, cancel).await
    }

    /// Delete the cached record for `app_id`. Returns how many were removed.
    pub async fn invalidate(&self, app_id: &str, cancel: &CancellationToken) -> Result<u64> {
        let removed = cancellable(
            cancel,
            self.store_call("invalidate", self.store.invalidate(app_id)),
        )
        .await?;
        counter!("token_invalidations_total").increment(1);
        info!(app_id, removed, "invalidated cached token");
        Ok(removed)
    }

    async fn drive(
        &self,
        credential: &AppCredential,
        validate: bool,
        cancel: &CancellationToken,
    ) -> Result<AccessToken> {
        let app_id = credential.app_id.as_str();
        let (mut state, mut action) = begin(validate);

        loop {
            let event = match action {
                RetryAction::Lookup => match self.lookup(app_id, cancel).await {
                    Ok(Some(token)) => RetryEvent::CacheHit(token),
                    Ok(None) => RetryEvent::CacheMiss,
                    Err(e) => RetryEvent::Errored(e),
                },
                RetryAction::Refresh { recheck } => {
                    match self.coalesced_refresh(credential, recheck, cancel).await {
                        Ok(token) => RetryEvent::Refreshed(token),
                        Err(e) => RetryEvent::Errored(e),
                    }
                }
                RetryAction::Probe(token) => match self.probe(&token, cancel).await {
                    Ok(response) => RetryEvent::ProbeAnswered {
                        code: response.error_code,
                        message: response.error_message,
                    },
                    Err(e) => RetryEvent::Errored(e),
                },
                RetryAction::Invalidate => match self.invalidate(app_id, cancel).await {
                    Ok(_) => RetryEvent::Invalidated,
                    Err(e) => RetryEvent::Errored(e),
                },
                RetryAction::Wait(delay) => {
                    counter!("token_backoff_waits_total").increment(1);
                    debug!(
                        app_id,
                        delay_ms = delay.as_millis() as u64,
                        "backing off before next probe"
                    );
                    match sleep_cancellable(delay, cancel).await {
                        Ok(()) => RetryEvent::BackoffElapsed,
                        Err(e) => RetryEvent::Errored(e),
                    }
                }
                RetryAction::Return(token) => return Ok(token),
                RetryAction::Fail(err) => {
                    warn!(app_id, error = %err, "token acquisition failed");
                    return Err(err);
                }
                RetryAction::None => {
                    return Err(Error::Transport(format!(
                        "token state machine stalled in {}",
                        state.label()
                    )));
                }
            };

            (state, action) = handle_event(state, event, &self.config.retry);
            debug!(app_id, state = state.label(), "token state transition");
        }
    }

    async fn lookup(
        &self,
        app_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<AccessToken>> {
        let found =
            cancellable(cancel, self.store_call("lookup", self.store.lookup(app_id))).await?;
        let result = if found.is_some() { "hit" } else { "miss" };
        counter!("token_cache_lookups_total", "result" => result).increment(1);
        debug!(app_id, result, "token cache lookup");
        Ok(found)
    }

    /// Join or start the refresh flight for this app id.
    ///
    /// The flight itself is not bound to the caller's cancellation: if the
    /// caller running it gives up, a waiting caller takes over. A forced
    /// refresh that joined a flight which only re-read the store starts one
    /// of its own, since that record may be the one it was told to replace.
    async fn coalesced_refresh(
        &self,
        credential: &AppCredential,
        recheck: bool,
        cancel: &CancellationToken,
    ) -> Result<AccessToken> {
        let flight = self.join_flight(credential, recheck, cancel).await?;
        if recheck || flight.exchanged {
            return Ok(flight.token);
        }
        debug!(
            app_id = %credential.app_id,
            "joined flight served the cached record, refreshing again"
        );
        Ok(self.join_flight(credential, false, cancel).await?.token)
    }

    async fn join_flight(
        &self,
        credential: &AppCredential,
        recheck: bool,
        cancel: &CancellationToken,
    ) -> Result<Flight> {
        let flight = self
            .flights
            .run(&credential.app_id, || self.refresh_flight(credential, recheck));
        cancellable(cancel, flight).await
    }

    async fn refresh_flight(&self, credential: &AppCredential, recheck: bool) -> Result<Flight> {
        if recheck
            && let Some(token) = self
                .store_call("lookup", self.store.lookup(&credential.app_id))
                .await?
        {
            debug!(app_id = %credential.app_id, "token stored by a concurrent refresh");
            return Ok(Flight {
                token,
                exchanged: false,
            });
        }
        let token = self.exchange_token(credential).await?;
        Ok(Flight {
            token,
            exchanged: true,
        })
    }

    async fn exchange_token(&self, credential: &AppCredential) -> Result<AccessToken> {
        let app_id = credential.app_id.as_str();
        let outcome = self.exchange_and_store(credential).await;
        let label = match &outcome {
            Ok(_) => "success",
            Err(Error::UpstreamAuth { .. }) => "upstream_error",
            Err(_) => "error",
        };
        counter!("token_exchanges_total", "outcome" => label).increment(1);

        match &outcome {
            Ok(token) => info!(
                app_id,
                corp_id = %token.corp_id,
                expires_in_secs = token.expires_in_secs,
                expires_at_ms = token.expires_at_ms(),
                "obtained corporate access token"
            ),
            Err(Error::UpstreamAuth { code, message }) => {
                warn!(app_id, code, message = %message, "token exchange rejected")
            }
            Err(e) => warn!(app_id, error = %e, "token exchange failed"),
        }
        outcome
    }

    async fn exchange_and_store(&self, credential: &AppCredential) -> Result<AccessToken> {
        let body = to_body(&TokenRequest::from_credential(credential))?;
        let response = self.gateway_call(TOKEN_PATH, &body).await?;
        if !response.is_success() {
            return Err(Error::UpstreamAuth {
                code: response.error_code,
                message: response.error_message,
            });
        }

        let grant: TokenGrant = response.decode()?;
        let token = AccessToken::from_grant(&credential.app_id, grant, unix_millis());
        self.store_call("upsert", self.store.upsert(&token, token.ttl()))
            .await?;
        Ok(token)
    }

    async fn probe(
        &self,
        token: &AccessToken,
        cancel: &CancellationToken,
    ) -> Result<UpstreamResponse> {
        let settings = &self.config.probe;
        let body = to_body(&ProbeRequest {
            corp_access_token: &token.token,
            corp_id: &token.corp_id,
            current_open_user_id: &settings.current_open_user_id,
            data: &settings.data,
        })?;
        let response = cancellable(cancel, self.gateway_call(&settings.path, &body)).await?;

        let verdict = classify_code(response.error_code);
        counter!("token_probes_total", "verdict" => verdict.label()).increment(1);
        debug!(
            app_id = %token.app_id,
            code = response.error_code,
            verdict = verdict.label(),
            "probe answered"
        );
        Ok(response)
    }

    async fn store_call<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = fxiaoke_auth::Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.operation_timeout, call).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Store(format!(
                "{operation} timed out after {}ms",
                self.config.operation_timeout.as_millis()
            ))),
        }
    }

    async fn gateway_call(&self, path: &str, body: &Value) -> Result<UpstreamResponse> {
        match tokio::time::timeout(self.config.operation_timeout, self.gateway.exchange(path, body))
            .await
        {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Transport(format!(
                "POST {path} timed out after {}ms",
                self.config.operation_timeout.as_millis()
            ))),
        }
    }
}

/// Race `fut` against cancellation. Cancellation wins ties.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

async fn sleep_cancellable(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
