//! Token validation state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! Caller (`TokenManager`) executes the I/O implied by each action and feeds
//! the outcome back as the next event.
//!
//! ```text
//! NoToken → Fetching → Cached → Probing → Cached (success)
//!                                       → Invalidating → Fetching (bounded)
//!                                       → Backoff → Probing (bounded)
//!                                       → Failed (terminal)
//! ```

use std::time::Duration;

use fxiaoke_auth::AccessToken;

use crate::error::Error;
use crate::retry::{ProbeVerdict, RetryPolicy, classify_code};

/// Counters carried through one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Probe the token before handing it out
    pub validate: bool,
    /// Invalidate-and-refresh cycles performed so far
    pub invalidations: u32,
    /// Probes answered with a transient code so far
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryState {
    /// Nothing known yet; the store is being consulted
    NoToken(Progress),
    /// Waiting on a refresh
    Fetching(Progress),
    /// Token ready to return
    Cached(AccessToken),
    /// Waiting on a probe answer for `token`
    Probing {
        token: AccessToken,
        progress: Progress,
    },
    /// Waiting on removal of a rejected record
    Invalidating(Progress),
    /// Sleeping before probing `token` again
    Backoff {
        token: AccessToken,
        progress: Progress,
    },
    /// Terminal failure
    Failed(Error),
}

impl RetryState {
    /// State label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            RetryState::NoToken(_) => "no_token",
            RetryState::Fetching(_) => "fetching",
            RetryState::Cached(_) => "cached",
            RetryState::Probing { .. } => "probing",
            RetryState::Invalidating(_) => "invalidating",
            RetryState::Backoff { .. } => "backoff",
            RetryState::Failed(_) => "failed",
        }
    }
}

/// Outcomes of the I/O performed for the previous action.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryEvent {
    CacheHit(AccessToken),
    CacheMiss,
    Refreshed(AccessToken),
    ProbeAnswered { code: i64, message: String },
    Invalidated,
    BackoffElapsed,
    /// Store, transport or cancellation failure from any step
    Errored(Error),
}

/// Actions the caller should execute after a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction {
    /// Read the store
    Lookup,
    /// Exchange credentials for a new token. `recheck` consults the store
    /// again inside the coalesced flight before exchanging.
    Refresh { recheck: bool },
    /// Probe the gateway with this token
    Probe(AccessToken),
    /// Delete the stored record
    Invalidate,
    /// Cancellable sleep
    Wait(Duration),
    /// Done: hand this token to the caller
    Return(AccessToken),
    /// Done: hand this error to the caller
    Fail(Error),
    /// No-op
    None,
}

/// Initial state and action for one invocation.
pub fn begin(validate: bool) -> (RetryState, RetryAction) {
    (
        RetryState::NoToken(Progress {
            validate,
            ..Progress::default()
        }),
        RetryAction::Lookup,
    )
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(
    state: RetryState,
    event: RetryEvent,
    policy: &RetryPolicy,
) -> (RetryState, RetryAction) {
    match (state, event) {
        // --- NoToken / Fetching ---
        (RetryState::NoToken(progress), RetryEvent::CacheHit(token))
        | (RetryState::Fetching(progress), RetryEvent::Refreshed(token)) => {
            token_ready(token, progress)
        }

        (RetryState::NoToken(progress), RetryEvent::CacheMiss) => (
            RetryState::Fetching(progress),
            RetryAction::Refresh { recheck: true },
        ),

        // --- Probing ---
        (RetryState::Probing { token, progress }, RetryEvent::ProbeAnswered { code, message }) => {
            match classify_code(code) {
                ProbeVerdict::Ok => (
                    RetryState::Cached(token.clone()),
                    RetryAction::Return(token),
                ),
                ProbeVerdict::InvalidToken
                    if progress.invalidations >= policy.max_invalidations =>
                {
                    fail(Error::AuthExhausted {
                        attempts: progress.invalidations,
                        code,
                        message,
                    })
                }
                ProbeVerdict::InvalidToken => (
                    RetryState::Invalidating(Progress {
                        invalidations: progress.invalidations + 1,
                        ..progress
                    }),
                    RetryAction::Invalidate,
                ),
                ProbeVerdict::Transient => {
                    let attempts = progress.attempts + 1;
                    if attempts >= policy.max_attempts {
                        return fail(Error::RetryExhausted {
                            attempts,
                            code,
                            message,
                        });
                    }
                    (
                        RetryState::Backoff {
                            token,
                            progress: Progress {
                                attempts,
                                ..progress
                            },
                        },
                        RetryAction::Wait(policy.delay_for(attempts)),
                    )
                }
                ProbeVerdict::Terminal => fail(Error::UpstreamAuth { code, message }),
            }
        }

        // --- Invalidating ---
        (RetryState::Invalidating(progress), RetryEvent::Invalidated) => (
            RetryState::Fetching(progress),
            RetryAction::Refresh { recheck: false },
        ),

        // --- Backoff ---
        (RetryState::Backoff { token, progress }, RetryEvent::BackoffElapsed) => (
            RetryState::Probing {
                token: token.clone(),
                progress,
            },
            RetryAction::Probe(token),
        ),

        // --- Failures propagate from any non-terminal state ---
        (RetryState::Cached(token), RetryEvent::Errored(_)) => {
            (RetryState::Cached(token), RetryAction::None)
        }
        (RetryState::Failed(err), RetryEvent::Errored(_)) => {
            (RetryState::Failed(err), RetryAction::None)
        }
        (_, RetryEvent::Errored(err)) => fail(err),

        // --- Invalid transitions: no-op ---
        (state, _event) => (state, RetryAction::None),
    }
}

fn token_ready(token: AccessToken, progress: Progress) -> (RetryState, RetryAction) {
    if progress.validate {
        (
            RetryState::Probing {
                token: token.clone(),
                progress,
            },
            RetryAction::Probe(token),
        )
    } else {
        (RetryState::Cached(token.clone()), RetryAction::Return(token))
    }
}

fn fail(err: Error) -> (RetryState, RetryAction) {
    (RetryState::Failed(err.clone()), RetryAction::Fail(err))
}
