//! Fxiaoke open-API constants
//!
//! Paths and business error codes defined by the gateway. The codes are the
//! gateway's values, not ours; anything not listed here is treated as a
//! terminal application error by the token manager.

/// Default gateway host
pub const DEFAULT_BASE_URL: &str = "https://open.fxiaoke.com";

/// Corporate access token issuance endpoint
pub const TOKEN_PATH: &str = "/cgi/corpAccessToken/get/V2";

/// Low-cost CRM query used to check that a token is still accepted
pub const DEFAULT_PROBE_PATH: &str = "/cgi/crm/v2/data/query";

/// Envelope code for success
pub const CODE_OK: i64 = 0;

/// The corp access token is invalid or expired
pub const CODE_INVALID_TOKEN: i64 = 20016;

/// Illegal parameter; the gateway returns this transiently under load
pub const CODE_PARAM_ILLEGAL: i64 = 20003;

/// Gateway timeout
pub const CODE_GATEWAY_TIMEOUT: i64 = 504;

/// Baseline bound for every external call (gateway and store)
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
