//! Secret wrapper for credential material
//!
//! Application secrets and permanent codes travel from config to the token
//! issuance request. They must never show up in `Debug` output, log fields
//! or error messages, and are wiped from memory on drop.

use std::fmt;
use zeroize::Zeroize;

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Wrap a sensitive value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Whether the wrapped string is empty after trimming whitespace.
    ///
    /// Secret files frequently end with a newline or are created empty by
    /// provisioning tools; both count as "no secret configured".
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Secret<String> {
    fn from(value: &str) -> Self {
        Self::new(value.to_owned())
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_secret_is_redacted_in_debug_and_display() {
        let secret = Secret::from("fx-app-secret");
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(format!("{secret}"), "[REDACTED]");
    }

    #[test]
    fn redaction_survives_struct_debug() {
        #[derive(Debug)]
        #[allow(dead_code)]
        struct Holder {
            app_id: String,
            permanent_code: Secret<String>,
        }

        let holder = Holder {
            app_id: "FSAID_1".into(),
            permanent_code: Secret::from("perm-code-xyz"),
        };
        let debug = format!("{holder:?}");
        assert!(debug.contains("FSAID_1"));
        assert!(!debug.contains("perm-code-xyz"), "got: {debug}");
    }

    #[test]
    fn expose_returns_inner_value() {
        let secret = Secret::from(String::from("fx-app-secret"));
        assert_eq!(secret.expose(), "fx-app-secret");
        assert_eq!(secret.clone().expose(), "fx-app-secret");
    }

    #[test]
    fn blank_detection_ignores_whitespace() {
        assert!(Secret::from("  \n").is_blank());
        assert!(Secret::from("").is_blank());
        assert!(!Secret::from(" value\n").is_blank());
    }
}
