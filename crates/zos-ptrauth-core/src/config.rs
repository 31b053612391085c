//! Runtime policy for pointer authentication
//!
//! Loaded once at boot from a JSON document; every field has a default so
//! an empty object `{}` is a valid policy.

use alloc::string::ToString;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Anomaly report rate limit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimit {
    /// Reports allowed per window
    pub max_reports: u64,
    /// Window length in nanoseconds
    pub window_ns: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_reports: 8,
            window_ns: 1_000_000_000,
        }
    }
}

/// Pointer authentication policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtrAuthPolicy {
    /// System-wide switch: export raw pointers and stop authenticating imported ones
    pub user_jop_disabled: bool,
    /// Reject sigreturn states whose token does not match
    pub enforce_sigreturn_token: bool,
    /// Pin kernel-signed pc/lr in exception replies to their delivered values
    pub pin_exception_reply_pointers: bool,
    pub anomaly_rate_limit: RateLimit,
}

impl Default for PtrAuthPolicy {
    fn default() -> Self {
        Self {
            user_jop_disabled: false,
            enforce_sigreturn_token: true,
            pin_exception_reply_pointers: true,
            anomaly_rate_limit: RateLimit::default(),
        }
    }
}

impl PtrAuthPolicy {
    /// Parse and validate a policy document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let policy: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.anomaly_rate_limit.window_ns == 0 {
            return Err(ConfigError::ZeroRateWindow);
        }
        Ok(())
    }
}
