//! Accept cycle configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! | Variable                     | Default | Meaning                          |
//! |------------------------------|---------|----------------------------------|
//! | `KACCEPT_BUFFER_SIZE`        | 4096    | initial native buffer size       |
//! | `KACCEPT_STRICT`             | 0       | panic on rejected resolves       |
//! | `KACCEPT_BAD_REQUEST_STATUS` | 400     | status sent on failed validation |
//!
//! ```rust,ignore
//! let config = AcceptConfig::from_env().default_buffer_size(16 * 1024);
//! config.validate()?;
//! ```

use kaccept_core::native::HEADER_SIZE;
use std::str::FromStr;

pub mod defaults {
    pub const BUFFER_SIZE: usize = 4096;
    pub const STRICT_INVARIANTS: bool = false;
    pub const BAD_REQUEST_STATUS: u16 = 400;
}

#[inline]
fn env_get<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[inline]
fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct AcceptConfig {
    /// Size of the first buffer posted for a new request.
    pub default_buffer_size: usize,
    /// Panic instead of warning when the bridge rejects a resolve.
    pub strict_invariants: bool,
    /// Status sent to the client when request validation fails.
    pub bad_request_status: u16,
}

impl Default for AcceptConfig {
    fn default() -> Self {
        Self {
            default_buffer_size: defaults::BUFFER_SIZE,
            strict_invariants: defaults::STRICT_INVARIANTS,
            bad_request_status: defaults::BAD_REQUEST_STATUS,
        }
    }
}

impl AcceptConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with `KACCEPT_*` environment overrides.
    pub fn from_env() -> Self {
        Self {
            default_buffer_size: env_get("KACCEPT_BUFFER_SIZE", defaults::BUFFER_SIZE),
            strict_invariants: env_get_bool("KACCEPT_STRICT", defaults::STRICT_INVARIANTS),
            bad_request_status: env_get("KACCEPT_BAD_REQUEST_STATUS", defaults::BAD_REQUEST_STATUS),
        }
    }

    pub fn default_buffer_size(mut self, n: usize) -> Self {
        self.default_buffer_size = n;
        self
    }

    pub fn strict_invariants(mut self, enable: bool) -> Self {
        self.strict_invariants = enable;
        self
    }

    pub fn bad_request_status(mut self, status: u16) -> Self {
        self.bad_request_status = status;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.default_buffer_size < HEADER_SIZE {
            return Err("default_buffer_size smaller than the request header");
        }
        if !(400..600).contains(&self.bad_request_status) {
            return Err("bad_request_status must be a 4xx or 5xx status");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = AcceptConfig::default();
        assert_eq!(c.default_buffer_size, 4096);
        assert!(!c.strict_invariants);
        assert_eq!(c.bad_request_status, 400);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_builder_and_validate() {
        let c = AcceptConfig::new().default_buffer_size(4);
        assert!(c.validate().is_err());
        let c = AcceptConfig::new().bad_request_status(200);
        assert!(c.validate().is_err());
        let c = AcceptConfig::new().strict_invariants(true).bad_request_status(422);
        assert!(c.strict_invariants);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("KACCEPT_TEST_ONLY_SIZE", "8192");
        assert_eq!(env_get("KACCEPT_TEST_ONLY_SIZE", 1usize), 8192);
        assert_eq!(env_get("KACCEPT_TEST_ONLY_MISSING", 7usize), 7);
        std::env::set_var("KACCEPT_TEST_ONLY_FLAG", "yes");
        assert!(env_get_bool("KACCEPT_TEST_ONLY_FLAG", false));
    }
}
