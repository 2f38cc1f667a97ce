//! Runtime configuration.
//!
//! ```
//! use oxifw::RuntimeConfig;
//!
//! let config = RuntimeConfig::default()
//!     .with_max_forwarding_depth(8)
//!     .with_eager_dtable_rebuild(true);
//! assert_eq!(config.max_forwarding_depth, 8);
//! ```

use crate::error::{Error, Result};
use oxifw_log::Level;

/// Default limit on nested forwarding before a loop is reported.
pub const DEFAULT_MAX_FORWARDING_DEPTH: u32 = 32;

/// Environment variable overriding [`RuntimeConfig::max_forwarding_depth`].
pub const ENV_MAX_FORWARD_DEPTH: &str = "OXIFW_MAX_FORWARD_DEPTH";

/// Environment variable overriding [`RuntimeConfig::eager_dtable_rebuild`].
pub const ENV_EAGER_DTABLE: &str = "OXIFW_EAGER_DTABLE";

/// Tunables for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Nested forwarding depth at which dispatch reports a loop.
    pub max_forwarding_depth: u32,
    /// Rebuild dispatch tables right after invalidation instead of on the
    /// next send.
    pub eager_dtable_rebuild: bool,
    /// Log level applied to the global logger when the runtime is created.
    pub log_level: Option<Level>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_forwarding_depth: DEFAULT_MAX_FORWARDING_DEPTH,
            eager_dtable_rebuild: false,
            log_level: None,
        }
    }
}

impl RuntimeConfig {
    /// Sets [`Self::max_forwarding_depth`].
    #[must_use]
    pub fn with_max_forwarding_depth(mut self, depth: u32) -> Self {
        self.max_forwarding_depth = depth;
        self
    }

    /// Sets [`Self::eager_dtable_rebuild`].
    #[must_use]
    pub fn with_eager_dtable_rebuild(mut self, eager: bool) -> Self {
        self.eager_dtable_rebuild = eager;
        self
    }

    /// Sets [`Self::log_level`].
    #[must_use]
    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Builds a configuration from `OXIFW_LOG`, `OXIFW_MAX_FORWARD_DEPTH`
    /// and `OXIFW_EAGER_DTABLE`, falling back to defaults for unset ones.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a value that does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup(oxifw_log::ENV_VAR) {
            let level = raw.parse().map_err(|_| Error::InvalidConfig {
                key: oxifw_log::ENV_VAR,
                value: raw.clone(),
            })?;
            config.log_level = Some(level);
        }

        if let Some(raw) = lookup(ENV_MAX_FORWARD_DEPTH) {
            config.max_forwarding_depth =
                raw.trim().parse().map_err(|_| Error::InvalidConfig {
                    key: ENV_MAX_FORWARD_DEPTH,
                    value: raw.clone(),
                })?;
        }

        if let Some(raw) = lookup(ENV_EAGER_DTABLE) {
            config.eager_dtable_rebuild = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(Error::InvalidConfig {
                        key: ENV_EAGER_DTABLE,
                        value: raw,
                    });
                }
            };
        }

        Ok(config)
    }
}
