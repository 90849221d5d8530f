//! Logging switches and their providers.
//!
//! The middleware never caches configuration: every decision asks the injected
//! [`ConfigProvider`] for the current [`LogOptions`]. [`ReloadableConfig`] swaps whole
//! snapshots atomically, so a reload is observed by the next decision without ever exposing
//! a half-updated allow-list.

use arc_swap::ArcSwap;
use serde::Deserialize;
use std::{path::Path, sync::Arc};

/// Default maximum body length to log, in bytes.
pub const DEFAULT_BODY_MAX_LEN: i64 = 2048;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Current values of the `log.*` switches.
///
/// Field names match the keys of the `[log]` configuration group.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// Log the raw request query string
    pub query: bool,
    /// Capture and log the request body
    pub reqbody: bool,
    /// Capture and log the response body
    pub respbody: bool,
    /// Log the request headers
    pub reqheaders: bool,
    /// Log the response headers
    pub respheaders: bool,
    /// Maximum body length to log; `<= 0` means unlimited
    pub bodymaxlen: i64,
    /// Content types whose bodies may be logged (`type/*`, `*/subtype` and `*` allowed)
    pub bodytypes: Vec<String>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            query: false,
            reqbody: false,
            respbody: false,
            reqheaders: false,
            respheaders: false,
            bodymaxlen: DEFAULT_BODY_MAX_LEN,
            bodytypes: vec![
                "application/json".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            ],
        }
    }
}

impl LogOptions {
    /// Options with every switch turned on and the default limits.
    pub fn all() -> Self {
        Self {
            query: true,
            reqbody: true,
            respbody: true,
            reqheaders: true,
            respheaders: true,
            ..Self::default()
        }
    }

    /// Check that every allow-list entry has a `type/subtype` shape (or is `*`).
    pub fn validate(&self) -> Result<(), ConfigError> {
        for pattern in &self.bodytypes {
            if pattern != "*" && !pattern.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "body type pattern '{pattern}' is not of the form type/subtype"
                )));
            }
        }
        Ok(())
    }

    /// Parse options from a TOML document containing a `[log]` table.
    ///
    /// ```rust
    /// use periscope::LogOptions;
    ///
    /// let options = LogOptions::from_toml_str(r#"
    ///     [log]
    ///     reqbody = true
    ///     bodytypes = ["text/*"]
    /// "#).unwrap();
    /// assert!(options.reqbody);
    /// assert_eq!(options.bodymaxlen, 2048);
    /// ```
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct Document {
            log: LogOptions,
        }

        let document: Document = toml::from_str(content)?;
        document.log.validate()?;
        Ok(document.log)
    }
}

/// Source of the current logging options.
///
/// Implementations must be cheap to call: the middleware asks for the current options on
/// every request, once when wrapping and once when collecting.
pub trait ConfigProvider: Send + Sync + 'static {
    /// Return the options in effect right now.
    fn current(&self) -> Arc<LogOptions>;
}

/// A provider that always returns the same options.
#[derive(Clone, Debug, Default)]
pub struct StaticConfig(Arc<LogOptions>);

impl StaticConfig {
    pub fn new(options: LogOptions) -> Self {
        Self(Arc::new(options))
    }
}

impl ConfigProvider for StaticConfig {
    fn current(&self) -> Arc<LogOptions> {
        self.0.clone()
    }
}

/// A provider whose options can be replaced at runtime.
#[derive(Debug)]
pub struct ReloadableConfig {
    options: ArcSwap<LogOptions>,
}

impl ReloadableConfig {
    pub fn new(options: LogOptions) -> Self {
        Self {
            options: ArcSwap::from_pointee(options),
        }
    }

    /// Load initial options from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::new(LogOptions::from_toml_str(&content)?))
    }

    /// Replace the options wholesale.
    pub fn store(&self, options: LogOptions) {
        self.options.store(Arc::new(options));
    }

    /// Apply a modification to a copy of the current options and publish it.
    pub fn update(&self, f: impl Fn(&mut LogOptions)) {
        self.options.rcu(|current| {
            let mut next = LogOptions::clone(current);
            f(&mut next);
            next
        });
    }

    /// Re-read options from a TOML document. On error the current options stay in place.
    pub fn reload_from_toml(&self, content: &str) -> Result<(), ConfigError> {
        let options = LogOptions::from_toml_str(content)?;
        tracing::info!(?options, "Reloaded logging options");
        self.store(options);
        Ok(())
    }
}

impl Default for ReloadableConfig {
    fn default() -> Self {
        Self::new(LogOptions::default())
    }
}

impl ConfigProvider for ReloadableConfig {
    fn current(&self) -> Arc<LogOptions> {
        self.options.load_full()
    }
}

impl<P: ConfigProvider> ConfigProvider for Arc<P> {
    fn current(&self) -> Arc<LogOptions> {
        P::current(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = LogOptions::default();
        assert!(!options.query);
        assert!(!options.reqbody);
        assert!(!options.respbody);
        assert!(!options.reqheaders);
        assert!(!options.respheaders);
        assert_eq!(options.bodymaxlen, 2048);
        assert_eq!(
            options.bodytypes,
            vec!["application/json", "application/x-www-form-urlencoded"]
        );
    }

    #[test]
    fn test_from_toml_partial_table() {
        let options = LogOptions::from_toml_str(
            r#"
            [log]
            query = true
            respbody = true
            bodymaxlen = 0
            "#,
        )
        .unwrap();

        assert!(options.query);
        assert!(options.respbody);
        assert!(!options.reqbody);
        assert_eq!(options.bodymaxlen, 0);
        assert_eq!(options.bodytypes, LogOptions::default().bodytypes);
    }

    #[test]
    fn test_from_toml_missing_table_uses_defaults() {
        let options = LogOptions::from_toml_str("").unwrap();
        assert_eq!(options, LogOptions::default());
    }

    #[test]
    fn test_from_toml_rejects_bad_pattern() {
        let err = LogOptions::from_toml_str("[log]\nbodytypes = [\"json\"]").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = LogOptions::from_toml_str("[log]\nquery = \"yes\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_reloadable_config() {
        let config = ReloadableConfig::default();
        assert!(!config.current().reqbody);

        config.update(|options| options.reqbody = true);
        assert!(config.current().reqbody);

        config
            .reload_from_toml("[log]\nrespheaders = true\nbodytypes = [\"*\"]")
            .unwrap();
        let current = config.current();
        assert!(current.respheaders);
        assert!(!current.reqbody);
        assert_eq!(current.bodytypes, vec!["*"]);

        // A failed reload keeps the previous snapshot
        assert!(config.reload_from_toml("[log]\nbodymaxlen = \"big\"").is_err());
        assert!(config.current().respheaders);
    }

    #[test]
    fn test_snapshot_survives_reload() {
        let config = ReloadableConfig::new(LogOptions::all());
        let before = config.current();
        config.store(LogOptions::default());
        assert!(before.query);
        assert!(!config.current().query);
    }
}
