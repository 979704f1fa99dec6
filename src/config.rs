use crate::context::{is_valid_timefmt, DirectiveConfig, EvaluationContext};
use crate::parser::ParseOptions;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid engine configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid timefmt {0:?} in engine configuration")]
    TimeFormat(String),
}

/// Engine settings, usually loaded from a TOML document such as
///
/// ```toml
/// [parse]
/// attributes = "strict"
///
/// [directives]
/// errmsg = "[oops]"
/// sizefmt = "bytes"
/// encoding = "url"
/// ```
///
/// Missing tables and keys take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub parse: ParseOptions,
    #[serde(default)]
    pub directives: DirectiveConfig,
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        if !is_valid_timefmt(&config.directives.timefmt) {
            return Err(ConfigError::TimeFormat(config.directives.timefmt));
        }
        Ok(config)
    }

    /// A fresh context whose `config` defaults come from this configuration.
    pub fn context(&self) -> EvaluationContext {
        EvaluationContext::with_config(self.directives.clone())
    }
}
