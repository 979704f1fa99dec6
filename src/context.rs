use crate::ast::{Encoding, SizeFmt};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, TimeZone, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_ERRMSG: &str = "[an error occurred while processing this directive]";
pub const DEFAULT_ECHOMSG: &str = "(none)";
pub const DEFAULT_TIMEFMT: &str = "%A, %d-%b-%Y %H:%M:%S %Z";

/// Settings changed by `<!--#config -->`.
///
/// A context keeps two copies: the defaults it was built with, and the live
/// record that directives mutate. The live record is reset to the defaults at
/// the start of every evaluation run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct DirectiveConfig {
    /// Emitted in place of a failed `include`/`flastmod`/`fsize`.
    pub errmsg: String,
    /// Emitted by `echo` for an undefined variable.
    pub echomsg: String,
    pub sizefmt: SizeFmt,
    /// strftime-style pattern for `flastmod` and the date variables.
    pub timefmt: String,
    /// Encoding used by `echo` when the tag names none.
    pub encoding: Encoding,
}

impl Default for DirectiveConfig {
    fn default() -> Self {
        Self {
            errmsg: DEFAULT_ERRMSG.to_string(),
            echomsg: DEFAULT_ECHOMSG.to_string(),
            sizefmt: SizeFmt::default(),
            timefmt: DEFAULT_TIMEFMT.to_string(),
            encoding: Encoding::default(),
        }
    }
}

/// True when every strftime item in `fmt` is recognised.
pub fn is_valid_timefmt(fmt: &str) -> bool {
    !StrftimeItems::new(fmt).any(|item| matches!(item, Item::Error))
}

/// Formats `time` with `fmt`, falling back to the default pattern when `fmt`
/// is not a valid strftime string.
pub fn format_time<Tz>(time: &DateTime<Tz>, fmt: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let fmt = if is_valid_timefmt(fmt) { fmt } else { DEFAULT_TIMEFMT };
    time.format_with_items(StrftimeItems::new(fmt)).to_string()
}

type Fallback = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Variables and configuration threaded through one evaluation run.
///
/// Lookup order: variables set on the context (or by `set`), then the date
/// built-ins, then the optional fallback source.
#[derive(Clone, Default)]
pub struct EvaluationContext {
    vars: HashMap<String, String>,
    defaults: DirectiveConfig,
    config: DirectiveConfig,
    fallback: Option<Fallback>,
    now: Option<DateTime<Utc>>,
}

impl fmt::Debug for EvaluationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationContext")
            .field("vars", &self.vars)
            .field("config", &self.config)
            .field("fallback", &self.fallback.is_some())
            .field("now", &self.now)
            .finish()
    }
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(defaults: DirectiveConfig) -> Self {
        Self {
            config: defaults.clone(),
            defaults,
            ..Self::default()
        }
    }

    /// Consulted for names that are neither set nor built in, e.g. to expose
    /// request or environment variables lazily.
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// Pins the clock used by `DATE_LOCAL` / `DATE_GMT`.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.vars.remove(name)
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    pub fn get(&self, name: &str) -> Option<String> {
        if let Some(value) = self.vars.get(name) {
            return Some(value.clone());
        }
        if let Some(value) = self.builtin(name) {
            return Some(value);
        }
        self.fallback.as_ref().and_then(|f| f(name))
    }

    fn builtin(&self, name: &str) -> Option<String> {
        match name {
            "DATE_LOCAL" | "date_local" => Some(format_time(
                &self.now().with_timezone(&Local),
                &self.config.timefmt,
            )),
            "DATE_GMT" | "date_gmt" => Some(format_time(&self.now(), &self.config.timefmt)),
            _ => None,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    pub fn config(&self) -> &DirectiveConfig {
        &self.config
    }

    /// The live record that `config` directives write to. Callers wanting
    /// different settings pass them to [`with_config`](Self::with_config),
    /// since every run starts by resetting this record to the defaults.
    pub(crate) fn config_mut(&mut self) -> &mut DirectiveConfig {
        &mut self.config
    }

    pub fn defaults(&self) -> &DirectiveConfig {
        &self.defaults
    }

    pub(crate) fn reset_config(&mut self) {
        self.config = self.defaults.clone();
    }
}
