use std::{path::PathBuf, time::Duration};

use warp::http::uri::Authority;

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 4000;
pub const DEFAULT_MAX_NAME_CHARS: usize = 100;
pub const DEFAULT_RATE_LIMIT_MAX: u32 = 6;
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which origins may call the relay from a browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigin {
    Any,
    Exact(String),
}

/// The fixed issue whose comments make up the chat log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLimits {
    pub max_message_chars: usize,
    pub max_name_chars: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        MessageLimits {
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            max_name_chars: DEFAULT_MAX_NAME_CHARS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        RateLimit {
            max_requests: DEFAULT_RATE_LIMIT_MAX,
            window: DEFAULT_RATE_LIMIT_WINDOW,
        }
    }
}

/// Everything the relay needs, read once at startup and never mutated.
#[derive(Clone)]
pub struct Config {
    pub access_token: String,
    pub thread: Thread,
    pub allowed_origin: AllowedOrigin,
    pub port: u16,
    pub api_base: String,
    pub static_dir: Option<PathBuf>,
    pub limits: MessageLimits,
    pub rate_limit: RateLimit,
    pub store_timeout: Duration,
}

// Keep the token out of debug output.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("access_token", &"<redacted>")
            .field("thread", &self.thread)
            .field("allowed_origin", &self.allowed_origin)
            .field("port", &self.port)
            .field("api_base", &self.api_base)
            .field("static_dir", &self.static_dir)
            .field("limits", &self.limits)
            .field("rate_limit", &self.rate_limit)
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        Config::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let access_token = require("ACCESS_TOKEN")?;
        let owner = require("STORE_OWNER")?;
        let repo = require("STORE_REPO")?;
        let number: u64 = parse("THREAD_ID", &require("THREAD_ID")?)?;
        if number == 0 {
            return Err(invalid("THREAD_ID", "must be a positive issue number"));
        }

        let allowed_origin = match get("ALLOWED_ORIGIN") {
            None => AllowedOrigin::Any,
            Some(origin) if origin == "*" => AllowedOrigin::Any,
            Some(origin) => AllowedOrigin::Exact(check_origin(origin)?),
        };

        let port = optional(&get, "PORT", DEFAULT_PORT, |v| parse("PORT", v))?;
        let api_base = get("STORE_API_BASE")
            .unwrap_or_else(|| DEFAULT_API_BASE.to_owned())
            .trim_end_matches('/')
            .to_owned();

        let limits = MessageLimits {
            max_message_chars: optional(&get, "MAX_MESSAGE_CHARS", DEFAULT_MAX_MESSAGE_CHARS, |v| {
                positive("MAX_MESSAGE_CHARS", v)
            })?,
            max_name_chars: optional(&get, "MAX_NAME_CHARS", DEFAULT_MAX_NAME_CHARS, |v| {
                positive("MAX_NAME_CHARS", v)
            })?,
        };
        let rate_limit = RateLimit {
            max_requests: optional(&get, "RATE_LIMIT_MAX", DEFAULT_RATE_LIMIT_MAX, |v| {
                positive("RATE_LIMIT_MAX", v)
            })?,
            window: optional(&get, "RATE_LIMIT_WINDOW", DEFAULT_RATE_LIMIT_WINDOW, |v| {
                duration("RATE_LIMIT_WINDOW", v)
            })?,
        };
        let store_timeout = optional(&get, "STORE_TIMEOUT", DEFAULT_STORE_TIMEOUT, |v| {
            duration("STORE_TIMEOUT", v)
        })?;

        Ok(Config {
            access_token,
            thread: Thread {
                owner,
                repo,
                number,
            },
            allowed_origin,
            port,
            api_base,
            static_dir: get("STATIC_DIR").map(PathBuf::from),
            limits,
            rate_limit,
            store_timeout,
        })
    }
}

fn invalid(var: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        reason: reason.into(),
    }
}

fn optional<T, G, P>(get: &G, key: &'static str, default: T, parse: P) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Result<T, ConfigError>,
{
    match get(key) {
        Some(value) => parse(&value),
        None => Ok(default),
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| invalid(var, e.to_string()))
}

fn positive<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + Default + PartialEq,
    T::Err: std::fmt::Display,
{
    let n: T = parse(var, value)?;
    if n == T::default() {
        return Err(invalid(var, "must be greater than zero"));
    }
    Ok(n)
}

fn duration(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let d = humantime::parse_duration(value).map_err(|e| invalid(var, e.to_string()))?;
    if d.is_zero() {
        return Err(invalid(var, "must be longer than zero"));
    }
    Ok(d)
}

// warp panics on an origin it cannot parse, so reject those here.
fn check_origin(origin: String) -> Result<String, ConfigError> {
    let bad = |reason: &str| {
        invalid(
            "ALLOWED_ORIGIN",
            format!("{}; expected `*` or an origin such as https://example.com", reason),
        )
    };
    let host = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .ok_or_else(|| bad("scheme must be http or https"))?;
    if host.contains(|c| matches!(c, '/' | '?' | '#' | '@')) {
        return Err(bad("origin must not carry a path, query or credentials"));
    }

    let authority: Authority = host.parse::<Authority>().map_err(|e| bad(&e.to_string()))?;
    if authority.host().is_empty() {
        return Err(bad("missing host"));
    }
    // `Authority` tolerates a non-numeric port; warp does not.
    let text = authority.as_str();
    if let Some(colon) = text.rfind(':') {
        if !text[colon..].contains(']') && authority.port_u16().is_none() {
            return Err(bad("port must be a number"));
        }
    }
    Ok(origin)
}
