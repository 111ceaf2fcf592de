//! Environment-driven configuration.
//!
//! Every setting has a default. A variable that is set but cannot be parsed,
//! or falls outside its valid range, is an error rather than a silent default.

use crate::denylist::{Denylist, DEFAULT_BANNED_PHRASES};
use crate::error::{MarketContextError, Result};
use crate::llm::{CallPolicy, RateLimits};
use crate::numeric::NumericFidelityChecker;
use crate::pipeline::PipelineSettings;
use crate::schema::SchemaLimits;
use crate::validator::Validator;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiSettings {
    /// Required only when the OpenAI client is constructed.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    pub documents_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub snapshot_max_age: Duration,
    /// Never write fetched snapshots to disk.
    pub pin_snapshots: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub openai: OpenAiSettings,
    pub rate_limits: RateLimits,
    pub call_policy: CallPolicy,
    pub pipeline: PipelineSettings,
    pub numeric_tolerance: f64,
    /// Replaces the default denylist when `BANNED_PHRASES` is set.
    pub banned_phrases: Vec<String>,
    pub schema_limits: SchemaLimits,
    pub storage: StorageSettings,
    pub bind_addr: SocketAddr,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, e.g. a map in tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let openai = OpenAiSettings {
            api_key: env.string("OPENAI_API_KEY"),
            base_url: env
                .string("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: env.string("OPENAI_MODEL").unwrap_or_else(|| "gpt-4".to_string()),
            max_tokens: env.parse("OPENAI_MAX_TOKENS", 2000)?,
            temperature: env.parse("OPENAI_TEMPERATURE", 0.0)?,
        };

        let rate_limits = RateLimits {
            requests_per_window: env.parse("RATE_LIMIT_REQUESTS_PER_MINUTE", 50)?,
            tokens_per_window: env.parse("RATE_LIMIT_TOKENS_PER_MINUTE", 40_000)?,
            max_concurrent: env.parse("RATE_LIMIT_MAX_CONCURRENT", 5)?,
            window: Duration::from_secs(60),
        };

        let call_policy = CallPolicy {
            timeout: Duration::from_secs(env.parse("LLM_CALL_TIMEOUT_SECS", 60)?),
            max_retries: env.parse("RATE_LIMIT_MAX_RETRIES", 3)?,
            base_backoff: env.seconds("RATE_LIMIT_BASE_BACKOFF", 1.0)?,
            max_jitter: Duration::from_secs(1),
        };

        let pipeline = PipelineSettings {
            revision_budget: env.parse("REVISION_BUDGET", 1)?,
            top_k: env.parse("RETRIEVAL_TOP_K", 2)?,
            temperature: openai.temperature,
        };

        let defaults = SchemaLimits::default();
        let schema_limits = SchemaLimits {
            headline_max_words: env.parse("HEADLINE_MAX_WORDS", defaults.headline_max_words)?,
            narrative_min_words: env.parse("NARRATIVE_MIN_WORDS", defaults.narrative_min_words)?,
            narrative_max_words: env.parse("NARRATIVE_MAX_WORDS", defaults.narrative_max_words)?,
            ..defaults
        };

        let banned_phrases = match env.string("BANNED_PHRASES") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            None => DEFAULT_BANNED_PHRASES.iter().map(|p| p.to_string()).collect(),
        };

        let storage = StorageSettings {
            documents_dir: env
                .string("DOCUMENTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/documents")),
            snapshot_dir: env
                .string("SNAPSHOT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/snapshot")),
            snapshot_max_age: Duration::from_secs(env.parse("SNAPSHOT_MAX_AGE", 3600)?),
            pin_snapshots: env.flag("PIN_SNAPSHOTS", false)?,
        };

        let config = Self {
            openai,
            rate_limits,
            call_policy,
            pipeline,
            numeric_tolerance: env.parse("NUMERIC_TOLERANCE", 0.01)?,
            banned_phrases,
            schema_limits,
            storage,
            bind_addr: env.parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8000)))?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check(
            "RATE_LIMIT_REQUESTS_PER_MINUTE",
            self.rate_limits.requests_per_window >= 1,
            "must be at least 1",
        )?;
        check(
            "RATE_LIMIT_TOKENS_PER_MINUTE",
            self.rate_limits.tokens_per_window >= 1,
            "must be at least 1",
        )?;
        check(
            "RATE_LIMIT_MAX_CONCURRENT",
            self.rate_limits.max_concurrent >= 1,
            "must be at least 1",
        )?;
        check(
            "LLM_CALL_TIMEOUT_SECS",
            !self.call_policy.timeout.is_zero(),
            "must be at least 1 second",
        )?;
        check(
            "NUMERIC_TOLERANCE",
            self.numeric_tolerance.is_finite() && (0.0..1.0).contains(&self.numeric_tolerance),
            "must be in [0, 1)",
        )?;
        check(
            "OPENAI_TEMPERATURE",
            (0.0..=2.0).contains(&self.openai.temperature),
            "must be between 0 and 2",
        )?;
        check(
            "BANNED_PHRASES",
            !self.banned_phrases.is_empty(),
            "must name at least one phrase",
        )?;
        check(
            "NARRATIVE_MAX_WORDS",
            self.schema_limits.narrative_min_words <= self.schema_limits.narrative_max_words,
            "must not be below NARRATIVE_MIN_WORDS",
        )?;
        check(
            "HEADLINE_MAX_WORDS",
            self.schema_limits.headline_max_words >= 1,
            "must be at least 1",
        )?;
        check("RETRIEVAL_TOP_K", self.pipeline.top_k >= 1, "must be at least 1")?;
        check("OPENAI_MAX_TOKENS", self.openai.max_tokens >= 1, "must be at least 1")?;
        Ok(())
    }

    pub fn validator(&self) -> Validator {
        Validator::new(
            self.schema_limits.clone(),
            NumericFidelityChecker::new(self.numeric_tolerance),
            Denylist::new(&self.banned_phrases),
        )
    }

    pub fn require_api_key(&self) -> Result<&str> {
        self.openai
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| config_error("OPENAI_API_KEY", "is required"))
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e| config_error(key, &format!("cannot parse '{}': {}", raw, e))),
        }
    }

    fn seconds(&self, key: &str, default: f64) -> Result<Duration> {
        let secs: f64 = self.parse(key, default)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|_| config_error(key, &format!("'{}' is not a valid number of seconds", secs)))
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(config_error(key, &format!("'{}' is not a boolean", raw))),
            },
        }
    }
}

fn check(key: &str, ok: bool, details: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(config_error(key, details))
    }
}

fn config_error(key: &str, details: &str) -> MarketContextError {
    MarketContextError::Config {
        key: key.to_string(),
        details: details.to_string(),
    }
}
