//! Immutable, validated configuration for one bot [`crate::instance::Instance`].
//!
//! Two construction paths share one validation routine: [`ConfigBuilder`]
//! for programmatic assembly, and [`Config::from_env`] for the
//! environment-variable shape hosts typically use in production. Each
//! option has exactly one canonical shape — a builder setter or a
//! single environment variable — never both a list-shaped and a
//! map-shaped variant of the same knob.

use std::env;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Silent,
    Ephemeral,
    /// Host supplies its own ack text; carried as an opaque tag here,
    /// the actual closure lives on the `Handler` collaborator.
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Users,
    Channels,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventBufferBackend {
    InMemory,
    Nats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    InMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimiterBackend {
    InMemory,
    Nats,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub min_ms: u64,
    pub max_ms: u64,
    pub max_attempts: Option<u32>,
    pub jitter_ratio: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_ms: 200,
            max_ms: 30_000,
            max_attempts: None,
            jitter_ratio: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    pub buffer_size: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: 500,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UserCacheConfig {
    pub ttl_ms: u64,
    pub cleanup_interval_ms: u64,
}

impl Default for UserCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            cleanup_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSyncConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub kinds: Vec<SyncKind>,
    pub page_limit: Option<u32>,
}

impl Default for CacheSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 600_000,
            kinds: vec![SyncKind::Users, SyncKind::Channels],
            page_limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_token: String,
    pub bot_token: String,
    pub telemetry_prefix: Vec<String>,
    pub backoff: BackoffConfig,
    pub diagnostics: DiagnosticsConfig,
    pub health_check: HealthCheckConfig,
    pub user_cache: UserCacheConfig,
    pub cache_sync: CacheSyncConfig,
    pub ack_mode: AckMode,
    pub event_buffer_backend: EventBufferBackend,
    pub event_buffer_nats_url: Option<String>,
    pub cache_backend: CacheBackend,
    pub rate_limiter_backend: RateLimiterBackend,
    pub rate_limiter_nats_url: Option<String>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reads `{PREFIX}_APP_TOKEN`, `{PREFIX}_BOT_TOKEN`, and the
    /// remaining knobs from the process environment, falling back to
    /// the same defaults as [`ConfigBuilder`].
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let var = |suffix: &str| env::var(format!("{prefix}_{suffix}"));

        let mut builder = ConfigBuilder::default();
        builder.app_token = var("APP_TOKEN").ok();
        builder.bot_token = var("BOT_TOKEN").ok();
        builder.telemetry_prefix = vec![prefix.to_lowercase()];

        if let Ok(v) = var("BACKOFF_MIN_MS") {
            builder.backoff.min_ms = v.parse().unwrap_or(builder.backoff.min_ms);
        }
        if let Ok(v) = var("BACKOFF_MAX_MS") {
            builder.backoff.max_ms = v.parse().unwrap_or(builder.backoff.max_ms);
        }
        if let Ok(v) = var("BACKOFF_MAX_ATTEMPTS") {
            builder.backoff.max_attempts = v.parse().ok();
        }
        if let Ok(v) = var("BACKOFF_JITTER_RATIO") {
            builder.backoff.jitter_ratio = v.parse().unwrap_or(builder.backoff.jitter_ratio);
        }
        if let Ok(v) = var("DIAGNOSTICS_ENABLED") {
            builder.diagnostics.enabled = parse_bool(&v);
        }
        if let Ok(v) = var("DIAGNOSTICS_BUFFER_SIZE") {
            builder.diagnostics.buffer_size =
                v.parse().unwrap_or(builder.diagnostics.buffer_size);
        }
        if let Ok(v) = var("HEALTH_CHECK_ENABLED") {
            builder.health_check.enabled = parse_bool(&v);
        }
        if let Ok(v) = var("HEALTH_CHECK_INTERVAL_MS") {
            builder.health_check.interval_ms =
                v.parse().unwrap_or(builder.health_check.interval_ms);
        }
        if let Ok(v) = var("USER_CACHE_TTL_MS") {
            builder.user_cache.ttl_ms = v.parse().unwrap_or(builder.user_cache.ttl_ms);
        }
        if let Ok(v) = var("CACHE_SYNC_ENABLED") {
            builder.cache_sync.enabled = parse_bool(&v);
        }
        if let Ok(v) = var("CACHE_SYNC_INTERVAL_MS") {
            builder.cache_sync.interval_ms = v.parse().unwrap_or(builder.cache_sync.interval_ms);
        }
        if let Ok(v) = var("EVENT_BUFFER_BACKEND") {
            builder.event_buffer_backend = match v.to_lowercase().as_str() {
                "nats" => EventBufferBackend::Nats,
                _ => EventBufferBackend::InMemory,
            };
        }
        builder.event_buffer_nats_url = var("EVENT_BUFFER_NATS_URL").ok();

        if let Ok(v) = var("RATE_LIMITER_BACKEND") {
            builder.rate_limiter_backend = match v.to_lowercase().as_str() {
                "nats" => RateLimiterBackend::Nats,
                _ => RateLimiterBackend::InMemory,
            };
        }
        builder.rate_limiter_nats_url = var("RATE_LIMITER_NATS_URL").ok();

        builder.build()
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Typed setter builder; mirrors the fluent `*_from_env`/builder
/// constructors used elsewhere in this codebase, but keeps validation
/// in one terminal `build()` instead of panicking on bad input.
pub struct ConfigBuilder {
    app_token: Option<String>,
    bot_token: Option<String>,
    telemetry_prefix: Vec<String>,
    backoff: BackoffConfig,
    diagnostics: DiagnosticsConfig,
    health_check: HealthCheckConfig,
    user_cache: UserCacheConfig,
    cache_sync: CacheSyncConfig,
    ack_mode: AckMode,
    event_buffer_backend: EventBufferBackend,
    event_buffer_nats_url: Option<String>,
    cache_backend: CacheBackend,
    rate_limiter_backend: RateLimiterBackend,
    rate_limiter_nats_url: Option<String>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            app_token: None,
            bot_token: None,
            telemetry_prefix: vec!["boltframe".to_string()],
            backoff: BackoffConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            health_check: HealthCheckConfig::default(),
            user_cache: UserCacheConfig::default(),
            cache_sync: CacheSyncConfig::default(),
            ack_mode: AckMode::Silent,
            event_buffer_backend: EventBufferBackend::InMemory,
            event_buffer_nats_url: None,
            cache_backend: CacheBackend::InMemory,
            rate_limiter_backend: RateLimiterBackend::InMemory,
            rate_limiter_nats_url: None,
        }
    }
}

impl ConfigBuilder {
    pub fn app_token(mut self, token: impl Into<String>) -> Self {
        self.app_token = Some(token.into());
        self
    }

    pub fn bot_token(mut self, token: impl Into<String>) -> Self {
        self.bot_token = Some(token.into());
        self
    }

    pub fn telemetry_prefix(mut self, segments: Vec<String>) -> Self {
        self.telemetry_prefix = segments;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn diagnostics(mut self, diagnostics: DiagnosticsConfig) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.health_check = health_check;
        self
    }

    pub fn user_cache(mut self, user_cache: UserCacheConfig) -> Self {
        self.user_cache = user_cache;
        self
    }

    pub fn cache_sync(mut self, cache_sync: CacheSyncConfig) -> Self {
        self.cache_sync = cache_sync;
        self
    }

    pub fn ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn event_buffer_backend(mut self, backend: EventBufferBackend) -> Self {
        self.event_buffer_backend = backend;
        self
    }

    pub fn event_buffer_nats_url(mut self, url: impl Into<String>) -> Self {
        self.event_buffer_nats_url = Some(url.into());
        self
    }

    pub fn rate_limiter_backend(mut self, backend: RateLimiterBackend) -> Self {
        self.rate_limiter_backend = backend;
        self
    }

    pub fn rate_limiter_nats_url(mut self, url: impl Into<String>) -> Self {
        self.rate_limiter_nats_url = Some(url.into());
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        if self.backoff.min_ms > self.backoff.max_ms {
            return Err(ConfigError::InvalidBackoffWindow {
                min_ms: self.backoff.min_ms,
                max_ms: self.backoff.max_ms,
            });
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter_ratio) {
            return Err(ConfigError::InvalidJitterRatio(self.backoff.jitter_ratio));
        }
        if self.cache_sync.enabled && self.cache_sync.kinds.is_empty() {
            return Err(ConfigError::EmptySyncKinds);
        }
        let app_token = self.app_token.ok_or(ConfigError::MissingOption {
            name: "app_token",
        })?;
        let bot_token = self.bot_token.ok_or(ConfigError::MissingOption {
            name: "bot_token",
        })?;

        for (name, value) in [
            ("backoff.min_ms", self.backoff.min_ms as i64),
            ("health_check.interval_ms", self.health_check.interval_ms as i64),
            ("user_cache.ttl_ms", self.user_cache.ttl_ms as i64),
            ("cache_sync.interval_ms", self.cache_sync.interval_ms as i64),
        ] {
            if value <= 0 {
                return Err(ConfigError::NonPositiveDuration { name, value });
            }
        }

        Ok(Config {
            app_token,
            bot_token,
            telemetry_prefix: self.telemetry_prefix,
            backoff: self.backoff,
            diagnostics: self.diagnostics,
            health_check: self.health_check,
            user_cache: self.user_cache,
            cache_sync: self.cache_sync,
            ack_mode: self.ack_mode,
            event_buffer_backend: self.event_buffer_backend,
            event_buffer_nats_url: self.event_buffer_nats_url,
            cache_backend: self.cache_backend,
            rate_limiter_backend: self.rate_limiter_backend,
            rate_limiter_nats_url: self.rate_limiter_nats_url,
        })
    }
}

impl BackoffConfig {
    pub fn min_duration(&self) -> Duration {
        Duration::from_millis(self.min_ms)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_tokens() {
        let err = Config::builder().build().unwrap_err();
        assert!(matches!(err, ConfigError::MissingOption { name: "app_token" }));
    }

    #[test]
    fn builder_rejects_inverted_backoff_window() {
        let err = Config::builder()
            .app_token("a")
            .bot_token("b")
            .backoff(BackoffConfig {
                min_ms: 5_000,
                max_ms: 1_000,
                max_attempts: None,
                jitter_ratio: 0.2,
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBackoffWindow { .. }));
    }

    #[test]
    fn builder_rejects_out_of_range_jitter() {
        let err = Config::builder()
            .app_token("a")
            .bot_token("b")
            .backoff(BackoffConfig {
                jitter_ratio: 1.5,
                ..BackoffConfig::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidJitterRatio(_)));
    }

    #[test]
    fn builder_rejects_empty_sync_kinds_when_enabled() {
        let err = Config::builder()
            .app_token("a")
            .bot_token("b")
            .cache_sync(CacheSyncConfig {
                enabled: true,
                kinds: vec![],
                ..CacheSyncConfig::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptySyncKinds));
    }

    #[test]
    fn builder_succeeds_with_required_tokens() {
        let cfg = Config::builder()
            .app_token("xapp-1")
            .bot_token("xoxb-1")
            .build()
            .unwrap();
        assert_eq!(cfg.app_token, "xapp-1");
        assert_eq!(cfg.bot_token, "xoxb-1");
    }
}
