use podcaster_core::persona::HostPersona;
use podcaster_core::store::CONVERSATION_STREAM;
use podcaster_core::turn::TurnConfig;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Defines the supported backends for dialogue generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
    /// Deterministic local generator, no API key needed.
    Mock,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub store_url: String,
    pub persona_path: PathBuf,
    /// Overrides the default `host_<persona id>`.
    pub agent_id: Option<String>,
    pub lock_ttl: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub retry_interval: Duration,
    pub node_wait: Duration,
    pub generation_timeout: Duration,
    pub transcript_stream: String,
    pub provider: Provider,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub chat_model: String,
    pub log_level: Level,
}

/// Reads `name` and parses it, falling back to `default` when unset.
fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let store_url =
            std::env::var("STORE_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let persona_path = std::env::var("HOST_PERSONA_PATH")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::MissingVar("HOST_PERSONA_PATH".to_string()))?;

        let agent_id = std::env::var("AGENT_ID").ok().filter(|id| !id.trim().is_empty());

        let lock_ttl_secs: u64 = parse_var("LOCK_TTL_SECS", 5)?;
        if lock_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "LOCK_TTL_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        let backoff_min_ms: u64 = parse_var("BACKOFF_MIN_MS", 1000)?;
        let backoff_max_ms: u64 = parse_var("BACKOFF_MAX_MS", 2000)?;
        if backoff_min_ms > backoff_max_ms {
            return Err(ConfigError::InvalidValue(
                "BACKOFF_MIN_MS".to_string(),
                format!("{backoff_min_ms} exceeds BACKOFF_MAX_MS ({backoff_max_ms})"),
            ));
        }
        let retry_interval_ms: u64 = parse_var("RETRY_INTERVAL_MS", 500)?;
        let node_wait_ms: u64 = parse_var("NODE_WAIT_MS", 1000)?;
        let generation_timeout_secs: u64 = parse_var("GENERATION_TIMEOUT_SECS", 4)?;
        // A turn must finish generating while it still holds the stick.
        if generation_timeout_secs >= lock_ttl_secs {
            return Err(ConfigError::InvalidValue(
                "GENERATION_TIMEOUT_SECS".to_string(),
                format!("{generation_timeout_secs} must be less than LOCK_TTL_SECS ({lock_ttl_secs})"),
            ));
        }

        let transcript_stream = std::env::var("TRANSCRIPT_STREAM")
            .unwrap_or_else(|_| CONVERSATION_STREAM.to_string());

        let provider_str =
            std::env::var("GENERATOR_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "gemini" => Provider::Gemini,
            "mock" => Provider::Mock,
            _ => Provider::OpenAI,
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok();

        let chat_model = std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        match provider {
            Provider::OpenAI => {
                if openai_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                    ));
                }
            }
            Provider::Gemini => {
                if gemini_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
                    ));
                }
            }
            Provider::Mock => {}
        }

        Ok(Self {
            store_url,
            persona_path,
            agent_id,
            lock_ttl: Duration::from_secs(lock_ttl_secs),
            backoff_min: Duration::from_millis(backoff_min_ms),
            backoff_max: Duration::from_millis(backoff_max_ms),
            retry_interval: Duration::from_millis(retry_interval_ms),
            node_wait: Duration::from_millis(node_wait_ms),
            generation_timeout: Duration::from_secs(generation_timeout_secs),
            transcript_stream,
            provider,
            openai_api_key,
            gemini_api_key,
            chat_model,
            log_level,
        })
    }

    /// The id this host acquires the talking stick and writes the transcript under.
    pub fn agent_id_for(&self, persona: &HostPersona) -> String {
        self.agent_id
            .clone()
            .unwrap_or_else(|| format!("host_{}", persona.id))
    }

    pub fn turn_config(&self) -> TurnConfig {
        TurnConfig {
            lock_ttl: self.lock_ttl,
            backoff_min: self.backoff_min,
            backoff_max: self.backoff_max,
            contention_retry: self.retry_interval,
            node_wait: self.node_wait,
            generation_timeout: self.generation_timeout,
            transcript_stream: self.transcript_stream.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VARS: &[&str] = &[
        "STORE_URL",
        "HOST_PERSONA_PATH",
        "AGENT_ID",
        "LOCK_TTL_SECS",
        "BACKOFF_MIN_MS",
        "BACKOFF_MAX_MS",
        "RETRY_INTERVAL_MS",
        "NODE_WAIT_MS",
        "GENERATION_TIMEOUT_SECS",
        "TRANSCRIPT_STREAM",
        "GENERATOR_PROVIDER",
        "OPENAI_API_KEY",
        "GEMINI_API_KEY",
        "CHAT_MODEL",
        "RUST_LOG",
    ];

    fn clear_env_vars() {
        unsafe {
            for var in VARS {
                env::remove_var(var);
            }
        }
    }

    fn set_minimal_env_mock() {
        unsafe {
            env::set_var("HOST_PERSONA_PATH", "/etc/podcaster/sascha.json");
            env::set_var("GENERATOR_PROVIDER", "mock");
        }
    }

    fn expect_invalid(expected_var: &str) {
        match Config::from_env().unwrap_err() {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, expected_var),
            other => panic!("Expected InvalidValue for {expected_var}, got {other:?}"),
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_defaults() {
        clear_env_vars();
        set_minimal_env_mock();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.store_url, "redis://127.0.0.1:6379");
        assert_eq!(config.persona_path, PathBuf::from("/etc/podcaster/sascha.json"));
        assert_eq!(config.agent_id, None);
        assert_eq!(config.provider, Provider::Mock);
        assert_eq!(config.chat_model, "gpt-4o");
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.transcript_stream, "conversation_stream");

        let turn = config.turn_config();
        assert_eq!(turn.lock_ttl, Duration::from_secs(5));
        assert_eq!(turn.backoff_min, Duration::from_millis(1000));
        assert_eq!(turn.backoff_max, Duration::from_millis(2000));
        assert_eq!(turn.contention_retry, Duration::from_millis(500));
        assert_eq!(turn.node_wait, Duration::from_secs(1));
        assert_eq!(turn.generation_timeout, Duration::from_secs(4));
        assert!(turn.generation_timeout < turn.lock_ttl);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("STORE_URL", "memory://");
            env::set_var("HOST_PERSONA_PATH", "personas/kai.json");
            env::set_var("AGENT_ID", "kai-2");
            env::set_var("LOCK_TTL_SECS", "10");
            env::set_var("BACKOFF_MIN_MS", "200");
            env::set_var("BACKOFF_MAX_MS", "400");
            env::set_var("RETRY_INTERVAL_MS", "50");
            env::set_var("NODE_WAIT_MS", "250");
            env::set_var("GENERATION_TIMEOUT_SECS", "8");
            env::set_var("TRANSCRIPT_STREAM", "episode_42");
            env::set_var("GENERATOR_PROVIDER", "gemini");
            env::set_var("GEMINI_API_KEY", "test-gemini-key");
            env::set_var("CHAT_MODEL", "gemini-2.0-flash");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.store_url, "memory://");
        assert_eq!(config.agent_id.as_deref(), Some("kai-2"));
        assert_eq!(config.provider, Provider::Gemini);
        assert_eq!(config.gemini_api_key, Some("test-gemini-key".to_string()));
        assert_eq!(config.openai_api_key, None);
        assert_eq!(config.chat_model, "gemini-2.0-flash");
        assert_eq!(config.log_level, Level::DEBUG);

        let turn = config.turn_config();
        assert_eq!(turn.lock_ttl, Duration::from_secs(10));
        assert_eq!(turn.backoff_min, Duration::from_millis(200));
        assert_eq!(turn.backoff_max, Duration::from_millis(400));
        assert_eq!(turn.contention_retry, Duration::from_millis(50));
        assert_eq!(turn.node_wait, Duration::from_millis(250));
        assert_eq!(turn.generation_timeout, Duration::from_secs(8));
        assert_eq!(turn.transcript_stream, "episode_42");
    }

    #[test]
    #[serial]
    fn test_agent_id_defaults_to_persona() {
        clear_env_vars();
        set_minimal_env_mock();
        let config = Config::from_env().unwrap();
        let persona = HostPersona::from_json(
            r#"{"id":"sascha","name":"Sascha","voice_id":"v1","system_prompt":"p"}"#,
        )
        .unwrap();
        assert_eq!(config.agent_id_for(&persona), "host_sascha");

        unsafe {
            env::set_var("AGENT_ID", "studio-a");
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.agent_id_for(&persona), "studio-a");
    }

    #[test]
    #[serial]
    fn test_config_missing_persona_path() {
        clear_env_vars();
        unsafe {
            env::set_var("GENERATOR_PROVIDER", "mock");
        }

        match Config::from_env().unwrap_err() {
            ConfigError::MissingVar(var) => assert_eq!(var, "HOST_PERSONA_PATH"),
            other => panic!("Expected MissingVar, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn test_config_missing_openai_key() {
        clear_env_vars();
        unsafe {
            env::set_var("HOST_PERSONA_PATH", "p.json");
            env::set_var("GENERATOR_PROVIDER", "openai");
        }

        match Config::from_env().unwrap_err() {
            ConfigError::MissingVar(msg) => assert!(msg.contains("OPENAI_API_KEY")),
            other => panic!("Expected MissingVar for OPENAI_API_KEY, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn test_config_rejects_zero_ttl() {
        clear_env_vars();
        set_minimal_env_mock();
        unsafe {
            env::set_var("LOCK_TTL_SECS", "0");
        }
        expect_invalid("LOCK_TTL_SECS");
    }

    #[test]
    #[serial]
    fn test_config_rejects_generation_timeout_outlasting_the_lock() {
        clear_env_vars();
        set_minimal_env_mock();
        unsafe {
            env::set_var("GENERATION_TIMEOUT_SECS", "30");
        }
        expect_invalid("GENERATION_TIMEOUT_SECS");

        unsafe {
            env::set_var("LOCK_TTL_SECS", "10");
            env::set_var("GENERATION_TIMEOUT_SECS", "10");
        }
        expect_invalid("GENERATION_TIMEOUT_SECS");
    }

    #[test]
    #[serial]
    fn test_config_rejects_inverted_backoff() {
        clear_env_vars();
        set_minimal_env_mock();
        unsafe {
            env::set_var("BACKOFF_MIN_MS", "3000");
            env::set_var("BACKOFF_MAX_MS", "2000");
        }
        expect_invalid("BACKOFF_MIN_MS");
    }

    #[test]
    #[serial]
    fn test_config_rejects_non_numeric_timing() {
        clear_env_vars();
        set_minimal_env_mock();
        unsafe {
            env::set_var("RETRY_INTERVAL_MS", "soon");
        }
        expect_invalid("RETRY_INTERVAL_MS");
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        set_minimal_env_mock();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }
        expect_invalid("RUST_LOG");
    }
}
