//! Startup configuration (component I), sourced entirely from environment
//! variables. Each field has a `default_*()` helper, and `from_env()` runs
//! per-field validation and fails fast on the first invalid value, since
//! environment variables are this proxy's actual external contract.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    InvalidValue { var: &'static str, reason: String },
    #[error("failed to parse LLAMA_BACKENDS json: {0}")]
    BackendsJson(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendDescriptor {
    pub url: String,
    pub slots: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdMode {
    Chars,
    Words,
    Blocks,
}

impl ThresholdMode {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chars" => Some(Self::Chars),
            "words" => Some(Self::Words),
            "blocks" => Some(Self::Blocks),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub backends: Vec<BackendDescriptor>,
    pub model_id: String,
    pub request_timeout: Duration,
    pub system_prompt_file: Option<String>,
    pub words_per_block: usize,
    pub threshold_mode: ThresholdMode,
    pub min_prefix_chars: usize,
    pub min_prefix_words: usize,
    pub min_prefix_blocks: usize,
    pub similarity_min_ratio: f64,
    pub pinned_keys: HashSet<String>,
    pub local_meta_dir: String,
    pub disk_meta_scan_limit: usize,
    pub add_bos: bool,
    pub slot_save_mount: Option<String>,
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            var: name,
            reason: format!("could not parse {raw:?}"),
        }),
    }
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let backends = resolve_backends()?;

        let words_per_block: usize = parse_env("WORDS_PER_BLOCK", 16)?;
        if words_per_block == 0 {
            return Err(ConfigError::InvalidValue {
                var: "WORDS_PER_BLOCK",
                reason: "must be >= 1".into(),
            });
        }

        let similarity_min_ratio: f64 = parse_env("SIMILARITY_MIN_RATIO", 0.85)?;
        if !(0.0..=1.0).contains(&similarity_min_ratio) {
            return Err(ConfigError::InvalidValue {
                var: "SIMILARITY_MIN_RATIO",
                reason: "must be within [0, 1]".into(),
            });
        }

        let threshold_mode_raw = env_or("THRESHOLD_MODE", "chars");
        let threshold_mode = ThresholdMode::parse(&threshold_mode_raw).ok_or_else(|| ConfigError::InvalidValue {
            var: "THRESHOLD_MODE",
            reason: format!("{threshold_mode_raw:?} is not one of chars|words|blocks"),
        })?;

        let pinned_keys_raw = env_or("PINNED_KEYS", "[]");
        let pinned_keys: Vec<String> = serde_json::from_str(&pinned_keys_raw)?;

        Ok(Self {
            backends,
            model_id: env_or("MODEL_ID", "llama.cpp"),
            request_timeout: Duration::from_secs_f64(parse_env("REQUEST_TIMEOUT", 600.0)?),
            system_prompt_file: std::env::var("SYSTEM_PROMPT_FILE").ok(),
            words_per_block,
            threshold_mode,
            min_prefix_chars: parse_env("MIN_PREFIX_CHARS", 5000)?,
            min_prefix_words: parse_env("MIN_PREFIX_WORDS", 1000)?,
            min_prefix_blocks: parse_env("MIN_PREFIX_BLOCKS", 20)?,
            similarity_min_ratio,
            pinned_keys: pinned_keys.into_iter().collect(),
            local_meta_dir: env_or("LOCAL_META_DIR", "./kvslots_meta"),
            disk_meta_scan_limit: parse_env("DISK_META_SCAN_LIMIT", 200)?,
            add_bos: parse_env("ADD_BOS", true)?,
            slot_save_mount: std::env::var("SLOT_SAVE_MOUNT").ok(),
            host: env_or("HOST", "0.0.0.0"),
            port: parse_env("PORT", 8081)?,
            log_level: env_or("LOG_LEVEL", "info"),
        })
    }
}

fn resolve_backends() -> Result<Vec<BackendDescriptor>, ConfigError> {
    let raw = env_or("LLAMA_BACKENDS", "").trim().to_string();
    if !raw.is_empty() {
        let backends: Vec<BackendDescriptor> = serde_json::from_str(&raw)?;
        return Ok(backends);
    }
    let url = env_or("LLAMA_SERVER_URL", "http://127.0.0.1:8000");
    let slots: u32 = parse_env("SLOTS_COUNT", 4)?;
    Ok(vec![BackendDescriptor { url, slots }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            "LLAMA_BACKENDS",
            "LLAMA_SERVER_URL",
            "SLOTS_COUNT",
            "THRESHOLD_MODE",
            "SIMILARITY_MIN_RATIO",
            "WORDS_PER_BLOCK",
            "PINNED_KEYS",
        ] {
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    #[serial]
    fn defaults_produce_a_single_fallback_backend() {
        clear_env();
        let config = ProxyConfig::from_env().unwrap();
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].slots, 4);
        assert_eq!(config.threshold_mode, ThresholdMode::Chars);
        assert_eq!(config.words_per_block, 16);
    }

    #[test]
    #[serial]
    fn invalid_threshold_mode_is_rejected() {
        clear_env();
        unsafe { std::env::set_var("THRESHOLD_MODE", "nonsense") };
        let err = ProxyConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: "THRESHOLD_MODE", .. }));
        unsafe { std::env::remove_var("THRESHOLD_MODE") };
    }

    #[test]
    #[serial]
    fn similarity_ratio_out_of_range_is_rejected() {
        clear_env();
        unsafe { std::env::set_var("SIMILARITY_MIN_RATIO", "1.5") };
        let err = ProxyConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: "SIMILARITY_MIN_RATIO", .. }));
        unsafe { std::env::remove_var("SIMILARITY_MIN_RATIO") };
    }

    #[test]
    #[serial]
    fn backends_json_overrides_single_url_fallback() {
        clear_env();
        unsafe {
            std::env::set_var("LLAMA_BACKENDS", r#"[{"url":"http://a","slots":2},{"url":"http://b","slots":3}]"#);
        }
        let config = ProxyConfig::from_env().unwrap();
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[1].slots, 3);
        unsafe { std::env::remove_var("LLAMA_BACKENDS") };
    }
}
