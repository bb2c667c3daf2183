use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{SecretValue, StackResearchError, require_env};

const DEFAULT_CONFIG_PATH: &str = "stackresearch.toml";
const CONFIG_PATH_ENV: &str = "STACKRESEARCH_CONFIG";

const MAX_SEARCH_QUERIES_ENV: &str = "STACKRESEARCH_MAX_SEARCH_QUERIES";
const MAX_SEARCH_RESULTS_ENV: &str = "STACKRESEARCH_MAX_SEARCH_RESULTS";
const MAX_REFLECTION_STEPS_ENV: &str = "STACKRESEARCH_MAX_REFLECTION_STEPS";

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub research: ResearchLimits,
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Resolve the configured LLM secret value (from environment only).
    pub fn llm_api_key(&self) -> Result<SecretValue, StackResearchError> {
        require_env(&self.llm.api_key_env)
    }

    /// Resolve the configured search secret value (from environment only).
    pub fn search_api_key(&self) -> Result<SecretValue, StackResearchError> {
        require_env(&self.search.api_key_env)
    }

    pub fn validate(&self) -> Result<(), StackResearchError> {
        self.research.validate()?;

        if self.llm.api_key_env.trim().is_empty() {
            return Err(StackResearchError::InvalidConfiguration(
                "llm.api_key_env must reference an environment variable".into(),
            ));
        }
        if self.search.api_key_env.trim().is_empty() {
            return Err(StackResearchError::InvalidConfiguration(
                "search.api_key_env must reference an environment variable".into(),
            ));
        }
        if self.llm.model.trim().is_empty() {
            return Err(StackResearchError::InvalidConfiguration(
                "llm.model must not be empty".into(),
            ));
        }
        if self.llm.max_tokens == 0 {
            return Err(StackResearchError::InvalidConfiguration(
                "llm.max_tokens must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.llm.temperature) {
            return Err(StackResearchError::InvalidConfiguration(format!(
                "llm.temperature must be within 0.0..=1.0, got {}",
                self.llm.temperature
            )));
        }
        if self.llm.timeout_secs == 0 {
            return Err(StackResearchError::InvalidConfiguration(
                "llm.timeout_secs must be positive".into(),
            ));
        }
        if self.search.timeout_secs == 0 {
            return Err(StackResearchError::InvalidConfiguration(
                "search.timeout_secs must be positive".into(),
            ));
        }
        if self.search.max_tokens_per_source == 0 {
            return Err(StackResearchError::InvalidConfiguration(
                "search.max_tokens_per_source must be positive".into(),
            ));
        }
        if !(self.rate_limit.requests_per_second.is_finite()
            && self.rate_limit.requests_per_second > 0.0)
        {
            return Err(StackResearchError::InvalidConfiguration(
                "rate_limit.requests_per_second must be a positive number".into(),
            ));
        }
        if !(self.rate_limit.max_bucket_size.is_finite() && self.rate_limit.max_bucket_size >= 1.0)
        {
            return Err(StackResearchError::InvalidConfiguration(
                "rate_limit.max_bucket_size must be a finite number of at least 1".into(),
            ));
        }
        if self.rate_limit.check_every_ms == 0 {
            return Err(StackResearchError::InvalidConfiguration(
                "rate_limit.check_every_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Helper to load configuration with best-practice guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `STACKRESEARCH_CONFIG` environment variable.
    /// 3. `stackresearch.toml` in the current working directory, if present.
    ///
    /// With no file at all the built-in defaults apply. The `STACKRESEARCH_MAX_*`
    /// environment variables are layered on top before validation.
    pub fn load(path: Option<PathBuf>) -> Result<Config, StackResearchError> {
        let mut config = match resolve_path(path) {
            ConfigSource::Required(path) => Self::read(&path)?,
            ConfigSource::Optional(path) if path.exists() => Self::read(&path)?,
            ConfigSource::Optional(_) => Config::default(),
        };

        config
            .research
            .apply_overrides_from(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without touching the filesystem or environment.
    pub fn from_toml_str(raw: &str) -> Result<Config, StackResearchError> {
        let config: Config = toml::from_str(raw)
            .map_err(|err| StackResearchError::InvalidConfiguration(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<Config, StackResearchError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| StackResearchError::config_io(path.to_path_buf(), err))?;
        toml::from_str(&raw).map_err(|err| {
            StackResearchError::InvalidConfiguration(format!("{}: {err}", path.display()))
        })
    }
}

enum ConfigSource {
    Required(PathBuf),
    Optional(PathBuf),
}

fn resolve_path(path: Option<PathBuf>) -> ConfigSource {
    if let Some(path) = path {
        return ConfigSource::Required(path);
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return ConfigSource::Required(PathBuf::from(from_env));
        }
    }

    ConfigSource::Optional(Path::new(DEFAULT_CONFIG_PATH).to_path_buf())
}

/// Bounds that shape one research session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchLimits {
    /// Upper bound on search queries issued per research round.
    pub max_search_queries: u8,
    /// Upper bound on results retained per query.
    pub max_search_results: u8,
    /// Upper bound on self-critique/refinement iterations.
    pub max_reflection_steps: u8,
}

impl ResearchLimits {
    pub const SEARCH_QUERIES_RANGE: (u8, u8) = (1, 20);
    pub const SEARCH_RESULTS_RANGE: (u8, u8) = (1, 20);
    pub const REFLECTION_STEPS_RANGE: (u8, u8) = (0, 10);

    pub fn validate(&self) -> Result<(), StackResearchError> {
        check_range(
            "max_search_queries",
            self.max_search_queries,
            Self::SEARCH_QUERIES_RANGE,
        )?;
        check_range(
            "max_search_results",
            self.max_search_results,
            Self::SEARCH_RESULTS_RANGE,
        )?;
        check_range(
            "max_reflection_steps",
            self.max_reflection_steps,
            Self::REFLECTION_STEPS_RANGE,
        )
    }

    /// Apply per-field overrides, typically from CLI flags. Validation is left to the caller.
    pub fn with_overrides(
        mut self,
        max_search_queries: Option<u8>,
        max_search_results: Option<u8>,
        max_reflection_steps: Option<u8>,
    ) -> Self {
        if let Some(value) = max_search_queries {
            self.max_search_queries = value;
        }
        if let Some(value) = max_search_results {
            self.max_search_results = value;
        }
        if let Some(value) = max_reflection_steps {
            self.max_reflection_steps = value;
        }
        self
    }

    fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), StackResearchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| -> Result<Option<u8>, StackResearchError> {
            match lookup(key) {
                Some(raw) if !raw.trim().is_empty() => {
                    raw.trim().parse::<u8>().map(Some).map_err(|err| {
                        StackResearchError::InvalidConfiguration(format!(
                            "{key} must be a small non-negative integer: {err}"
                        ))
                    })
                }
                _ => Ok(None),
            }
        };

        *self = self.with_overrides(
            parse(MAX_SEARCH_QUERIES_ENV)?,
            parse(MAX_SEARCH_RESULTS_ENV)?,
            parse(MAX_REFLECTION_STEPS_ENV)?,
        );
        Ok(())
    }
}

impl Default for ResearchLimits {
    fn default() -> Self {
        Self {
            max_search_queries: 3,
            max_search_results: 3,
            max_reflection_steps: 1,
        }
    }
}

fn check_range(field: &str, value: u8, (min, max): (u8, u8)) -> Result<(), StackResearchError> {
    if value < min || value > max {
        return Err(StackResearchError::InvalidConfiguration(format!(
            "research.{field} must be within {min}..={max}, got {value}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub api_key_env: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "claude-3-5-sonnet-latest".to_string(),
            max_tokens: 4096,
            temperature: 0.0,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub topic: String,
    pub max_tokens_per_source: usize,
    pub include_raw_content: bool,
    pub api_key_env: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            topic: "general".to_string(),
            max_tokens_per_source: 1000,
            include_raw_content: true,
            api_key_env: "TAVILY_API_KEY".to_string(),
            base_url: "https://api.tavily.com".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub check_every_ms: u64,
    pub max_bucket_size: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 4.0,
            check_every_ms: 100,
            max_bucket_size: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_limits() {
        let limits = ResearchLimits::default();
        assert_eq!(limits.max_search_queries, 3);
        assert_eq!(limits.max_search_results, 3);
        assert_eq!(limits.max_reflection_steps, 1);
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ConfigLoader::from_toml_str(
            r#"
            [research]
            max_search_queries = 5

            [llm]
            model = "claude-3-5-haiku-latest"
            "#,
        )
        .expect("config parses");

        assert_eq!(config.research.max_search_queries, 5);
        assert_eq!(config.research.max_search_results, 3);
        assert_eq!(config.research.max_reflection_steps, 1);
        assert_eq!(config.llm.model, "claude-3-5-haiku-latest");
        assert_eq!(config.llm.api_key_env, "ANTHROPIC_API_KEY");
        assert_eq!(config.search.api_key_env, "TAVILY_API_KEY");
    }

    #[test]
    fn out_of_range_limits_are_rejected() {
        let err = ConfigLoader::from_toml_str("[research]\nmax_search_queries = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_search_queries"));

        let err = ConfigLoader::from_toml_str("[research]\nmax_search_results = 50\n").unwrap_err();
        assert!(err.to_string().contains("max_search_results"));

        let err =
            ConfigLoader::from_toml_str("[research]\nmax_reflection_steps = 11\n").unwrap_err();
        assert!(err.to_string().contains("max_reflection_steps"));
    }

    #[test]
    fn zero_reflection_steps_is_allowed() {
        let limits = ResearchLimits::default().with_overrides(None, None, Some(0));
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply_on_top_of_file() {
        let env: HashMap<&str, &str> = HashMap::from([
            (MAX_SEARCH_QUERIES_ENV, "7"),
            (MAX_REFLECTION_STEPS_ENV, " 2 "),
        ]);
        let mut limits = ResearchLimits::default();
        limits
            .apply_overrides_from(|key| env.get(key).map(|value| value.to_string()))
            .expect("overrides parse");

        assert_eq!(limits.max_search_queries, 7);
        assert_eq!(limits.max_search_results, 3);
        assert_eq!(limits.max_reflection_steps, 2);
    }

    #[test]
    fn malformed_env_override_is_an_error() {
        let mut limits = ResearchLimits::default();
        let err = limits
            .apply_overrides_from(|key| (key == MAX_SEARCH_RESULTS_ENV).then(|| "many".into()))
            .unwrap_err();
        assert!(err.to_string().contains(MAX_SEARCH_RESULTS_ENV));
    }

    #[test]
    fn explicit_missing_file_is_an_io_error() {
        let err = ConfigLoader::load(Some(PathBuf::from("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, StackResearchError::ConfigIo { .. }));
    }

    #[test]
    fn loads_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stackresearch.toml");
        std::fs::write(
            &path,
            "[research]\nmax_search_results = 5\n[rate_limit]\nrequests_per_second = 2.0\n",
        )
        .unwrap();

        let config = ConfigLoader::load(Some(path)).expect("config loads");
        assert_eq!(config.research.max_search_results, 5);
        assert_eq!(config.rate_limit.requests_per_second, 2.0);
        assert_eq!(config.rate_limit.max_bucket_size, 10.0);
    }

    #[test]
    fn invalid_rate_limit_is_rejected() {
        let err = ConfigLoader::from_toml_str("[rate_limit]\nrequests_per_second = 0.0\n")
            .unwrap_err();
        assert!(err.to_string().contains("requests_per_second"));

        for bucket in ["nan", "inf", "0.5"] {
            let err = ConfigLoader::from_toml_str(&format!(
                "[rate_limit]\nmax_bucket_size = {bucket}\n"
            ))
            .unwrap_err();
            assert!(err.to_string().contains("max_bucket_size"), "{bucket}");
        }
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let err = ConfigLoader::from_toml_str("[llm]\ntimeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("llm.timeout_secs"));

        let err = ConfigLoader::from_toml_str("[search]\ntimeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("search.timeout_secs"));
    }
}
