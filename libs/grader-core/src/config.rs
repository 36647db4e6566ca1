// Language and pipeline configuration for the grader
use crate::splitter::WeightPolicy;
use anyhow::{anyhow, bail, Context, Result};
use grader_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const EMBEDDED_LANGUAGES: &str = include_str!("../../../config/languages.json");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub version: String,
    /// Name the assembled program is stored under in the sandbox
    pub file_name: String,
    pub piston_language: String,
    pub judge0_language_id: u32,
    /// Designated entry-point type for languages that need one
    #[serde(default)]
    pub entry_class: Option<String>,
    pub compile_timeout_ms: u64,
    pub run_timeout_ms: u64,
    pub memory_limit_mb: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<String, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from a languages.json file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        Self::from_json(&content)
    }

    /// Load with default path (config/languages.json)
    pub fn load_default() -> Result<Self> {
        Self::load(Path::new("config/languages.json"))
    }

    /// Configuration compiled into the binary
    pub fn embedded() -> Result<Self> {
        Self::from_json(EMBEDDED_LANGUAGES).context("Embedded languages.json is invalid")
    }

    /// Explicit path if given, then the default path, then the embedded copy
    pub fn resolve(config_path: Option<&Path>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load(path),
            None => Self::load_default().or_else(|_| Self::embedded()),
        }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse languages.json")?;

        let mut configs = HashMap::new();
        for lang in languages_json.languages {
            let language: Language = lang
                .name
                .parse()
                .with_context(|| format!("languages.json lists unknown language '{}'", lang.name))?;
            configs.insert(language.as_str().to_string(), lang);
        }

        Ok(Self { configs })
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &Language) -> Result<&LanguageConfig> {
        self.configs
            .get(language.as_str())
            .ok_or_else(|| anyhow!("No configuration found for language: {}", language))
    }

    pub fn supports(&self, language: &Language) -> bool {
        self.configs.contains_key(language.as_str())
    }

    /// List all supported languages, sorted
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    Piston,
    Judge0,
}

impl SandboxBackend {
    pub fn default_url(&self) -> &'static str {
        match self {
            SandboxBackend::Piston => "http://localhost:2000",
            SandboxBackend::Judge0 => "http://localhost:2358",
        }
    }
}

impl FromStr for SandboxBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "piston" => Ok(SandboxBackend::Piston),
            "judge0" => Ok(SandboxBackend::Judge0),
            other => Err(format!("unknown sandbox backend: {}", other)),
        }
    }
}

impl fmt::Display for SandboxBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxBackend::Piston => f.write_str("piston"),
            SandboxBackend::Judge0 => f.write_str("judge0"),
        }
    }
}

/// Pipeline settings, read from the environment by the service binaries
#[derive(Debug, Clone)]
pub struct GraderConfig {
    pub backend: SandboxBackend,
    pub sandbox_url: String,
    pub max_parallel: usize,
    pub unit_timeout: Duration,
    pub batch_timeout: Option<Duration>,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub weight_policy: WeightPolicy,
    pub languages_config: Option<PathBuf>,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Piston,
            sandbox_url: SandboxBackend::Piston.default_url().to_string(),
            max_parallel: 4,
            unit_timeout: Duration::from_millis(15_000),
            batch_timeout: None,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            retry_max_backoff: Duration::from_millis(2_000),
            weight_policy: WeightPolicy::Duplicate,
            languages_config: None,
        }
    }
}

impl GraderConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let backend: SandboxBackend = parse_or(&lookup, "SANDBOX_BACKEND", defaults.backend)?;
        let sandbox_url = lookup("SANDBOX_URL")
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| backend.default_url().to_string());

        let max_parallel: usize = parse_or(&lookup, "GRADER_MAX_PARALLEL", defaults.max_parallel)?;
        if max_parallel == 0 {
            bail!("GRADER_MAX_PARALLEL must be at least 1");
        }

        let retry_attempts: u32 = parse_or(&lookup, "GRADER_RETRY_ATTEMPTS", defaults.retry_attempts)?;
        if retry_attempts == 0 {
            bail!("GRADER_RETRY_ATTEMPTS must be at least 1");
        }

        let batch_timeout = match lookup("GRADER_BATCH_TIMEOUT_MS") {
            Some(raw) => Some(Duration::from_millis(
                raw.trim()
                    .parse::<u64>()
                    .with_context(|| format!("Invalid GRADER_BATCH_TIMEOUT_MS: {}", raw))?,
            )),
            None => None,
        };

        Ok(Self {
            backend,
            sandbox_url,
            max_parallel,
            unit_timeout: Duration::from_millis(parse_or(&lookup, "GRADER_UNIT_TIMEOUT_MS", 15_000u64)?),
            batch_timeout,
            retry_attempts,
            retry_backoff: Duration::from_millis(parse_or(&lookup, "GRADER_RETRY_BACKOFF_MS", 200u64)?),
            retry_max_backoff: Duration::from_millis(parse_or(
                &lookup,
                "GRADER_RETRY_MAX_BACKOFF_MS",
                2_000u64,
            )?),
            weight_policy: parse_or(&lookup, "GRADER_WEIGHT_POLICY", defaults.weight_policy)?,
            languages_config: lookup("GRADER_LANGUAGES_CONFIG").map(PathBuf::from),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("Invalid {}='{}': {}", key, raw, e)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_embedded_config_covers_every_language() {
        let manager = LanguageConfigManager::embedded().unwrap();
        for language in Language::ALL {
            assert!(manager.supports(&language), "missing {}", language);
        }
        assert_eq!(manager.list_languages(), vec!["cpp", "java", "python", "rust"]);
        assert_eq!(
            manager.get_config(&Language::Java).unwrap().entry_class.as_deref(),
            Some("Main")
        );
    }

    #[test]
    fn test_unknown_language_in_config_is_rejected() {
        let json = r#"{"languages": [{"name": "cobol", "version": "1", "file_name": "a.cob",
            "piston_language": "cobol", "judge0_language_id": 77, "compile_timeout_ms": 1,
            "run_timeout_ms": 1, "memory_limit_mb": 1}]}"#;
        assert!(LanguageConfigManager::from_json(json).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let result = LanguageConfigManager::load(Path::new("/nonexistent/languages.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_defaults_from_empty_environment() {
        let config = GraderConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.backend, SandboxBackend::Piston);
        assert_eq!(config.sandbox_url, "http://localhost:2000");
        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.unit_timeout, Duration::from_millis(15_000));
        assert_eq!(config.batch_timeout, None);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.weight_policy, WeightPolicy::Duplicate);
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = GraderConfig::from_lookup(lookup_from(&[
            ("SANDBOX_BACKEND", "judge0"),
            ("GRADER_MAX_PARALLEL", "8"),
            ("GRADER_BATCH_TIMEOUT_MS", "60000"),
            ("GRADER_WEIGHT_POLICY", "divide"),
        ]))
        .unwrap();

        assert_eq!(config.backend, SandboxBackend::Judge0);
        assert_eq!(config.sandbox_url, "http://localhost:2358");
        assert_eq!(config.max_parallel, 8);
        assert_eq!(config.batch_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.weight_policy, WeightPolicy::Divide);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(GraderConfig::from_lookup(lookup_from(&[("GRADER_MAX_PARALLEL", "0")])).is_err());
        assert!(GraderConfig::from_lookup(lookup_from(&[("GRADER_UNIT_TIMEOUT_MS", "soon")])).is_err());
        assert!(GraderConfig::from_lookup(lookup_from(&[("SANDBOX_BACKEND", "docker")])).is_err());
    }
}
