use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What the crash verifier does with a sample whose execution timed out.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutPolicy {
    /// A hang is not a crash; the sample stays in the corpus.
    #[default]
    Retain,
    /// Treat a hang like a crash and move the sample to quarantine.
    Quarantine,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ToolSettings {
    #[serde(default = "default_cmin")]
    pub cmin: PathBuf,
    #[serde(default = "default_tmin")]
    pub tmin: PathBuf,
}

fn default_cmin() -> PathBuf {
    PathBuf::from("afl-cmin")
}

fn default_tmin() -> PathBuf {
    PathBuf::from("afl-tmin")
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            cmin: default_cmin(),
            tmin: default_tmin(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct VerifySettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub on_timeout: TimeoutPolicy,
    /// Count a non-zero exit code as a crash, not only death by signal.
    #[serde(default)]
    pub crash_on_exit_code: bool,
}

pub fn default_workers() -> usize {
    1
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl VerifySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            timeout_ms: default_timeout_ms(),
            on_timeout: TimeoutPolicy::default(),
            crash_on_exit_code: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
}

pub fn default_placeholder() -> String {
    "@@".to_string()
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            placeholder: default_placeholder(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SieveConfig {
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub verify: VerifySettings,
    #[serde(default)]
    pub target: TargetSettings,
}

impl SieveConfig {
    pub const DEFAULT_FILE_NAME: &'static str = "sieve.toml";

    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: SieveConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.verify.workers == 0 {
            anyhow::bail!("verify.workers must be at least 1");
        }
        if self.target.placeholder.is_empty() {
            anyhow::bail!("target.placeholder must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_file_yields_defaults() {
        let config: SieveConfig = toml::from_str("").unwrap();
        assert_eq!(config, SieveConfig::default());
        assert_eq!(config.tools.cmin, PathBuf::from("afl-cmin"));
        assert_eq!(config.verify.workers, 1);
        assert_eq!(config.verify.on_timeout, TimeoutPolicy::Retain);
        assert_eq!(config.target.placeholder, "@@");
    }

    #[test]
    fn parses_kebab_case_sections() {
        let text = r#"
            [tools]
            cmin = "/opt/afl/afl-cmin"

            [verify]
            workers = 8
            timeout-ms = 250
            on-timeout = "quarantine"
            crash-on-exit-code = true
        "#;
        let config: SieveConfig = toml::from_str(text).unwrap();
        assert_eq!(config.tools.cmin, PathBuf::from("/opt/afl/afl-cmin"));
        assert_eq!(config.tools.tmin, PathBuf::from("afl-tmin"));
        assert_eq!(config.verify.workers, 8);
        assert_eq!(config.verify.timeout(), Duration::from_millis(250));
        assert_eq!(config.verify.on_timeout, TimeoutPolicy::Quarantine);
        assert!(config.verify.crash_on_exit_code);
    }

    #[test]
    fn rejects_unknown_fields() {
        let result: Result<SieveConfig, _> = toml::from_str("[verify]\nthreads = 2\n");
        assert!(result.is_err());
    }

    #[test]
    fn load_from_file_validates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sieve.toml");
        std::fs::write(&path, "[verify]\nworkers = 0\n").unwrap();
        let err = SieveConfig::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("workers"));

        std::fs::write(&path, "[verify]\nworkers = 3\n").unwrap();
        let config = SieveConfig::load_from_file(&path).unwrap();
        assert_eq!(config.verify.workers, 3);
    }

    #[test]
    fn load_from_missing_file_fails() {
        let dir = tempdir().unwrap();
        let err = SieveConfig::load_from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
