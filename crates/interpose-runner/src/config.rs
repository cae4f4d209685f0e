//! Runtime locations from the environment, plus the optional
//! `interpose.yaml` settings file in the support directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::InterposeError;
use crate::rules::{default_rules, RewriteRule};

pub const DEFAULT_RUNTIME_HOME_ENV: &str = "NODE_HOME";
pub const INSTRUMENTED_RUNTIME_ENV: &str = "GRAAL_NODE";
pub const SUPPORT_DIR_ENV: &str = "INTERPOSE_HOME";
pub const SETTINGS_FILE: &str = "interpose.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Wall-clock limit for the supervised run.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_params_file")]
    pub params_file: PathBuf,

    #[serde(default = "default_shim_script")]
    pub shim_script: PathBuf,

    #[serde(default = "default_status_log")]
    pub status_log: PathBuf,

    #[serde(default = "default_result_file")]
    pub result_file: PathBuf,

    /// Appended after the built-in rule table.
    #[serde(default)]
    pub rules: Vec<RewriteRule>,
}

fn default_timeout_secs() -> u64 {
    60 * 15
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_params_file() -> PathBuf {
    PathBuf::from("params.txt")
}

fn default_shim_script() -> PathBuf {
    PathBuf::from("script-wrapper.js")
}

fn default_status_log() -> PathBuf {
    PathBuf::from("status.csv")
}

fn default_result_file() -> PathBuf {
    PathBuf::from("exec-result.txt")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            params_file: default_params_file(),
            shim_script: default_shim_script(),
            status_log: default_status_log(),
            result_file: default_result_file(),
            rules: Vec::new(),
        }
    }
}

impl Settings {
    /// Missing file means defaults; anything unreadable or invalid is an error.
    pub fn load(path: &Path) -> Result<Self, InterposeError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(InterposeError::SettingsInvalid {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })
            }
        };
        let settings: Settings =
            serde_yaml::from_str(&text).map_err(|e| InterposeError::SettingsInvalid {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        for rule in &settings.rules {
            rule.validate()
                .map_err(|message| InterposeError::SettingsInvalid {
                    path: path.to_path_buf(),
                    message,
                })?;
        }
        Ok(settings)
    }

    /// Like [`Settings::load`], but falls back to defaults with a warning so a
    /// broken settings file never stops a test suite from running.
    pub fn load_optional(path: &Path) -> Self {
        match Self::load(path) {
            Ok(settings) => settings,
            Err(err) => {
                warn!("{}; using default settings", err);
                Self::default()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WrapperConfig {
    pub default_runtime: PathBuf,
    pub instrumented_runtime: PathBuf,
    pub support_dir: PathBuf,
    pub settings: Settings,
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String, InterposeError> {
    lookup(name)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| {
            InterposeError::ConfigurationMissing(format!("environment variable {} is not set", name))
        })
}

fn executable_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("locate current executable")?;
    let exe = fs::canonicalize(&exe).unwrap_or(exe);
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow::anyhow!("executable has no parent directory: {}", exe.display()))
}

impl WrapperConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let runtime_home = required(&lookup, DEFAULT_RUNTIME_HOME_ENV)?;
        let instrumented = required(&lookup, INSTRUMENTED_RUNTIME_ENV)?;
        let support_dir = match lookup(SUPPORT_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => executable_dir()?,
        };
        let settings = Settings::load_optional(&support_dir.join(SETTINGS_FILE));
        Ok(Self {
            default_runtime: PathBuf::from(runtime_home).join("bin").join("node"),
            instrumented_runtime: PathBuf::from(instrumented),
            support_dir,
            settings,
        })
    }

    fn support_path(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.support_dir.join(p)
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.support_dir.join(SETTINGS_FILE)
    }

    pub fn params_path(&self) -> PathBuf {
        self.support_path(&self.settings.params_file)
    }

    pub fn shim_path(&self) -> PathBuf {
        self.support_path(&self.settings.shim_script)
    }

    pub fn status_log_path(&self) -> PathBuf {
        self.support_path(&self.settings.status_log)
    }

    pub fn result_path(&self) -> PathBuf {
        self.support_path(&self.settings.result_file)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.probe_timeout_secs)
    }

    /// Built-in rules followed by the settings file's rules.
    pub fn rules(&self) -> Vec<RewriteRule> {
        let mut rules = default_rules();
        rules.extend(self.settings.rules.iter().cloned());
        rules
    }

    /// Whitespace-separated tokens from the instrumentation flag file, in order.
    pub fn load_instrumentation_flags(&self) -> Result<Vec<String>> {
        let path = self.params_path();
        let text = fs::read_to_string(&path).map_err(|e| {
            InterposeError::ConfigurationMissing(format!(
                "instrumentation flag file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(parse_flag_file(&text))
    }
}

pub fn parse_flag_file(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "interpose_cfg_{}_{}_{}",
            name,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn env_with(support: &Path) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(DEFAULT_RUNTIME_HOME_ENV.to_string(), "/opt/node".to_string());
        env.insert(INSTRUMENTED_RUNTIME_ENV.to_string(), "/opt/graal/bin/node".to_string());
        env.insert(SUPPORT_DIR_ENV.to_string(), support.display().to_string());
        env
    }

    #[test]
    fn missing_runtime_variables_are_fatal() {
        let dir = temp_dir("missing");
        let mut env = env_with(&dir);
        env.remove(INSTRUMENTED_RUNTIME_ENV);
        let err = WrapperConfig::from_lookup(|k| env.get(k).cloned()).expect_err("must fail");
        let typed = err.downcast_ref::<InterposeError>().expect("typed error");
        assert_eq!(typed.code(), "configuration_missing");
        assert!(err.to_string().contains(INSTRUMENTED_RUNTIME_ENV));

        let mut env = env_with(&dir);
        env.insert(DEFAULT_RUNTIME_HOME_ENV.to_string(), "  ".to_string());
        assert!(WrapperConfig::from_lookup(|k| env.get(k).cloned()).is_err());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn resolves_paths_relative_to_support_dir() {
        let dir = temp_dir("paths");
        let env = env_with(&dir);
        let cfg = WrapperConfig::from_lookup(|k| env.get(k).cloned()).expect("config");
        assert_eq!(cfg.default_runtime, PathBuf::from("/opt/node/bin/node"));
        assert_eq!(cfg.instrumented_runtime, PathBuf::from("/opt/graal/bin/node"));
        assert_eq!(cfg.params_path(), dir.join("params.txt"));
        assert_eq!(cfg.shim_path(), dir.join("script-wrapper.js"));
        assert_eq!(cfg.status_log_path(), dir.join("status.csv"));
        assert_eq!(cfg.timeout(), Duration::from_secs(900));
        assert_eq!(cfg.rules().len(), default_rules().len());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn settings_file_overrides_defaults_and_adds_rules() {
        let dir = temp_dir("settings");
        fs::write(
            dir.join(SETTINGS_FILE),
            "timeout_secs: 30\nstatus_log: /var/log/status.csv\nrules:\n  - program_marker: bin/lab\n    operation: set_flag_with_value\n    flags: [--timeout]\n    value: \"60000\"\n",
        )
        .expect("write settings");
        let env = env_with(&dir);
        let cfg = WrapperConfig::from_lookup(|k| env.get(k).cloned()).expect("config");
        assert_eq!(cfg.timeout(), Duration::from_secs(30));
        assert_eq!(cfg.status_log_path(), PathBuf::from("/var/log/status.csv"));
        assert_eq!(cfg.rules().len(), default_rules().len() + 1);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn invalid_settings_fall_back_to_defaults() {
        let dir = temp_dir("invalid");
        let path = dir.join(SETTINGS_FILE);
        fs::write(&path, "timeout_secs: soon\n").expect("write settings");
        assert!(Settings::load(&path).is_err());
        assert_eq!(Settings::load_optional(&path).timeout_secs, 900);

        fs::write(
            &path,
            "rules:\n  - program_marker: bin/lab\n    operation: set_flag_with_value\n    flags: [--timeout]\n",
        )
        .expect("write settings");
        let err = Settings::load(&path).expect_err("value required");
        assert_eq!(err.code(), "settings_invalid");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn flag_file_is_order_preserving_and_drops_empty_tokens() {
        assert_eq!(
            parse_flag_file("--jvm  --nodeprof\n\n  --initParam a:1 \n--initParam\tb:2\n"),
            vec!["--jvm", "--nodeprof", "--initParam", "a:1", "--initParam", "b:2"]
        );
        assert!(parse_flag_file("  \n").is_empty());
    }

    #[test]
    fn missing_flag_file_is_configuration_missing() {
        let dir = temp_dir("params");
        let env = env_with(&dir);
        let cfg = WrapperConfig::from_lookup(|k| env.get(k).cloned()).expect("config");
        let err = cfg.load_instrumentation_flags().expect_err("missing params");
        assert!(err.to_string().contains("configuration_missing"));
        fs::write(cfg.params_path(), "--jvm --nodeprof\n").expect("write params");
        assert_eq!(
            cfg.load_instrumentation_flags().expect("flags"),
            vec!["--jvm".to_string(), "--nodeprof".to_string()]
        );
        let _ = fs::remove_dir_all(dir);
    }
}
