// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
    str::FromStr,
    time::Duration,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Scheduler options.
mod jobmgr_config {
    pub const SECTION_NAME: &str = "jobmgr";
    // Number of worker threads.
    pub const WORKERS: &str = "workers";
    // Maximum number of low priority groups running at the same time.
    pub const MAX_RUNNING_LOW_PRIORITY: &str = "max_running_low_priority";
    // How long terminated jobs stay in the finished history.
    pub const FINISHED_RETENTION_SECS: &str = "finished_retention_secs";
    // Maximum number of entries in the finished history.
    pub const MAX_FINISHED_JOBS: &str = "max_finished_jobs";
    // Upper bound for a single central wait.
    pub const MAX_WAIT_GRANULARITY_MS: &str = "max_wait_granularity_ms";
}

// Debugger options.
mod debugger_config {
    pub const SECTION_NAME: &str = "debugger";
    pub const ENABLED: &str = "enabled";
    pub const PORT_NAME: &str = "port_name";
    pub const ZOMBIE_TIMEOUT_SECS: &str = "zombie_timeout_secs";
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Job manager configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Common associated functions for job manager configuration object.
impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        Self::from_yaml_str(&config_s)
    }

    /// Parses a configuration document held in memory.
    pub fn from_yaml_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed configuration ({:?})", e);
                error!("from_yaml_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            [c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        };

        Ok(Self(config_obj.clone()))
    }

    fn get_jobmgr_config(&self) -> Result<&Yaml, Fail> {
        Self::get_subsection(&self.0, jobmgr_config::SECTION_NAME)
    }

    fn get_debugger_config(&self) -> Result<&Yaml, Fail> {
        Self::get_subsection(&self.0, debugger_config::SECTION_NAME)
    }

    /// Scheduler config: Reads the number of worker threads.
    pub fn workers(&self) -> Result<usize, Fail> {
        let workers: usize = if let Some(workers) = Self::get_jobmgr_env_option(jobmgr_config::WORKERS)? {
            workers
        } else {
            Self::get_int_option(self.get_jobmgr_config()?, jobmgr_config::WORKERS)?
        };
        if workers == 0 {
            let cause: String = "at least one worker is required".to_string();
            error!("workers(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(workers)
    }

    /// Scheduler config: Reads the cap on concurrently running low priority groups.
    pub fn max_running_low_priority(&self) -> Result<usize, Fail> {
        if let Some(max) = Self::get_jobmgr_env_option(jobmgr_config::MAX_RUNNING_LOW_PRIORITY)? {
            Ok(max)
        } else {
            Self::get_int_option(self.get_jobmgr_config()?, jobmgr_config::MAX_RUNNING_LOW_PRIORITY)
        }
    }

    pub fn finished_retention(&self) -> Result<Duration, Fail> {
        let secs: u64 = if let Some(secs) = Self::get_jobmgr_env_option(jobmgr_config::FINISHED_RETENTION_SECS)? {
            secs
        } else {
            Self::get_int_option(self.get_jobmgr_config()?, jobmgr_config::FINISHED_RETENTION_SECS)?
        };
        Ok(Duration::from_secs(secs))
    }

    pub fn max_finished_jobs(&self) -> Result<usize, Fail> {
        if let Some(max) = Self::get_jobmgr_env_option(jobmgr_config::MAX_FINISHED_JOBS)? {
            Ok(max)
        } else {
            Self::get_int_option(self.get_jobmgr_config()?, jobmgr_config::MAX_FINISHED_JOBS)
        }
    }

    /// Scheduler config: Reads the longest time the central wait loop may sleep without re-scanning deadlines.
    pub fn max_wait_granularity(&self) -> Result<Duration, Fail> {
        let ms: u64 = if let Some(ms) = Self::get_jobmgr_env_option(jobmgr_config::MAX_WAIT_GRANULARITY_MS)? {
            ms
        } else {
            Self::get_int_option(self.get_jobmgr_config()?, jobmgr_config::MAX_WAIT_GRANULARITY_MS)?
        };
        Ok(Duration::from_millis(ms))
    }

    /// Debugger config: Reads whether the debugger listener should be started.
    pub fn debugger_enabled(&self) -> Result<bool, Fail> {
        if let Some(enabled) = Self::get_debugger_env_option(debugger_config::ENABLED)? {
            Ok(enabled)
        } else {
            Self::get_bool_option(self.get_debugger_config()?, debugger_config::ENABLED)
        }
    }

    /// Debugger config: Reads the name of the named port the debugger listens on.
    pub fn debugger_port_name(&self) -> Result<String, Fail> {
        if let Some(name) = Self::get_debugger_env_option(debugger_config::PORT_NAME)? {
            Ok(name)
        } else {
            Self::get_typed_str_option(self.get_debugger_config()?, debugger_config::PORT_NAME, |val: &str| {
                if val.is_empty() {
                    None
                } else {
                    Some(val.to_string())
                }
            })
        }
    }

    /// Debugger config: Reads how long terminated jobs with a debugger attached are kept around.
    pub fn zombie_timeout(&self) -> Result<Duration, Fail> {
        let secs: u64 = if let Some(secs) = Self::get_debugger_env_option(debugger_config::ZOMBIE_TIMEOUT_SECS)? {
            secs
        } else {
            Self::get_int_option(self.get_debugger_config()?, debugger_config::ZOMBIE_TIMEOUT_SECS)?
        };
        Ok(Duration::from_secs(secs))
    }

    //==================================================================================================================
    // Static Functions
    //==================================================================================================================

    /// Similar to `require_typed_option` using `Yaml::as_hash` receiver. This method returns a `&Yaml` instead of
    /// yaml::Hash, and Yaml is more natural for indexing.
    fn get_subsection<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        let section: &'a Yaml = Self::get_option(yaml, index)?;
        match section {
            Yaml::Hash(_) => Ok(section),
            _ => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index `yaml` to find the value at `index`, validating that the index exists.
    fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        match yaml.index(index) {
            Yaml::BadValue => {
                let message: String = format!("missing configuration option \"{}\"", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            value => Ok(value),
        }
    }

    /// Index `yaml` to find the value at `index`, validating that it exists and that the receiver returns Some(_).
    fn get_typed_option<'a, T, Fn>(yaml: &'a Yaml, index: &str, receiver: Fn) -> Result<T, Fail>
    where
        Fn: FnOnce(&'a Yaml) -> Option<T>,
    {
        let option: &'a Yaml = Self::get_option(yaml, index)?;
        match receiver(option) {
            Some(value) => Ok(value),
            None => {
                let message: String = format!("parameter {} has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index `yaml` to find value at `index`, validating it as a string.
    fn get_typed_str_option<T, Fn>(yaml: &Yaml, index: &str, parser: Fn) -> Result<T, Fail>
    where
        Fn: FnOnce(&str) -> Option<T>,
    {
        let option: &Yaml = Self::get_option(yaml, index)?;
        if let Some(value) = option.as_str() {
            if let Some(value) = parser(value) {
                return Ok(value);
            }
        }
        let message: String = format!("parameter {} has unexpected type", index);
        Err(Fail::new(libc::EINVAL, message.as_str()))
    }

    fn get_jobmgr_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        Self::get_typed_env_option(jobmgr_config::SECTION_NAME, index)
    }

    fn get_debugger_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        Self::get_typed_env_option(debugger_config::SECTION_NAME, index)
    }

    /// Get value where the environment value overrides the config file if it exists. The environment variable is named
    /// after the section and the option, e.g. `JOBMGR_WORKERS`.
    fn get_typed_env_option<T: FromStr>(section: &str, index: &str) -> Result<Option<T>, Fail> {
        // Check for the environment variable.
        if let Ok(var) = ::std::env::var(format!("{}_{}", section, index).to_uppercase()) {
            if let Ok(value) = var.as_str().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }

    /// Similar to `require_typed_option` using `Yaml::as_i64` as the receiver, but additionally verifies that the
    /// destination type may hold the i64 value.
    fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str) -> Result<T, Fail> {
        let val: i64 = Self::get_typed_option(yaml, index, &Yaml::as_i64)?;
        match T::try_from(val) {
            Ok(val) => Ok(val),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }

    /// Same as `Self::require_typed_option` using `Yaml::as_bool` as the receiver.
    fn get_bool_option(yaml: &Yaml, index: &str) -> Result<bool, Fail> {
        Self::get_typed_option(yaml, index, &Yaml::as_bool)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Config;
    use ::anyhow::Result;
    use ::std::time::Duration;

    const SAMPLE: &str = r#"
jobmgr:
  workers: 3
  max_running_low_priority: 1
  finished_retention_secs: 60
  max_finished_jobs: 16
  max_wait_granularity_ms: 250
debugger:
  enabled: true
  port_name: "test:debugger"
  zombie_timeout_secs: 5
"#;

    #[test]
    fn test_parse_sample_config() -> Result<()> {
        let config: Config = match Config::from_yaml_str(SAMPLE) {
            Ok(config) => config,
            Err(e) => anyhow::bail!("failed to parse config ({:?})", e),
        };
        crate::ensure_eq!(config.max_running_low_priority().ok(), Some(1));
        crate::ensure_eq!(config.finished_retention().ok(), Some(Duration::from_secs(60)));
        crate::ensure_eq!(config.max_finished_jobs().ok(), Some(16));
        crate::ensure_eq!(config.max_wait_granularity().ok(), Some(Duration::from_millis(250)));
        crate::ensure_eq!(config.debugger_port_name().ok(), Some("test:debugger".to_string()));
        crate::ensure_eq!(config.zombie_timeout().ok(), Some(Duration::from_secs(5)));
        Ok(())
    }

    #[test]
    fn test_missing_section_is_an_error() -> Result<()> {
        let config: Config = match Config::from_yaml_str("jobmgr:\n  workers: 2\n") {
            Ok(config) => config,
            Err(e) => anyhow::bail!("failed to parse config ({:?})", e),
        };
        if config.zombie_timeout().is_ok() {
            anyhow::bail!("reading from a missing section should fail");
        }
        Ok(())
    }

    #[test]
    fn test_multiple_documents_rejected() -> Result<()> {
        if Config::from_yaml_str("a: 1\n---\nb: 2\n").is_ok() {
            anyhow::bail!("two documents should be rejected");
        }
        Ok(())
    }
}
