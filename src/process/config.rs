//! Configuration for the backend process supervisor
//!
//! Provides SupervisorConfig with a validating builder, environment defaults
//! and the restart policy applied after unexpected exits.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::process::error::ConfigError;
use crate::process::handshake::{HandshakeParser, MarkerLineParser};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default time allowed between spawn and the readiness handshake (30 seconds)
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;

/// Default time to wait for a terminated process to exit before killing it
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 5;

/// Restart attempts allowed before the circuit breaker opens
pub const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 5;

/// First backoff step between restart attempts
pub const DEFAULT_RESTART_BASE_DELAY_MS: u64 = 100;

/// Upper bound on the delay between restart attempts
pub const DEFAULT_RESTART_MAX_DELAY_SECS: u64 = 30;

/// Uptime after which the restart counter is forgotten
pub const DEFAULT_RESTART_RESET_AFTER_SECS: u64 = 60;

/// Environment variable the backend interpreter reads its import path from
pub const DEFAULT_LIBRARY_PATH_VAR: &str = "PYTHONPATH";

/// Entry script name inside the backend home directory
pub const ENTRY_SCRIPT_NAME: &str = "server.py";

pub const LOG_FILE_NAME: &str = "codeintel3.log";
pub const DB_FILE_NAME: &str = "codeintel3.db";

// ============================================================================
// Restart Policy
// ============================================================================

/// Exponential backoff with a bounded number of attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Attempts allowed before giving up (circuit breaker opens)
    pub max_attempts: u32,

    /// Backoff step; attempt 2 waits this long, attempt 3 twice as long, ...
    pub base_delay: Duration,

    /// Backoff cap
    pub max_delay: Duration,

    /// A process that stayed up this long resets the attempt counter
    pub reset_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RESTART_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RESTART_BASE_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_RESTART_MAX_DELAY_SECS),
            reset_after: Duration::from_secs(DEFAULT_RESTART_RESET_AFTER_SECS),
        }
    }
}

impl RestartPolicy {
    /// Policy that never restarts automatically
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before the given 1-based restart attempt
    ///
    /// The first restart is immediate, later ones back off exponentially.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 2).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay > self.max_delay {
            return Err(ConfigError::invalid_restart_policy(format!(
                "base delay {:?} exceeds max delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Core Configuration Types
// ============================================================================

/// Complete supervisor configuration
#[derive(Clone)]
pub struct SupervisorConfig {
    /// Interpreter executable that runs the backend
    pub interpreter: PathBuf,

    /// Backend entry script passed as the first argument
    pub entry_script: PathBuf,

    /// Backend log file (`-l`)
    pub log_path: PathBuf,

    /// Backend database file (`-f`)
    pub db_path: PathBuf,

    /// Working directory; defaults to the entry script's directory
    pub working_directory: Option<PathBuf>,

    /// Fragments joined into the library search path variable
    pub library_paths: Vec<PathBuf>,

    /// Name of the library search path variable
    pub library_path_var: String,

    /// Extra environment variables for the backend
    pub extra_env: Vec<(String, String)>,

    pub startup_timeout: Duration,
    pub stop_timeout: Duration,
    pub restart_policy: RestartPolicy,

    /// Parser for the readiness handshake on stdout
    pub handshake: Arc<dyn HandshakeParser>,
}

impl std::fmt::Debug for SupervisorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorConfig")
            .field("interpreter", &self.interpreter)
            .field("entry_script", &self.entry_script)
            .field("log_path", &self.log_path)
            .field("db_path", &self.db_path)
            .field("working_directory", &self.working_directory)
            .field("library_paths", &self.library_paths)
            .field("library_path_var", &self.library_path_var)
            .field("extra_env", &self.extra_env)
            .field("startup_timeout", &self.startup_timeout)
            .field("stop_timeout", &self.stop_timeout)
            .field("restart_policy", &self.restart_policy)
            .field("handshake", &self.handshake.name())
            .finish()
    }
}

impl SupervisorConfig {
    /// Start building a configuration
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::new()
    }

    /// Arguments passed to the interpreter
    ///
    /// `-t true` is appended only for the first spawn of a supervisor.
    pub fn command_args(&self, first_start: bool) -> Vec<String> {
        let mut args = vec![
            self.entry_script.to_string_lossy().to_string(),
            "-l".to_string(),
            self.log_path.to_string_lossy().to_string(),
            "-f".to_string(),
            self.db_path.to_string_lossy().to_string(),
        ];

        if first_start {
            args.push("-t".to_string());
            args.push("true".to_string());
        }

        args
    }

    /// Library search path joined with the platform separator
    pub fn library_path_value(&self) -> Result<Option<OsString>, ConfigError> {
        if self.library_paths.is_empty() {
            return Ok(None);
        }
        Ok(Some(env::join_paths(&self.library_paths)?))
    }

    /// Directory the backend runs in
    pub fn effective_working_directory(&self) -> Option<PathBuf> {
        self.working_directory.clone().or_else(|| {
            self.entry_script
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf)
        })
    }
}

// ============================================================================
// Configuration Builder
// ============================================================================

/// Builder for SupervisorConfig with validation and defaults
#[derive(Default)]
pub struct SupervisorConfigBuilder {
    interpreter: Option<PathBuf>,
    entry_script: Option<PathBuf>,
    log_path: Option<PathBuf>,
    db_path: Option<PathBuf>,
    working_directory: Option<PathBuf>,
    library_paths: Vec<PathBuf>,
    library_path_var: Option<String>,
    extra_env: Vec<(String, String)>,
    startup_timeout: Option<Duration>,
    stop_timeout: Option<Duration>,
    restart_policy: Option<RestartPolicy>,
    handshake: Option<Arc<dyn HandshakeParser>>,
}

impl SupervisorConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder seeded from `CODEINTEL_INTERPRETER`, `CODEINTEL_HOME`,
    /// `CODEINTEL_ENTRY_SCRIPT` and `CODEINTEL_DATA_DIR`
    ///
    /// The home directory holds the entry script and is put on the library
    /// path; log and database files live in the data directory, which
    /// defaults to the home directory.
    pub fn from_env() -> Self {
        let mut builder = Self::new();

        if let Ok(interpreter) = env::var("CODEINTEL_INTERPRETER") {
            builder = builder.interpreter(interpreter);
        }

        if let Ok(home) = env::var("CODEINTEL_HOME") {
            let home = PathBuf::from(home);
            builder = builder
                .entry_script(home.join(ENTRY_SCRIPT_NAME))
                .working_directory(&home)
                .add_library_path(&home);

            let data_dir = env::var("CODEINTEL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(home);
            builder = builder
                .log_path(data_dir.join(LOG_FILE_NAME))
                .db_path(data_dir.join(DB_FILE_NAME));
        }

        if let Ok(script) = env::var("CODEINTEL_ENTRY_SCRIPT") {
            builder = builder.entry_script(script);
        }

        builder
    }

    pub fn interpreter(mut self, path: impl Into<PathBuf>) -> Self {
        self.interpreter = Some(path.into());
        self
    }

    pub fn entry_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.entry_script = Some(path.into());
        self
    }

    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    /// Append a fragment to the library search path
    pub fn add_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_paths.push(path.into());
        self
    }

    pub fn library_path_var(mut self, name: impl Into<String>) -> Self {
        self.library_path_var = Some(name.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.push((key.into(), value.into()));
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = Some(policy);
        self
    }

    /// Replace the default stdout marker handshake
    pub fn handshake(mut self, parser: Arc<dyn HandshakeParser>) -> Self {
        self.handshake = Some(parser);
        self
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<SupervisorConfig, ConfigError> {
        let interpreter = self
            .interpreter
            .ok_or_else(|| ConfigError::missing_field("interpreter"))?;
        let entry_script = self
            .entry_script
            .ok_or_else(|| ConfigError::missing_field("entry_script"))?;
        let log_path = self
            .log_path
            .ok_or_else(|| ConfigError::missing_field("log_path"))?;
        let db_path = self
            .db_path
            .ok_or_else(|| ConfigError::missing_field("db_path"))?;

        Self::validate_path(&interpreter, "Interpreter path cannot be empty")?;
        Self::validate_path(&entry_script, "Entry script path cannot be empty")?;

        if let Some(working_directory) = &self.working_directory
            && !working_directory.is_dir()
        {
            return Err(ConfigError::invalid_path(
                working_directory,
                "Working directory does not exist",
            ));
        }

        let startup_timeout = self
            .startup_timeout
            .unwrap_or(Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS));
        let stop_timeout = self
            .stop_timeout
            .unwrap_or(Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS));
        Self::validate_timeout(startup_timeout, "Startup timeout must be greater than zero")?;
        Self::validate_timeout(stop_timeout, "Stop timeout must be greater than zero")?;

        let restart_policy = self.restart_policy.unwrap_or_default();
        restart_policy.validate()?;

        // Fails early on fragments containing the separator
        if !self.library_paths.is_empty() {
            env::join_paths(&self.library_paths)?;
        }

        Ok(SupervisorConfig {
            interpreter,
            entry_script,
            log_path,
            db_path,
            working_directory: self.working_directory,
            library_paths: self.library_paths,
            library_path_var: self
                .library_path_var
                .unwrap_or_else(|| DEFAULT_LIBRARY_PATH_VAR.to_string()),
            extra_env: self.extra_env,
            startup_timeout,
            stop_timeout,
            restart_policy,
            handshake: self
                .handshake
                .unwrap_or_else(|| Arc::new(MarkerLineParser::default())),
        })
    }

    fn validate_path(path: &Path, reason: &str) -> Result<(), ConfigError> {
        if path.as_os_str().is_empty() {
            return Err(ConfigError::invalid_path(path, reason));
        }
        Ok(())
    }

    fn validate_timeout(timeout: Duration, reason: &str) -> Result<(), ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::invalid_timeout(timeout, reason));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_builder() -> SupervisorConfigBuilder {
        SupervisorConfig::builder()
            .interpreter("python")
            .entry_script("/opt/codeintel/lib/server.py")
            .log_path("/tmp/codeintel3.log")
            .db_path("/tmp/codeintel3.db")
    }

    #[test]
    fn test_build_with_defaults() {
        let config = minimal_builder().build().unwrap();

        assert_eq!(config.library_path_var, "PYTHONPATH");
        assert_eq!(config.startup_timeout, Duration::from_secs(30));
        assert_eq!(config.stop_timeout, Duration::from_secs(5));
        assert_eq!(config.restart_policy, RestartPolicy::default());
        assert_eq!(config.handshake.name(), "marker-line");
        assert_eq!(
            config.effective_working_directory(),
            Some(PathBuf::from("/opt/codeintel/lib"))
        );
        assert_eq!(config.library_path_value().unwrap(), None);
    }

    #[test]
    fn test_missing_fields() {
        let result = SupervisorConfig::builder().interpreter("python").build();
        assert!(matches!(result, Err(ConfigError::MissingField { ref field }) if field == "entry_script"));

        let result = SupervisorConfig::builder().build();
        assert!(matches!(result, Err(ConfigError::MissingField { ref field }) if field == "interpreter"));
    }

    #[test]
    fn test_invalid_values() {
        let result = minimal_builder().startup_timeout(Duration::ZERO).build();
        assert!(matches!(result, Err(ConfigError::InvalidTimeout { .. })));

        let result = minimal_builder().interpreter("").build();
        assert!(matches!(result, Err(ConfigError::InvalidPath { .. })));

        let result = minimal_builder()
            .working_directory("/nonexistent/codeintel/dir")
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidPath { .. })));

        let result = minimal_builder()
            .restart_policy(RestartPolicy {
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(1),
                ..RestartPolicy::default()
            })
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidRestartPolicy { .. })));
    }

    #[test]
    fn test_command_args_first_start_flag() {
        let config = minimal_builder().build().unwrap();

        assert_eq!(
            config.command_args(true),
            vec![
                "/opt/codeintel/lib/server.py",
                "-l",
                "/tmp/codeintel3.log",
                "-f",
                "/tmp/codeintel3.db",
                "-t",
                "true"
            ]
        );

        let restarted = config.command_args(false);
        assert_eq!(restarted.len(), 5);
        assert_eq!(restarted[..], config.command_args(true)[..5]);
    }

    #[cfg(unix)]
    #[test]
    fn test_library_path_joined_with_platform_separator() {
        let config = minimal_builder()
            .add_library_path("/a/lib")
            .add_library_path("/b/lib")
            .build()
            .unwrap();

        assert_eq!(
            config.library_path_value().unwrap(),
            Some(OsString::from("/a/lib:/b/lib"))
        );

        let result = minimal_builder().add_library_path("/bad:path").build();
        assert!(matches!(result, Err(ConfigError::LibraryPath(_))));
    }

    #[test]
    fn test_restart_policy_backoff() {
        let policy = RestartPolicy::default();

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));

        assert!(policy.allows_attempt(5));
        assert!(!policy.allows_attempt(6));
        assert!(!RestartPolicy::disabled().allows_attempt(1));
    }
}
