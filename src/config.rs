//! Configuration module for lodestone.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::{Result, SandboxError};

/// Lua keywords that cannot be used as the capability global name.
const LUA_KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

/// How the instruction ceiling is accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    /// The budget resets on every entry into the context (load, event, command, task).
    #[default]
    PerInvocation,
    /// The budget is cumulative for the whole lifetime of the context.
    PerContext,
}

/// Scripting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptingConfig {
    /// Directory holding the scripts; also the overlay root.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: String,
    /// Script loaded on startup.
    #[serde(default = "default_entry_script")]
    pub entry_script: String,
    /// Files read into the override map on every load.
    #[serde(default = "default_shared_modules")]
    pub shared_modules: Vec<String>,
    /// Global name the capability object is bound to.
    #[serde(default = "default_global_name")]
    pub global_name: String,
    /// Maximum number of VM instructions (0 = unlimited).
    #[serde(default = "default_max_instructions")]
    pub max_instructions: u64,
    /// Hook granularity in VM instructions.
    #[serde(default = "default_instruction_check_interval")]
    pub instruction_check_interval: u32,
    /// Instruction budget accounting.
    #[serde(default)]
    pub budget_scope: BudgetScope,
    /// Maximum Lua heap in megabytes (0 = unlimited).
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: usize,
    /// Cap for each captured output buffer, in bytes.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Send listener stderr and failures to the player an event is about.
    #[serde(default = "default_echo_errors_to_player")]
    pub echo_errors_to_player: bool,
}

fn default_scripts_dir() -> String {
    "scripts".to_string()
}

fn default_entry_script() -> String {
    "main.lua".to_string()
}

fn default_shared_modules() -> Vec<String> {
    vec!["utils.lua".to_string()]
}

fn default_global_name() -> String {
    "server".to_string()
}

fn default_max_instructions() -> u64 {
    1_000_000
}

fn default_instruction_check_interval() -> u32 {
    1_000
}

fn default_max_memory_mb() -> usize {
    16
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_echo_errors_to_player() -> bool {
    true
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            scripts_dir: default_scripts_dir(),
            entry_script: default_entry_script(),
            shared_modules: default_shared_modules(),
            global_name: default_global_name(),
            max_instructions: default_max_instructions(),
            instruction_check_interval: default_instruction_check_interval(),
            budget_scope: BudgetScope::default(),
            max_memory_mb: default_max_memory_mb(),
            max_output_bytes: default_max_output_bytes(),
            echo_errors_to_player: default_echo_errors_to_player(),
        }
    }
}

impl ScriptingConfig {
    /// Scripts directory as a path.
    pub fn scripts_path(&self) -> PathBuf {
        PathBuf::from(&self.scripts_dir)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/lodestone.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Console host configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Milliseconds per tick.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
}

fn default_tick_millis() -> u64 {
    50
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_millis: default_tick_millis(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Scripting configuration.
    #[serde(default)]
    pub scripting: ScriptingConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Console host configuration.
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(SandboxError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| SandboxError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `LODESTONE_SCRIPTS_DIR`: Override the scripts directory
    /// - `LODESTONE_LOG_LEVEL`: Override the log level
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("LODESTONE_SCRIPTS_DIR") {
            if !dir.is_empty() {
                self.scripting.scripts_dir = dir;
            }
        }
        if let Ok(level) = std::env::var("LODESTONE_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let name = &self.scripting.global_name;
        if !is_lua_identifier(name) {
            return Err(SandboxError::Validation(format!(
                "global_name '{name}' is not a valid Lua identifier"
            )));
        }
        if self.scripting.max_output_bytes == 0 {
            return Err(SandboxError::Validation(
                "max_output_bytes must be greater than zero".to_string(),
            ));
        }
        if self.server.tick_millis == 0 {
            return Err(SandboxError::Validation(
                "tick_millis must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn is_lua_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !LUA_KEYWORDS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.scripting.scripts_dir, "scripts");
        assert_eq!(config.scripting.entry_script, "main.lua");
        assert_eq!(config.scripting.shared_modules, vec!["utils.lua"]);
        assert_eq!(config.scripting.global_name, "server");
        assert_eq!(config.scripting.max_instructions, 1_000_000);
        assert_eq!(config.scripting.instruction_check_interval, 1_000);
        assert_eq!(config.scripting.budget_scope, BudgetScope::PerInvocation);
        assert_eq!(config.scripting.max_memory_mb, 16);
        assert_eq!(config.scripting.max_output_bytes, 65_536);
        assert!(config.scripting.echo_errors_to_player);

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.file, "logs/lodestone.log");

        assert_eq!(config.server.tick_millis, 50);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[scripting]
scripts_dir = "custom/scripts"
entry_script = "boot.lua"
shared_modules = ["utils.lua", "lib/math.lua"]
global_name = "host"
max_instructions = 5000
instruction_check_interval = 100
budget_scope = "per_context"
max_memory_mb = 4
max_output_bytes = 1024
echo_errors_to_player = false

[logging]
level = "debug"
file = "custom/logs/app.log"

[server]
tick_millis = 100
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.scripting.scripts_dir, "custom/scripts");
        assert_eq!(config.scripting.entry_script, "boot.lua");
        assert_eq!(config.scripting.shared_modules.len(), 2);
        assert_eq!(config.scripting.shared_modules[1], "lib/math.lua");
        assert_eq!(config.scripting.global_name, "host");
        assert_eq!(config.scripting.max_instructions, 5000);
        assert_eq!(config.scripting.instruction_check_interval, 100);
        assert_eq!(config.scripting.budget_scope, BudgetScope::PerContext);
        assert_eq!(config.scripting.max_memory_mb, 4);
        assert_eq!(config.scripting.max_output_bytes, 1024);
        assert!(!config.scripting.echo_errors_to_player);

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, "custom/logs/app.log");

        assert_eq!(config.server.tick_millis, 100);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[scripting]
entry_script = "game.lua"
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.scripting.entry_script, "game.lua");
        assert_eq!(config.scripting.scripts_dir, "scripts");
        assert_eq!(config.scripting.global_name, "server");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_empty_config() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.scripting.scripts_dir, "scripts");
        assert_eq!(config.server.tick_millis, 50);
    }

    #[test]
    fn test_parse_invalid_config() {
        let result = Config::parse("this is not valid toml [[[");

        assert!(result.is_err());
        if let Err(SandboxError::Config(msg)) = result {
            assert!(msg.contains("config parse error"));
        } else {
            panic!("Expected Config error");
        }
    }

    #[test]
    fn test_parse_unknown_budget_scope() {
        let result = Config::parse("[scripting]\nbudget_scope = \"forever\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Config::load("nonexistent.toml");
        assert!(matches!(result, Err(SandboxError::Io(_))));
    }

    #[test]
    fn test_apply_env_overrides_scripts_dir() {
        let original = std::env::var("LODESTONE_SCRIPTS_DIR").ok();

        std::env::set_var("LODESTONE_SCRIPTS_DIR", "/srv/scripts");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.scripting.scripts_dir, "/srv/scripts");

        std::env::set_var("LODESTONE_SCRIPTS_DIR", "");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.scripting.scripts_dir, "scripts");

        if let Some(val) = original {
            std::env::set_var("LODESTONE_SCRIPTS_DIR", val);
        } else {
            std::env::remove_var("LODESTONE_SCRIPTS_DIR");
        }
    }

    #[test]
    fn test_validate_default() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_bad_global_name() {
        for name in ["", "1abc", "my-host", "end", "a b"] {
            let mut config = Config::default();
            config.scripting.global_name = name.to_string();
            let result = config.validate();
            assert!(
                matches!(result, Err(SandboxError::Validation(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_zero_output_cap() {
        let mut config = Config::default();
        config.scripting.max_output_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_tick() {
        let mut config = Config::default();
        config.server.tick_millis = 0;
        assert!(config.validate().is_err());
    }
}
