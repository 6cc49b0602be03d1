use std::io;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Result;
use crate::policy::Policy;

const CONFIG_TOML_FILE: &str = "config.toml";

/// Ceilings applied when the config file does not set its own.
const DEFAULT_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_MAX_OUTPUT_BYTES: u64 = 10_000_000;

/// Curated allow set: everyday development tools. Policy regexes match the
/// reconstructed command line, so prefixes are anchored.
const DEFAULT_ALLOW: &[&str] = &[
    r"^git(\s.*)?$",
    r"^cargo(\s.*)?$",
    r"^ls(\s.*)?$",
    r"^cat(\s.*)?$",
    r"^head(\s.*)?$",
    r"^tail(\s.*)?$",
    r"^grep(\s.*)?$",
    r"^rg(\s.*)?$",
    r"^find(\s.*)?$",
    r"^echo(\s.*)?$",
    r"^printf(\s.*)?$",
    r"^pwd$",
    r"^wc(\s.*)?$",
    r"^which(\s.*)?$",
    r"^sed(\s.*)?$",
    r"^awk(\s.*)?$",
    r"^sort(\s.*)?$",
    r"^uniq(\s.*)?$",
    r"^seq(\s.*)?$",
    r"^sleep(\s.*)?$",
    r"^env$",
    r"^make(\s.*)?$",
    r"^npm(\s.*)?$",
    r"^node(\s.*)?$",
    r"^python3?(\s.*)?$",
    r"^rustc(\s.*)?$",
    r"^rustfmt(\s.*)?$",
];

/// Curated deny set: pushes to protected branches stay blocked even though
/// `git` itself is allowlisted.
const DEFAULT_DENY: &[&str] = &[
    r"git\s+push\s+.*\b(main|master)\b",
    r"git\s+push\s+.*--force",
];

/// Environment variable names forwarded to children by default.
const DEFAULT_ENV_ALLOWLIST: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "LANG", "LC_ALL", "TERM", "TMPDIR", "TZ",
];

/// On-disk shape of `$SHEMCP_HOME/config.toml`. Every field is optional;
/// the file itself is optional too.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ConfigToml {
    pub allow: Option<Vec<String>>,
    pub deny: Option<Vec<String>>,
    pub timeout_seconds: Option<u64>,
    pub max_output_bytes: Option<u64>,
    pub env_allowlist: Option<Vec<String>>,
    pub worktree_detection: Option<bool>,
}

/// Returns the state directory: `$SHEMCP_HOME` when set and non-empty,
/// otherwise `$HOME/.shemcp`. The directory is created if missing so the
/// debug log and spill store always have a home.
pub fn find_shemcp_home() -> io::Result<PathBuf> {
    let home = match std::env::var("SHEMCP_HOME") {
        Ok(value) if !value.is_empty() => PathBuf::from(value),
        _ => dirs::home_dir()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "could not find home directory"))?
            .join(".shemcp"),
    };
    std::fs::create_dir_all(&home)?;
    Ok(home)
}

/// Loads `config.toml` from the state directory. A missing file yields the
/// defaults; a malformed file is a startup error.
pub fn load_config_toml(shemcp_home: &Path) -> io::Result<ConfigToml> {
    let config_path = shemcp_home.join(CONFIG_TOML_FILE);
    match std::fs::read_to_string(&config_path) {
        Ok(contents) => toml::from_str(&contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!("{} not found, using defaults", config_path.display());
            Ok(ConfigToml::default())
        }
        Err(e) => Err(e),
    }
}

impl ConfigToml {
    /// Compiles the configured (or default) rule sets into the immutable
    /// process policy. Regex errors here are fatal at startup.
    pub fn into_policy(self, sandbox_root: PathBuf) -> Result<Policy> {
        let allow = self
            .allow
            .unwrap_or_else(|| DEFAULT_ALLOW.iter().map(|s| s.to_string()).collect());
        let deny = self
            .deny
            .unwrap_or_else(|| DEFAULT_DENY.iter().map(|s| s.to_string()).collect());
        let env_allowlist = self.env_allowlist.unwrap_or_else(|| {
            DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect()
        });
        let timeout_ms = self
            .timeout_seconds
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS)
            .saturating_mul(1_000);
        let max_output_bytes = self.max_output_bytes.unwrap_or(DEFAULT_MAX_OUTPUT_BYTES);

        Policy::new(
            sandbox_root,
            self.worktree_detection.unwrap_or(true),
            allow,
            deny,
            timeout_ms,
            max_output_bytes,
            env_allowlist,
        )
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn missing_config_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_config_toml(tmp.path()).unwrap();
        assert_eq!(config, ConfigToml::default());
    }

    #[test]
    fn config_file_overrides_defaults() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_TOML_FILE),
            r#"
allow = ["^true$"]
deny = ["rm"]
timeout_seconds = 30
max_output_bytes = 50000
env_allowlist = ["PATH"]
worktree_detection = false
"#,
        )
        .unwrap();

        let config = load_config_toml(tmp.path()).unwrap();
        let policy = config.into_policy(tmp.path().to_path_buf()).unwrap();
        assert_eq!(policy.timeout_ms(), 30_000);
        assert_eq!(policy.max_output_bytes(), 50_000);
        assert!(!policy.worktree_detection());
        assert_eq!(policy.allow_sources(), ["^true$"]);
        assert_eq!(policy.deny_sources(), ["rm"]);
        assert!(policy.check_command_policy("true").allowed);
        assert!(!policy.check_command_policy("git status").allowed);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(CONFIG_TOML_FILE), "allow = 3").unwrap();
        assert!(load_config_toml(tmp.path()).is_err());
    }

    #[test]
    fn default_policy_allows_dev_tools_and_protects_branches() {
        let tmp = TempDir::new().unwrap();
        let policy = ConfigToml::default()
            .into_policy(tmp.path().to_path_buf())
            .unwrap();
        assert!(policy.check_command_policy("git status").allowed);
        assert!(policy.check_command_policy("echo hello").allowed);
        assert!(policy.check_command_policy("seq 1 100").allowed);
        assert!(!policy.check_command_policy("git push origin main").allowed);
        assert!(!policy.check_command_policy("curl http://x").allowed);
        assert_eq!(policy.timeout_ms(), 300_000);
        assert_eq!(policy.max_output_bytes(), 10_000_000);
    }
}
