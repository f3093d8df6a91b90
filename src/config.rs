//! Config parser - loads Fleetfile.yaml and builds the server/task model

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG: &str = "Fleetfile.yaml";

/// Top-level configuration: servers, tasks and the optional log sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub servers: HashMap<String, Server>,
    #[serde(default)]
    pub tasks: HashMap<String, Task>,
    #[serde(default)]
    pub log: LogConfig,
}

/// Log file sink settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub enabled: bool,
    pub path: Option<String>,
}

/// A server declared with a single host or a list of hosts.
///
/// A multi-host server is expanded at load time into indexed siblings
/// named `base[0]`, `base[1]`, … — the base entry stays in the map for
/// lookup but is never targeted directly for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_key")]
    pub key: String,
}

impl Server {
    /// First hostname, used to dial the connection
    pub fn address(&self) -> Option<&str> {
        self.hosts
            .first()
            .map(String::as_str)
            .or(self.host.as_deref())
    }

    fn hostnames(&self) -> Vec<String> {
        if !self.hosts.is_empty() {
            self.hosts.clone()
        } else if let Some(h) = &self.host {
            vec![h.clone()]
        } else {
            Vec::new()
        }
    }

    fn is_multi(&self) -> bool {
        self.hosts.len() > 1
    }
}

fn default_user() -> String {
    std::env::var("USER").unwrap_or_default()
}

fn default_port() -> u16 {
    22
}

fn default_key() -> String {
    "~/.ssh/id_rsa".to_string()
}

/// A named, ordered sequence of script steps targeting one or more servers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub on: Vec<String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub scripts: Vec<Script>,
}

/// One script step — exactly one of five kinds.
///
/// The upload variants carry a `local:remote` path pair, split on the
/// first `:`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Script {
    /// Shell command run on the control machine
    Local(String),
    /// Shell command run on the target host
    Run(String),
    /// Checksum-differential upload (changed files only, verified)
    Sync(String),
    /// Atomic archive upload (tar.gz, whole-unit replace)
    Tar(String),
    /// Direct upload (no verification)
    Scp(String),
}

impl Config {
    /// Load, expand and validate a config file.
    ///
    /// `$VAR` / `${VAR}` references in the raw text are replaced with
    /// environment values (empty when unset) before parsing.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => expand_tilde(&p.to_string_lossy()),
            None => PathBuf::from(DEFAULT_CONFIG),
        };

        let raw = std::fs::read_to_string(&path)?;
        Self::from_str(&raw)
    }

    /// Parse config from a YAML string (expansion + validation included)
    pub fn from_str(raw: &str) -> Result<Self> {
        let expanded = expand_env(raw);
        let mut config: Config = serde_yaml::from_str(&expanded)?;
        config.expand_servers();
        config.validate()?;
        Ok(config)
    }

    /// Expand every multi-host server into indexed siblings
    fn expand_servers(&mut self) {
        let mut expanded = HashMap::new();
        for (name, server) in self.servers.drain() {
            let hostnames = server.hostnames();
            if hostnames.len() > 1 {
                for (i, host) in hostnames.iter().enumerate() {
                    expanded.insert(
                        format!("{}[{}]", name, i),
                        Server {
                            host: Some(host.clone()),
                            hosts: vec![host.clone()],
                            user: server.user.clone(),
                            port: server.port,
                            key: server.key.clone(),
                        },
                    );
                }
                // Keep the base entry for name resolution
                expanded.insert(
                    name,
                    Server {
                        hosts: hostnames,
                        ..server
                    },
                );
            } else {
                expanded.insert(
                    name,
                    Server {
                        hosts: hostnames,
                        ..server
                    },
                );
            }
        }
        self.servers = expanded;
    }

    /// Reject unknown servers and malformed upload specs before any
    /// network activity
    fn validate(&self) -> Result<()> {
        for task in self.tasks.values() {
            for target in &task.on {
                if !self.servers.contains_key(target) {
                    return Err(Error::UnknownServer(target.clone()));
                }
            }
            for script in &task.scripts {
                if let Script::Sync(spec) | Script::Tar(spec) | Script::Scp(spec) = script {
                    split_upload_spec(spec)?;
                }
            }
        }
        Ok(())
    }

    /// Map target names onto expanded siblings (`web` → `web[0]`, `web[1]`, …)
    pub fn expand_targets(&self, names: &[String]) -> Vec<String> {
        let mut result = Vec::new();
        for name in names {
            match self.servers.get(name) {
                Some(server) if server.is_multi() => {
                    for i in 0..server.hosts.len() {
                        result.push(format!("{}[{}]", name, i));
                    }
                }
                _ => result.push(name.clone()),
            }
        }
        result
    }
}

/// Split a `local:remote` upload spec on the first `:`
pub fn split_upload_spec(spec: &str) -> Result<(&str, &str)> {
    match spec.split_once(':') {
        Some((local, remote)) if !local.is_empty() && !remote.is_empty() => Ok((local, remote)),
        _ => Err(Error::UploadSpec(spec.to_string())),
    }
}

/// Expand a leading `~/` to the user's home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Replace `$VAR` / `${VAR}` with environment values, empty when unset
fn expand_env(raw: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap();
    re.replace_all(raw, |caps: &regex::Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        std::env::var(name).unwrap_or_default()
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
servers:
  production:
    host: prod.example.com
    user: deploy
  web:
    hosts: [w1.example.com, w2.example.com, w3.example.com]
    user: deploy
    port: 2222

tasks:
  deploy:
    description: "Deploy the app"
    on: [production]
    scripts:
      - local: cargo build --release
      - scp: target/release/app:/opt/app/app-new
      - run: systemctl restart app
  fanout:
    on: [web]
    parallel: true
    scripts:
      - run: uptime
"#;

    #[test]
    fn parses_servers_and_defaults() {
        let config = Config::from_str(SAMPLE).unwrap();
        let prod = &config.servers["production"];
        assert_eq!(prod.address(), Some("prod.example.com"));
        assert_eq!(prod.port, 22);
        assert_eq!(prod.key, "~/.ssh/id_rsa");
        assert_eq!(prod.user, "deploy");
    }

    #[test]
    fn parses_script_variants_in_order() {
        let config = Config::from_str(SAMPLE).unwrap();
        let scripts = &config.tasks["deploy"].scripts;
        assert_eq!(scripts[0], Script::Local("cargo build --release".into()));
        assert_eq!(
            scripts[1],
            Script::Scp("target/release/app:/opt/app/app-new".into())
        );
        assert_eq!(scripts[2], Script::Run("systemctl restart app".into()));
    }

    #[test]
    fn multi_host_server_expands_to_indexed_siblings() {
        let config = Config::from_str(SAMPLE).unwrap();
        for i in 0..3 {
            let name = format!("web[{}]", i);
            let sibling = config.servers.get(&name).expect("expanded sibling");
            assert_eq!(sibling.hosts.len(), 1);
            assert_eq!(sibling.port, 2222);
        }
        // Base entry survives for lookup
        assert!(config.servers.contains_key("web"));

        let targets = config.expand_targets(&["web".to_string()]);
        assert_eq!(targets, vec!["web[0]", "web[1]", "web[2]"]);
    }

    #[test]
    fn single_host_target_is_not_expanded() {
        let config = Config::from_str(SAMPLE).unwrap();
        let targets = config.expand_targets(&["production".to_string()]);
        assert_eq!(targets, vec!["production"]);
    }

    #[test]
    fn unknown_target_server_is_a_config_error() {
        let raw = r#"
servers:
  a:
    host: a.example.com
tasks:
  t:
    on: [missing]
    scripts:
      - run: true
"#;
        let err = Config::from_str(raw).unwrap_err();
        assert!(matches!(err, Error::UnknownServer(name) if name == "missing"));
    }

    #[test]
    fn malformed_upload_spec_is_a_config_error() {
        let raw = r#"
servers:
  a:
    host: a.example.com
tasks:
  t:
    on: [a]
    scripts:
      - scp: no-separator
"#;
        let err = Config::from_str(raw).unwrap_err();
        assert!(matches!(err, Error::UploadSpec(_)));
    }

    #[test]
    fn upload_spec_splits_on_first_colon_only() {
        let (local, remote) = split_upload_spec("dist:/srv/app:v2").unwrap();
        assert_eq!(local, "dist");
        assert_eq!(remote, "/srv/app:v2");

        assert!(split_upload_spec(":remote").is_err());
        assert!(split_upload_spec("local:").is_err());
        assert!(split_upload_spec("plain").is_err());
    }

    #[test]
    fn env_vars_are_expanded_before_parsing() {
        std::env::set_var("FLEETRUN_TEST_HOST", "env.example.com");
        let raw = r#"
servers:
  a:
    host: ${FLEETRUN_TEST_HOST}
    user: deploy$FLEETRUN_TEST_UNSET_VAR
tasks: {}
"#;
        let config = Config::from_str(raw).unwrap();
        assert_eq!(config.servers["a"].address(), Some("env.example.com"));
        // Unset variables expand to the empty string
        assert_eq!(config.servers["a"].user, "deploy");
    }
}

