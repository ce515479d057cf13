//! Gateway configuration loaded from YAML.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::GatewayError;

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// SSH server listen address (default: ":2233")
    pub address: String,

    /// Name of the container network every workspace joins. Empty disables
    /// network management.
    pub network_group: String,

    /// Path to the SSH host private key. Generated if absent.
    pub server_key_file: PathBuf,

    /// Host directory under which each user gets a private workspace,
    /// bind-mounted at /mnt/data. Unset disables the workspace volume and
    /// the manager feature.
    pub workspace_parent: Option<PathBuf>,

    /// Host directory bind-mounted into every container at /mnt/share.
    pub global_share_dir: Option<PathBuf>,

    /// Container runtime name handed to the engine (e.g. "runsc"). Empty
    /// uses the engine default.
    pub runtime: String,

    /// Bind address of the shared management service. Required when any
    /// template sets enable-manager.
    pub manager_address: Option<String>,

    /// Key-set name → authorized_keys lines.
    pub keys: HashMap<String, Vec<String>>,

    /// Key-set name → access-control list.
    pub access_control: HashMap<String, AccessControl>,

    /// Login pattern (regex) → container template.
    pub templates: HashMap<String, ContainerTemplate>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: ":2233".to_string(),
            network_group: String::new(),
            server_key_file: PathBuf::from("id_rsa"),
            workspace_parent: None,
            global_share_dir: None,
            runtime: String::new(),
            manager_address: None,
            keys: HashMap::new(),
            access_control: HashMap::new(),
            templates: HashMap::new(),
        }
    }
}

/// Login-name patterns admitted by a key-set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AccessControl {
    pub patterns: Vec<String>,
}

/// Describes how to materialise a container for a matched login.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ContainerTemplate {
    /// Image reference.
    pub image: String,

    /// Default interactive argv, used when the client requests a plain shell.
    pub exec: Vec<String>,

    /// Container entry cmd. Empty keeps the image default.
    pub cmd: Vec<String>,

    /// Environment ("K=V" lines) for the container itself.
    pub env: Vec<String>,

    /// Extra "host:guest" bind mounts.
    pub volumes: Vec<String>,

    /// Run the container privileged.
    pub privilege: bool,

    /// Auto-remove the container when it exits.
    pub rm: bool,

    /// Expose the management service to this container.
    pub enable_manager: bool,

    /// Source-port window the container may ask to have forwarded.
    pub port_forwarding: Option<PortRange>,
}

/// Allowed host-side source ports for container-requested forwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PortRange {
    pub min_port: u16,
    pub max_port: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.min_port && port <= self.max_port
    }
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document without touching the
    /// filesystem.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Validate invariants and initialise the configured directories.
    pub fn validate(&mut self) -> Result<()> {
        if let Some(dir) = self.workspace_parent.take() {
            self.workspace_parent = Some(init_abs_dir(&dir)?);
        }
        if let Some(dir) = self.global_share_dir.take() {
            self.global_share_dir = Some(init_abs_dir(&dir)?);
        }

        for (pattern, template) in &self.templates {
            if template.image.is_empty() {
                return Err(GatewayError::ConfigInvalid(format!(
                    "template {pattern:?} has no image"
                ))
                .into());
            }
            if template.exec.is_empty() {
                return Err(GatewayError::ConfigInvalid(format!(
                    "template {pattern:?} has no exec argv"
                ))
                .into());
            }
            if let Some(range) = template.port_forwarding {
                if range.min_port == 0 || range.min_port > range.max_port {
                    return Err(GatewayError::ConfigInvalid(format!(
                        "template {pattern:?} has an invalid port-forwarding range {}..{}",
                        range.min_port, range.max_port
                    ))
                    .into());
                }
            }
            if template.enable_manager {
                if self.workspace_parent.is_none() {
                    return Err(GatewayError::ConfigInvalid(format!(
                        "template {pattern:?}: enable-manager depends on workspace-parent"
                    ))
                    .into());
                }
                if self.manager_address.as_deref().unwrap_or("").is_empty() {
                    return Err(GatewayError::ConfigInvalid(format!(
                        "template {pattern:?}: enable-manager depends on manager-address"
                    ))
                    .into());
                }
            }
        }

        Ok(())
    }

    /// Host directory bind-mounted into the given user's container at
    /// /mnt/data. None when the workspace feature is disabled.
    pub fn workspace_dir(&self, user: &str) -> Option<PathBuf> {
        self.workspace_parent.as_ref().map(|parent| parent.join(user))
    }
}

/// Make `path` absolute and ensure it exists as a directory.
///
/// Missing directories are created with mode 0o600, matching the documented
/// behaviour; that mode is not traversable, so the operator is warned rather
/// than the mode silently widened.
fn init_abs_dir(path: &Path) -> Result<PathBuf> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    match std::fs::metadata(&abs) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(
                GatewayError::ConfigInvalid(format!("{} is not a directory", abs.display())).into(),
            )
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(&abs)
                .with_context(|| format!("failed to create data directory {}", abs.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&abs, std::fs::Permissions::from_mode(0o600))?;
                warn!(
                    "created {} with mode 0o600; the directory is not traversable \
                     until you chmod it",
                    abs.display()
                );
            }
        }
        Err(err) => return Err(err.into()),
    }
    Ok(abs)
}

/// Compiled template patterns in deterministic match order.
///
/// Patterns are scanned longest-first (ties broken lexicographically), so the
/// most specific pattern wins when several match a login.
pub struct TemplateIndex {
    entries: Vec<(Regex, ContainerTemplate)>,
}

impl TemplateIndex {
    pub fn build(templates: &HashMap<String, ContainerTemplate>) -> Result<Self> {
        let mut patterns: Vec<&String> = templates.keys().collect();
        patterns.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let mut entries = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let regex = Regex::new(pattern).map_err(|err| {
                GatewayError::ConfigInvalid(format!("bad template pattern {pattern:?}: {err}"))
            })?;
            entries.push((regex, templates[pattern].clone()));
        }
        Ok(Self { entries })
    }

    /// Resolve the template for a login name.
    pub fn resolve(&self, user: &str) -> Option<&ContainerTemplate> {
        self.entries
            .iter()
            .find(|(regex, _)| regex.is_match(user))
            .map(|(_, template)| template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
address: ":2233"
network-group: net
server-key-file: /etc/bubble/host_key
runtime: runsc
keys:
  admins:
    - "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl op@host"
access-control:
  admins:
    patterns: ["^root$", "^admin-.*"]
templates:
  ".*":
    image: alpine
    exec: ["/bin/sh"]
    env: ["LANG=C"]
    volumes: ["/opt/tools:/tools"]
    rm: true
"#;

    #[test]
    fn parses_sample_config() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.address, ":2233");
        assert_eq!(config.network_group, "net");
        assert_eq!(config.runtime, "runsc");
        assert_eq!(config.keys["admins"].len(), 1);
        assert_eq!(config.access_control["admins"].patterns.len(), 2);
        let template = &config.templates[".*"];
        assert_eq!(template.image, "alpine");
        assert_eq!(template.exec, vec!["/bin/sh"]);
        assert!(template.rm);
        assert!(!template.enable_manager);
    }

    #[test]
    fn defaults_apply() {
        let config = Config::parse("{}").unwrap();
        assert_eq!(config.address, ":2233");
        assert_eq!(config.server_key_file, PathBuf::from("id_rsa"));
        assert!(config.workspace_parent.is_none());
        assert!(config.templates.is_empty());
    }

    #[test]
    fn enable_manager_requires_workspace_parent() {
        let mut config = Config::parse(
            r#"
manager-address: "127.0.0.1:7777"
templates:
  ".*":
    image: alpine
    exec: ["/bin/sh"]
    enable-manager: true
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("workspace-parent"), "{err}");
    }

    #[test]
    fn enable_manager_requires_manager_address() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::parse(&format!(
            r#"
workspace-parent: {}
templates:
  ".*":
    image: alpine
    exec: ["/bin/sh"]
    enable-manager: true
"#,
            dir.path().join("ws").display()
        ))
        .unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("manager-address"), "{err}");
    }

    #[test]
    fn missing_exec_rejected() {
        let mut config = Config::parse(
            r#"
templates:
  ".*":
    image: alpine
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn created_dirs_keep_documented_mode() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("workspaces");
        let mut config = Config {
            workspace_parent: Some(target.clone()),
            ..Config::default()
        };
        config.validate().unwrap();

        assert!(target.is_dir());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&target).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn longest_pattern_wins() {
        let mut templates = HashMap::new();
        let catchall = ContainerTemplate {
            image: "base".to_string(),
            exec: vec!["/bin/sh".to_string()],
            ..ContainerTemplate::default()
        };
        let admin = ContainerTemplate {
            image: "admin".to_string(),
            ..catchall.clone()
        };
        templates.insert(".*".to_string(), catchall);
        templates.insert("^admin-.*".to_string(), admin);

        let index = TemplateIndex::build(&templates).unwrap();
        assert_eq!(index.resolve("admin-alice").unwrap().image, "admin");
        assert_eq!(index.resolve("bob").unwrap().image, "base");
    }

    #[test]
    fn unmatched_login_has_no_template() {
        let mut templates = HashMap::new();
        templates.insert(
            "^alice$".to_string(),
            ContainerTemplate {
                image: "base".to_string(),
                exec: vec!["/bin/sh".to_string()],
                ..ContainerTemplate::default()
            },
        );

        let index = TemplateIndex::build(&templates).unwrap();
        assert!(index.resolve("mallory").is_none());
    }

    #[test]
    fn bad_template_pattern_rejected() {
        let mut templates = HashMap::new();
        templates.insert(
            "(".to_string(),
            ContainerTemplate {
                image: "base".to_string(),
                exec: vec!["/bin/sh".to_string()],
                ..ContainerTemplate::default()
            },
        );
        assert!(TemplateIndex::build(&templates).is_err());
    }
}
