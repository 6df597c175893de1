use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use atelier_error::AtelierError;

pub(crate) const CONFIG_FILE: &str = "atelier.json";

/// Per-project configuration, loaded once when the instance is created and
/// immutable afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    working_dir: PathBuf,
    data_dir: PathBuf,
    pub options: Options,
    pub permissions: PermissionOptions,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub lsp: BTreeMap<String, LspServerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Options {
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionOptions {
    /// Grant every tool permission request for this project without asking.
    #[serde(default)]
    pub skip_requests: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type", default)]
    pub provider_type: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LspServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    options: Options,
    #[serde(default)]
    permissions: PermissionOptions,
    #[serde(default)]
    providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    lsp: BTreeMap<String, LspServerConfig>,
}

impl Config {
    /// Reads `<working_dir>/atelier.json` when present and merges provider
    /// credentials from the environment. A missing file yields a default,
    /// unconfigured project; a malformed file is a `Config` error.
    pub fn load(working_dir: &Path, data_dir: &Path) -> Result<Self, AtelierError> {
        let path = working_dir.join(CONFIG_FILE);
        let file = if path.is_file() {
            let raw = std::fs::read_to_string(&path).map_err(|err| AtelierError::Config {
                message: format!("{}: {err}", path.display()),
            })?;
            serde_json::from_str::<ConfigFile>(&raw).map_err(|err| AtelierError::Config {
                message: format!("{}: {err}", path.display()),
            })?
        } else {
            ConfigFile::default()
        };

        let mut providers = file.providers;
        for (env, name) in [
            ("ANTHROPIC_API_KEY", "anthropic"),
            ("OPENAI_API_KEY", "openai"),
        ] {
            if let Ok(key) = std::env::var(env) {
                if !key.is_empty() {
                    providers
                        .entry(name.to_string())
                        .or_default()
                        .api_key
                        .get_or_insert(key);
                }
            }
        }

        Ok(Self {
            working_dir: working_dir.to_path_buf(),
            data_dir: data_dir.to_path_buf(),
            options: file.options,
            permissions: file.permissions,
            providers,
            lsp: file.lsp,
        })
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// A project is configured once at least one provider carries either a
    /// credential or an endpoint. The built-in `mock` provider always counts.
    pub fn is_configured(&self) -> bool {
        self.providers.iter().any(|(name, p)| {
            name == "mock" || p.api_key.is_some() || p.base_url.is_some()
        })
    }

    pub fn has_mock_provider(&self) -> bool {
        self.providers.contains_key("mock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_unconfigured_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path(), &dir.path().join(".atelier")).unwrap();
        assert!(!config.options.debug);
        assert!(!config.permissions.skip_requests);
        assert!(config.lsp.is_empty());
        assert!(!config.has_mock_provider());
    }

    #[test]
    fn permissions_block_is_read_from_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"permissions":{"skip_requests":true}}"#,
        )
        .unwrap();

        let config = Config::load(dir.path(), &dir.path().join(".atelier")).unwrap();
        assert!(config.permissions.skip_requests);
    }

    #[test]
    fn mock_provider_marks_project_configured() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"providers":{"mock":{}},"lsp":{"gopls":{"command":"gopls"}}}"#,
        )
        .unwrap();

        let config = Config::load(dir.path(), &dir.path().join(".atelier")).unwrap();
        assert!(config.is_configured());
        assert!(config.has_mock_provider());
        assert_eq!(config.lsp["gopls"].command, "gopls");
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{not json").unwrap();

        let err = Config::load(dir.path(), &dir.path().join(".atelier")).unwrap_err();
        assert!(matches!(err, AtelierError::Config { .. }));
    }
}
