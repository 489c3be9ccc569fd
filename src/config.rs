use serde::Deserialize;
use serde_inline_default::serde_inline_default;
use std::collections::HashMap;
use thiserror::Error;

const DEFAULT_CONFIG: &str = include_str!("../default.toml");

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    ReadFile {
        err: std::io::Error,
        path: String,
    },

    #[error("parse: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown component '{0}'")]
    UnknownComponent(String),
}

/// An apiop.toml file.
#[derive(Deserialize, Debug, Clone)]
pub struct File {
    pub description: Option<String>,
    pub kubectl: String,
    pub operator: Operator,
    pub registry: Registry,
    pub api: Api,
    #[serde(default = "HashMap::new")]
    pub components: HashMap<String, Component>,
}

impl Default for File {
    fn default() -> Self {
        // The default config is compiled into the program, so
        // make sure to test default() to catch panics compile-time.
        toml::from_str(DEFAULT_CONFIG).unwrap()
    }
}

impl File {
    /// Read a user configuration file and lay it over the built-in defaults.
    /// Keys missing from the user file keep their default values.
    pub fn default_with_user_config_file(path: &str) -> Result<Self, Error> {
        let user = std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
            err,
            path: path.to_string(),
        })?;
        Self::merged(&user)
    }

    fn merged(user: &str) -> Result<Self, Error> {
        let mut table: toml::Table = toml::from_str(DEFAULT_CONFIG)?;
        merge(&mut table, toml::from_str(user)?);
        Ok(toml::Value::Table(table).try_into()?)
    }

    pub fn component(&self, key: &str) -> Result<&Component, Error> {
        self.components
            .get(key)
            .ok_or_else(|| Error::UnknownComponent(key.to_string()))
    }
}

fn merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge(existing, incoming)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Operator {
    pub namespace: String,
    pub controller_config: String,
    pub registry_type_key: String,
    pub repository_key: String,
    #[serde_inline_default(20)]
    pub install_wait_seconds: u64,
    #[serde(default)]
    pub wait_for: Vec<String>,
    /// Deleted, along with the namespace, on uninstall.
    #[serde(default)]
    pub crds: Vec<String>,
}

/// Secret names and endpoints used by the registry providers.
#[derive(Deserialize, Debug, Clone)]
pub struct Registry {
    pub docker_hub_login_url: String,
    pub docker_hub_server: String,
    pub credentials_secret: String,
    pub ecr_config_map: String,
    pub ecr_credentials_secret: String,
    pub gcr_key_secret: String,
    pub gcr_key_file: String,
    pub gcr_pull_secret: String,
}

#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Api {
    pub crd: String,
    #[serde_inline_default("Definitions/swagger.yaml".to_string())]
    pub definition_path: String,
    #[serde_inline_default("Interceptors".to_string())]
    pub interceptors_dir: String,
    #[serde_inline_default("libs".to_string())]
    pub java_interceptors_dir: String,
}

/// A remotely versioned configuration bundle, e.g. the API Operator.
#[derive(Deserialize, Debug, Clone)]
pub struct Component {
    pub name: String,
    pub version_env: String,
    pub default_version: String,
    /// Contains a `{version}` placeholder.
    pub validation_url: String,
    pub discovery_url: String,
    /// Contains a `{version}` placeholder.
    pub configs_url: String,
}

impl Component {
    pub fn configs_url(&self, version: &str) -> String {
        self.configs_url.replace("{version}", version)
    }
}
