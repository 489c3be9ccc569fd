use std::collections::BTreeMap;
use std::path::Path;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::debug;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use crate::kubectl::{self, Cluster};

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    ReadFile {
        err: std::io::Error,
        path: String,
    },

    #[error("serialize: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("create {kind} '{name}': {err}")]
    Create {
        kind: &'static str,
        name: String,
        err: kubectl::Error,
    },
}

pub const DOCKER_CONFIG_JSON: &str = ".dockerconfigjson";

#[derive(Serialize, Debug, PartialEq)]
pub struct Metadata {
    pub name: String,
    pub namespace: String,
}

/// A secret or config map, as handed to `kubectl apply`.
#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub metadata: Metadata,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub typ: Option<&'static str>,
    pub data: BTreeMap<String, String>,
}

impl Manifest {
    fn new(kind: &'static str, name: &str, namespace: &str) -> Self {
        Self {
            api_version: "v1",
            kind,
            metadata: Metadata {
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            typ: None,
            data: BTreeMap::new(),
        }
    }

    pub fn to_yaml(&self) -> Result<String, Error> {
        Ok(serde_yaml::to_string(self)?)
    }
}

pub fn base64(data: impl AsRef<[u8]>) -> String {
    STANDARD.encode(data)
}

/// Secret of type `kubernetes.io/dockerconfigjson` holding one registry server.
///
/// Registries that allow anonymous access get the `N/A` placeholder as credentials.
pub fn docker_config_secret(name: &str, namespace: &str, server: &str, username: &str, password: &str) -> Manifest {
    let (username, password) = if username.is_empty() {
        ("N/A", "N/A")
    } else {
        (username, password)
    };
    let mut servers = serde_json::Map::new();
    servers.insert(
        server.to_string(),
        json!({
            "username": username,
            "password": password,
            "auth": base64(format!("{username}:{password}")),
        }),
    );
    let auths = json!({ "auths": servers });

    let mut secret = Manifest::new("Secret", name, namespace);
    secret.typ = Some("kubernetes.io/dockerconfigjson");
    secret.data.insert(DOCKER_CONFIG_JSON.to_string(), base64(auths.to_string()));
    secret
}

/// Opaque secret holding the contents of `path` under `key`.
pub fn file_secret(name: &str, namespace: &str, path: &Path, key: &str) -> Result<Manifest, Error> {
    let contents = std::fs::read(path).map_err(|err| Error::ReadFile {
        err,
        path: path.display().to_string(),
    })?;
    let mut secret = Manifest::new("Secret", name, namespace);
    secret.data.insert(key.to_string(), base64(contents));
    Ok(secret)
}

pub fn config_map(name: &str, namespace: &str, data: BTreeMap<String, String>) -> Manifest {
    let mut config_map = Manifest::new("ConfigMap", name, namespace);
    config_map.data = data;
    config_map
}

/// Render the manifest and apply it on the cluster through standard input.
pub fn create(cluster: &dyn Cluster, manifest: &Manifest) -> Result<(), Error> {
    debug!("Applying {} {}/{}", manifest.kind, manifest.metadata.namespace, manifest.metadata.name);
    cluster
        .apply_stdin(&manifest.to_yaml()?)
        .map_err(|err| Error::Create {
            kind: manifest.kind,
            name: manifest.metadata.name.clone(),
            err,
        })
}
