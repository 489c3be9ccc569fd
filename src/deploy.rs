use std::fmt::{Display, Formatter};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::config;
use crate::kubectl::{self, Cluster, Invocation, Verb, CONFIG_MAP};

const API_CR_TEMPLATE: &str = include_str!("../resources/api_cr.yaml");

#[derive(Error, Debug)]
pub enum Error {
    #[error("swagger file path or project not found: {0}")]
    ArtifactNotFound(String),

    #[error("project {project} has no API definition at {definition}")]
    DefinitionNotFound {
        project: String,
        definition: String,
    },

    #[error("invalid mode '{0}': use privateJet or sidecar")]
    InvalidMode(String),

    #[error("create configmap '{name}': {err}")]
    ConfigMap {
        name: String,
        err: kubectl::Error,
    },

    #[error("API template: {0}")]
    Template(#[from] serde_yaml::Error),

    #[error("stage API resource: {0}")]
    IOError(#[from] std::io::Error),

    #[error("configure API '{name}': {err}")]
    Apply {
        name: String,
        err: kubectl::Error,
    },

    #[error("{cause}; deleted configmaps {}", .rolled_back.join(", "))]
    RolledBack {
        cause: Box<Error>,
        rolled_back: Vec<String>,
    },

    #[error("{cause}; deleting configmaps also failed ({err}), remove them manually: {}", .orphaned.join(", "))]
    RollbackFailed {
        cause: Box<Error>,
        err: kubectl::Error,
        orphaned: Vec<String>,
    },

    #[error("{}", not_found(.name, .namespace))]
    ApiNotFound {
        name: String,
        namespace: Option<String>,
    },

    #[error("read API '{name}': {err}")]
    ApiUnreadable {
        name: String,
        err: serde_json::Error,
    },
}

fn not_found(name: &str, namespace: &Option<String>) -> String {
    match namespace {
        Some(namespace) => format!("Could not find the API \"{name}\" in the namespace \"{namespace}\""),
        None => format!("Could not find the API \"{name}\""),
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Mode {
    PrivateJet,
    Sidecar,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "privateJet" => Ok(Mode::PrivateJet),
            "sidecar" => Ok(Mode::Sidecar),
            other => Err(Error::InvalidMode(other.to_string())),
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Mode::PrivateJet => "privateJet",
            Mode::Sidecar => "sidecar",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Request {
    /// A definition file, or a project directory holding one.
    pub artifact: PathBuf,
    pub name: String,
    pub namespace: Option<String>,
    /// Set for updates; makes config map names unique.
    pub update_timestamp: Option<String>,
    pub replicas: Option<u32>,
    pub mode: Option<Mode>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Metadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Interceptors {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ballerina: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub java: Vec<String>,
}

impl Interceptors {
    fn is_empty(&self) -> bool {
        self.ballerina.is_empty() && self.java.is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiSpec {
    #[serde(default)]
    pub swagger_config_map_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_config_map_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certs_config_map_name: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub update_time_stamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interceptors: Option<Interceptors>,
    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

/// The API custom resource. Template fields not modelled here pass through untouched.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiResource {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: ApiSpec,
}

impl ApiResource {
    pub fn template() -> Result<Self, Error> {
        Ok(serde_yaml::from_str(API_CR_TEMPLATE)?)
    }
}

/// The part of a deployed resource an update needs.
#[derive(Deserialize, Debug)]
struct Deployed {
    spec: DeployedSpec,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct DeployedSpec {
    swagger_config_map_name: String,
    #[serde(default)]
    interceptors: Interceptors,
}

/// Undo step for something created during a deploy.
#[derive(Debug, Clone, PartialEq)]
pub enum Compensation {
    DeleteConfigMap(String),
}

/// What to undo if the deploy does not finish.
#[derive(Debug, Default)]
pub struct Ledger {
    namespace: Option<String>,
    actions: Vec<Compensation>,
}

impl Ledger {
    pub fn new(namespace: Option<String>) -> Self {
        Self {
            namespace,
            actions: vec![],
        }
    }

    pub fn record(&mut self, compensation: Compensation) {
        self.actions.push(compensation);
    }

    pub fn config_maps(&self) -> Vec<String> {
        self.actions
            .iter()
            .map(|Compensation::DeleteConfigMap(name)| name.clone())
            .collect()
    }

    /// Delete everything recorded, all config maps in one command.
    pub fn compensate(&self, cluster: &dyn Cluster) -> Result<(), kubectl::Error> {
        let config_maps = self.config_maps();
        if config_maps.is_empty() {
            return Ok(());
        }
        cluster.run(&Invocation::delete(CONFIG_MAP, &config_maps).namespace(self.namespace.as_deref()))
    }
}

fn has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Every `*.jar` below `dir`, in path order.
fn jars(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut found = vec![];
    let mut entries = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();
    for path in entries {
        if path.is_dir() {
            found.extend(jars(&path)?);
        } else if path.extension().is_some_and(|ext| ext == "jar") {
            found.push(path);
        }
    }
    Ok(found)
}

/// Result of a successful add or update.
#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    pub name: String,
    pub namespace: Option<String>,
    pub config_maps: Vec<String>,
    /// Superseded config maps an update could not delete.
    pub orphaned: Vec<String>,
}

/// Deploy an API definition as config maps plus an API custom resource.
///
/// A fresh add creates the config maps, then the resource. If the resource cannot be
/// applied, every config map created on the way is deleted again. An update deploys
/// under a timestamp suffix and removes the superseded config maps afterwards; that
/// cleanup only warns when it fails.
pub struct Deployer<'a> {
    cluster: &'a dyn Cluster,
    api: &'a config::Api,
}

impl<'a> Deployer<'a> {
    pub fn new(cluster: &'a dyn Cluster, api: &'a config::Api) -> Self {
        Self { cluster, api }
    }

    /// The definition file to load into the config map.
    fn definition(&self, artifact: &Path) -> Result<PathBuf, Error> {
        if artifact.is_file() {
            return Ok(artifact.to_path_buf());
        }
        if !artifact.is_dir() {
            return Err(Error::ArtifactNotFound(artifact.display().to_string()));
        }
        let definition = artifact.join(&self.api.definition_path);
        if !definition.is_file() {
            return Err(Error::DefinitionNotFound {
                project: artifact.display().to_string(),
                definition: self.api.definition_path.clone(),
            });
        }
        Ok(definition)
    }

    fn create_config_map(&self, name: &str, source: &Path, namespace: Option<&str>) -> Result<(), Error> {
        info!("Creating configmap {name} from {}", source.display());
        let invocation = Invocation::create(CONFIG_MAP, name)
            .from_file(source.display().to_string())
            .namespace(namespace);
        self.cluster.run(&invocation).map_err(|err| Error::ConfigMap {
            name: name.to_string(),
            err,
        })
    }

    pub fn deploy(&self, request: &Request) -> Result<Deployment, Error> {
        let name = request.name.to_lowercase();
        let namespace = request.namespace.as_deref();
        let definition = self.definition(&request.artifact)?;
        let suffix = request
            .update_timestamp
            .as_ref()
            .map(|timestamp| format!("-{timestamp}"))
            .unwrap_or_default();

        let swagger = format!("{name}-swagger{suffix}");
        self.create_config_map(&swagger, &definition, namespace)?;

        let mut ledger = Ledger::new(request.namespace.clone());
        ledger.record(Compensation::DeleteConfigMap(swagger.clone()));

        match self.stage_and_apply(request, &name, &swagger, &suffix, &mut ledger) {
            Ok(()) => {
                info!("API {name} configured");
                Ok(Deployment {
                    name,
                    namespace: request.namespace.clone(),
                    config_maps: ledger.config_maps(),
                    orphaned: vec![],
                })
            }
            Err(cause) => Err(self.roll_back(&ledger, cause)),
        }
    }

    fn stage_and_apply(&self, request: &Request, name: &str, swagger: &str, suffix: &str, ledger: &mut Ledger) -> Result<(), Error> {
        let namespace = request.namespace.as_deref();

        let mut resource = ApiResource::template()?;
        resource.metadata.name = name.to_string();
        resource.metadata.namespace = request.namespace.clone();
        resource.spec.swagger_config_map_name = swagger.to_string();

        if request.artifact.is_dir() {
            let interceptors = self.interceptors(&request.artifact, name, suffix, namespace, ledger)?;
            if !interceptors.is_empty() {
                resource.spec.interceptors = Some(interceptors);
            }
        }

        if let Some(replicas) = request.replicas {
            resource.spec.replicas = Some(replicas);
        }
        if let Some(mode) = request.mode {
            resource.spec.mode = Some(mode);
        }

        // An update must not store its state as the initial configuration.
        let (verb, save_config) = match &request.update_timestamp {
            Some(timestamp) => {
                resource.spec.update_time_stamp = timestamp.clone();
                (Verb::Apply, false)
            }
            None => (Verb::Create, true),
        };

        let mut file = tempfile::Builder::new()
            .prefix("apicr-")
            .suffix(".yaml")
            .tempfile()?;
        file.write_all(serde_yaml::to_string(&resource)?.as_bytes())?;
        file.flush()?;
        debug!("API resource staged at {}", file.path().display());

        let invocation = Invocation::new(verb)
            .file(file.path())
            .namespace(namespace)
            .save_config(save_config);
        self.cluster.run(&invocation).map_err(|err| Error::Apply {
            name: name.to_string(),
            err,
        })
    }

    /// Config maps for the Ballerina interceptors directory and for each Java interceptor jar.
    fn interceptors(&self, project: &Path, name: &str, suffix: &str, namespace: Option<&str>, ledger: &mut Ledger) -> Result<Interceptors, Error> {
        let mut interceptors = Interceptors::default();

        let ballerina = project.join(&self.api.interceptors_dir);
        if has_entries(&ballerina) {
            let config_map = format!("{name}-bal-intcpt{suffix}");
            self.create_config_map(&config_map, &ballerina, namespace)?;
            ledger.record(Compensation::DeleteConfigMap(config_map.clone()));
            interceptors.ballerina.push(config_map);
        }

        let libs = project.join(&self.api.java_interceptors_dir);
        if libs.is_dir() {
            for (i, jar) in jars(&libs)?.iter().enumerate() {
                let config_map = format!("{name}-{i}-jar-intcpt{suffix}");
                self.create_config_map(&config_map, jar, namespace)?;
                ledger.record(Compensation::DeleteConfigMap(config_map.clone()));
                interceptors.java.push(config_map);
            }
        }
        Ok(interceptors)
    }

    fn roll_back(&self, ledger: &Ledger, cause: Error) -> Error {
        let config_maps = ledger.config_maps();
        warn!("{cause}; deleting created configmaps {}", config_maps.join(", "));
        match ledger.compensate(self.cluster) {
            Ok(()) => Error::RolledBack {
                cause: Box::new(cause),
                rolled_back: config_maps,
            },
            Err(err) => Error::RollbackFailed {
                cause: Box::new(cause),
                err,
                orphaned: config_maps,
            },
        }
    }

    /// Config maps referenced by the API currently in the cluster.
    fn current_config_maps(&self, name: &str, namespace: Option<&str>) -> Result<Vec<String>, Error> {
        let invocation = Invocation::get(&self.api.crd)
            .name(name)
            .namespace(namespace)
            .output("json");
        let output = self.cluster.output(&invocation).map_err(|err| {
            debug!("get {} {name}: {err}", self.api.crd);
            Error::ApiNotFound {
                name: name.to_string(),
                namespace: namespace.map(str::to_string),
            }
        })?;
        let deployed: Deployed = serde_json::from_str(&output).map_err(|err| Error::ApiUnreadable {
            name: name.to_string(),
            err,
        })?;

        let mut config_maps = vec![deployed.spec.swagger_config_map_name];
        config_maps.extend(deployed.spec.interceptors.ballerina);
        config_maps.extend(deployed.spec.interceptors.java);
        Ok(config_maps)
    }

    pub fn update(&self, request: Request) -> Result<Deployment, Error> {
        self.update_at(request, chrono::Utc::now().timestamp())
    }

    /// Replace a deployed API, suffixing new config maps with `timestamp`.
    pub fn update_at(&self, mut request: Request, timestamp: i64) -> Result<Deployment, Error> {
        request.name = request.name.to_lowercase();
        let superseded = self.current_config_maps(&request.name, request.namespace.as_deref())?;

        request.update_timestamp = Some(timestamp.to_string());
        let mut deployment = self.deploy(&request)?;

        let cleanup = Invocation::delete(CONFIG_MAP, &superseded).namespace(request.namespace.as_deref());
        if let Err(err) = self.cluster.run(&cleanup) {
            warn!(
                "API {} updated, but old configmaps {} could not be deleted: {err}",
                deployment.name,
                superseded.join(", ")
            );
            deployment.orphaned = superseded;
        }
        Ok(deployment)
    }
}
