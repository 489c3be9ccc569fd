use std::path::{Path, PathBuf};
use std::time::Duration;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;
use crate::config;
use crate::kubectl::{self, Cluster, Invocation, Verb};
use crate::prompt::{self, Prompt};
use crate::registry::{self, Catalog, FlagValues, Session, Target};

#[derive(Error, Debug)]
pub enum Error {
    #[error("read configs from {url}: {err}")]
    Fetch {
        url: String,
        err: reqwest::Error,
    },

    #[error("read configs from {path}: {err}")]
    ReadFile {
        path: String,
        err: std::io::Error,
    },

    #[error("configs not found: {0}")]
    NotFound(String),

    #[error("parse configs: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("stage configs: {0}")]
    IOError(#[from] std::io::Error),

    #[error("apply configs: {0}")]
    Apply(#[from] kubectl::Error),

    #[error("delete {what}: {err}")]
    Delete {
        what: String,
        err: kubectl::Error,
    },

    #[error(transparent)]
    Registry(#[from] registry::Error),

    #[error(transparent)]
    Prompt(#[from] prompt::Error),
}

/// Where the operator configs come from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Url(String),
    /// A file, or a directory of `*.yaml`/`*.yml` files.
    Path(PathBuf),
}

impl Source {
    pub fn parse(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            Source::Url(location.to_string())
        } else {
            Source::Path(location.into())
        }
    }
}

fn read_file(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
        path: path.display().to_string(),
        err,
    })
}

/// Raw contents of every config file in `source`.
pub async fn read_configs(http: &reqwest::Client, source: &Source) -> Result<Vec<String>, Error> {
    match source {
        Source::Url(url) => {
            info!("Installing controller configs from {url}");
            let fetch = |err: reqwest::Error| Error::Fetch { url: url.clone(), err };
            let resp = http.get(url).send().await.map_err(fetch)?;
            let body = resp.error_for_status().map_err(fetch)?.text().await.map_err(fetch)?;
            Ok(vec![body])
        }
        Source::Path(path) if path.is_file() => {
            info!("Installing controller configs from file {}", path.display());
            Ok(vec![read_file(path)?])
        }
        Source::Path(path) if path.is_dir() => {
            info!("Installing controller configs from directory {}", path.display());
            let mut files = std::fs::read_dir(path)?
                .map(|entry| entry.map(|entry| entry.path()))
                .collect::<Result<Vec<_>, _>>()?;
            files.retain(|file| matches!(file.extension().and_then(|ext| ext.to_str()), Some("yaml" | "yml")));
            files.sort();
            files.iter().map(|file| read_file(file)).collect()
        }
        Source::Path(path) => Err(Error::NotFound(path.display().to_string())),
    }
}

/// Split multi-document YAML, dropping empty documents.
pub fn split_documents(contents: &[String]) -> Result<Vec<Value>, Error> {
    let mut documents = vec![];
    for text in contents {
        for document in serde_yaml::Deserializer::from_str(text) {
            let value = Value::deserialize(document)?;
            if !value.is_null() {
                documents.push(value);
            }
        }
    }
    Ok(documents)
}

/// Definitions the rest of the configs depend on.
fn is_bootstrap(document: &Value) -> bool {
    let kind = document["kind"].as_str().unwrap_or_default();
    kind.eq_ignore_ascii_case("CustomResourceDefinition") || kind.eq_ignore_ascii_case("Namespace")
}

/// Apply all documents with a single kubectl call.
fn apply_all(cluster: &dyn Cluster, documents: &[Value]) -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    for (i, document) in documents.iter().enumerate() {
        std::fs::write(dir.path().join(format!("{i:03}.yaml")), serde_yaml::to_string(document)?)?;
    }
    Ok(cluster.run(&Invocation::new(Verb::Apply).file(dir.path()))?)
}

/// Poll once a second until every resource type is served, for at most `max_seconds`.
pub async fn wait_for(cluster: &dyn Cluster, resource_types: &[String], max_seconds: u64) -> bool {
    for attempt in 0..max_seconds {
        if resource_types.iter().all(|resource_type| cluster.probe(&Invocation::get(resource_type))) {
            debug!("Resource types available after {attempt} seconds");
            return true;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    false
}

/// Apply CRDs and namespaces first, wait for them to be served, then apply the rest.
pub async fn apply_configs(cluster: &dyn Cluster, operator: &config::Operator, documents: Vec<Value>) -> Result<(), Error> {
    let (bootstrap, rest): (Vec<_>, Vec<_>) = documents.into_iter().partition(is_bootstrap);

    if !bootstrap.is_empty() {
        info!("Applying {} CRDs and namespaces", bootstrap.len());
        apply_all(cluster, &bootstrap)?;
    }

    if !rest.is_empty() {
        if !bootstrap.is_empty() && !operator.wait_for.is_empty() {
            info!("Waiting for resource creation...");
            if !wait_for(cluster, &operator.wait_for, operator.install_wait_seconds).await {
                warn!("Resource types {} not available after {} seconds", operator.wait_for.join(", "), operator.install_wait_seconds);
            }
        }
        info!("Applying {} controller configs", rest.len());
        apply_all(cluster, &rest)?;
    }
    Ok(())
}

/// Install the API Operator and point it at the selected registry.
///
/// Registry credentials are read before anything is applied.
pub async fn api_operator(
    target: &Target<'_>,
    session: &mut Session<'_>,
    catalog: &mut Catalog,
    operator: &config::Operator,
    source: &Source,
    flags: Option<&FlagValues>,
) -> Result<(), Error> {
    catalog.gather_active(session, flags).await?;

    let contents = read_configs(session.http, source).await?;
    let documents = split_documents(&contents)?;
    apply_configs(target.cluster, operator, documents).await?;

    catalog.update_configs_secrets(target, operator)?;
    info!("API Operator installed");
    Ok(())
}

/// Remove the API Operator namespace, with everything in it, and the operator CRDs.
///
/// Asks first unless `force` is set. Returns whether anything was removed.
pub fn uninstall_api_operator(
    cluster: &dyn Cluster,
    prompt: &mut dyn Prompt,
    operator: &config::Operator,
    version: &str,
    force: bool,
) -> Result<bool, Error> {
    if !force {
        prompt.say(&format!(
            "Uninstall \"api-operator-{version}\" and all related resources: APIs, Securities, Rate Limitings and Target Endpoints"
        ));
        prompt.say(&format!("[WARNING] Remove the namespace: {}", operator.namespace));
        if !prompt::confirm_destructive(prompt, "Are you sure")? {
            return Ok(false);
        }
    }

    info!("Removing namespace {}, this can take some minutes", operator.namespace);
    let mut deletes = vec![("namespace", operator.namespace.clone())];
    deletes.extend(operator.crds.iter().map(|crd| ("crd", crd.clone())));

    // Every delete is attempted; the first failure is reported.
    let mut failed = None;
    for (kind, name) in deletes {
        if let Err(err) = cluster.run(&Invocation::delete(kind, &[name.clone()])) {
            warn!("Could not delete {kind} {name}: {err}");
            if failed.is_none() {
                failed = Some(Error::Delete {
                    what: format!("{kind} {name}"),
                    err,
                });
            }
        }
    }
    match failed {
        Some(err) => Err(err),
        None => Ok(true),
    }
}
