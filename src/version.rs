use log::{debug, info};
use reqwest::StatusCode;
use thiserror::Error;
use crate::config::Component;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid {name} version: {version}\n\
             Set the environment variable \"{env}\" with a valid {name} version\n\
             Default {name} version: {default}\n\
             Find a version here: {discovery_url}")]
    InvalidVersion {
        name: String,
        version: String,
        env: String,
        default: String,
        discovery_url: String,
    },

    #[error("reach version endpoint: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Where resolved versions are read from and remembered.
pub trait Env {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);
}

/// The process environment. Values set here are inherited by child processes.
pub struct ProcessEnv;

impl Env for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn set(&mut self, key: &str, value: &str) {
        std::env::set_var(key, value);
    }
}

/// Pick the version of `component` to install and make sure it exists upstream.
///
/// The override variable wins; otherwise the default is used and written back to `env`
/// so later lookups in the same invocation agree on it.
pub async fn resolve(client: &reqwest::Client, env: &mut dyn Env, component: &Component) -> Result<String, Error> {
    let version = match env.get(&component.version_env).filter(|version| !version.is_empty()) {
        Some(version) => version,
        None => {
            env.set(&component.version_env, &component.default_version);
            component.default_version.clone()
        }
    };

    let url = component.validation_url.replace("{version}", &version);
    debug!("Validating {} version {} at {}", component.name, version, url);
    let resp = client.head(&url).send().await?;

    if resp.status() != StatusCode::OK {
        return Err(Error::InvalidVersion {
            name: component.name.clone(),
            version,
            env: component.version_env.clone(),
            default: component.default_version.clone(),
            discovery_url: component.discovery_url.clone(),
        });
    }

    info!("{} version: {}", component.name, version);
    Ok(version)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use super::*;

    /// Keeps tests out of the process environment.
    #[derive(Default, Debug)]
    struct Cache(HashMap<String, String>);

    impl Env for Cache {
        fn get(&self, key: &str) -> Option<String> {
            self.0.get(key).cloned()
        }

        fn set(&mut self, key: &str, value: &str) {
            self.0.insert(key.to_string(), value.to_string());
        }
    }

    fn component(server: &str) -> Component {
        Component {
            name: "API Operator".into(),
            version_env: "WSO2_API_OPERATOR_VERSION".into(),
            default_version: "v1.1.0".into(),
            validation_url: format!("{server}/tree/{{version}}"),
            discovery_url: "https://github.com/wso2/K8s-api-operator/releases".into(),
            configs_url: format!("{server}/download/{{version}}/configs.yaml"),
        }
    }

    async fn server_with(version: &str, status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path(format!("/tree/{version}")))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn default_version_is_remembered() {
        let server = server_with("v1.1.0", 200).await;
        let mut env = Cache::default();

        let version = resolve(&reqwest::Client::new(), &mut env, &component(&server.uri())).await.unwrap();
        assert_eq!(version, "v1.1.0");
        assert_eq!(env.get("WSO2_API_OPERATOR_VERSION").as_deref(), Some("v1.1.0"));

        let again = resolve(&reqwest::Client::new(), &mut env, &component(&server.uri())).await.unwrap();
        assert_eq!(again, version);
    }

    #[tokio::test]
    async fn override_variable_wins() {
        let server = server_with("v2.0.0", 200).await;
        let mut env = Cache::default();
        env.set("WSO2_API_OPERATOR_VERSION", "v2.0.0");

        let version = resolve(&reqwest::Client::new(), &mut env, &component(&server.uri())).await.unwrap();
        assert_eq!(version, "v2.0.0");
    }

    #[tokio::test]
    async fn unknown_version_names_the_remedy() {
        let server = server_with("v1.1.0", 404).await;
        let mut env = Cache::default();

        let err = resolve(&reqwest::Client::new(), &mut env, &component(&server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidVersion { .. }));
        let message = err.to_string();
        assert!(message.contains("v1.1.0"));
        assert!(message.contains("WSO2_API_OPERATOR_VERSION"));
        assert!(message.contains("https://github.com/wso2/K8s-api-operator/releases"));
        assert!(message.contains("Default API Operator version: v1.1.0"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        // Nothing listens on port 1.
        let mut env = Cache::default();
        let err = resolve(&reqwest::Client::new(), &mut env, &component("http://127.0.0.1:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
