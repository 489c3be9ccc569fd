use std::sync::LazyLock;
use async_trait::async_trait;
use regex::Regex;
use zeroize::Zeroizing;
use crate::manifest;
use crate::prompt;
use super::{batch_password, flag, show, valid_repository, valid_username, Credential, Error, FlagValues, Flags, Provider, Session, Target};

static HTTP_REPOSITORY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\-.:]*/?[\w\-]+$").unwrap());

const PRIVATE_FLAGS: Flags = Flags {
    required: &[flag::REPOSITORY],
    optional: &[flag::USERNAME, flag::PASSWORD, flag::PASSWORD_STDIN],
};

/// Private registry served over plain HTTP.
#[derive(Default, Debug)]
pub struct Http {
    credential: Credential,
}

/// Private registry served over HTTPS.
#[derive(Default, Debug)]
pub struct Https {
    credential: Credential,
}

fn valid_http_repository(value: &str) -> bool {
    HTTP_REPOSITORY.is_match(value)
}

/// The registry server of a repository: everything before the first `/`.
pub fn registry_url(repository: &str) -> &str {
    repository.split('/').next().unwrap_or(repository)
}

/// Repository and optional username/password of a private registry.
async fn gather_private(session: &mut Session<'_>, flags: Option<&FlagValues>, valid: fn(&str) -> bool) -> Result<Credential, Error> {
    let (repository, username, password) = match flags {
        Some(flags) => {
            let repository = flags.get_text(flag::REPOSITORY).to_string();
            if !valid(&repository) {
                return Err(Error::InvalidRepository(repository));
            }
            let username = flags.get_text(flag::USERNAME).to_string();
            if !username.is_empty() && !valid_username(&username) {
                return Err(Error::InvalidUsername(username));
            }
            let password = batch_password(session, flags)?;
            (repository, username, password)
        }
        None => loop {
            let prompt = &mut *session.prompt;
            let repository = prompt::read_validated(prompt, "Enter private registry (10.100.5.225:5000/jennifer)", None, valid, "Invalid repository name")?;
            let username = prompt::read_validated(prompt, "Enter username", None, valid_username, "Invalid username")?;
            let password = Zeroizing::new(prompt.password("Enter password")?);

            show(prompt, &[("Repository", repository.as_str()), ("Username  ", username.as_str())]);
            if prompt::confirm(prompt, "Confirm configurations")? {
                break (repository, username, password.to_string());
            }
        },
    };

    Ok(Credential {
        repository,
        username,
        password: Zeroizing::new(password),
        key_file: None,
    })
}

fn materialize_private(credential: &Credential, target: &Target<'_>) -> Result<(), Error> {
    let secret = manifest::docker_config_secret(
        &target.config.credentials_secret,
        target.namespace,
        registry_url(&credential.repository),
        &credential.username,
        &credential.password,
    );
    Ok(manifest::create(target.cluster, &secret)?)
}

#[async_trait(?Send)]
impl Provider for Http {
    fn name(&self) -> &'static str {
        "HTTP"
    }

    fn caption(&self) -> &'static str {
        "HTTP Private Registry"
    }

    fn option(&self) -> i32 {
        4
    }

    fn flags(&self) -> Flags {
        PRIVATE_FLAGS
    }

    fn credential(&self) -> &Credential {
        &self.credential
    }

    fn credential_mut(&mut self) -> &mut Credential {
        &mut self.credential
    }

    async fn gather(&mut self, session: &mut Session<'_>, flags: Option<&FlagValues>) -> Result<(), Error> {
        self.credential = gather_private(session, flags, valid_http_repository).await?;
        Ok(())
    }

    fn materialize(&mut self, target: &Target<'_>) -> Result<(), Error> {
        materialize_private(&self.credential, target)
    }
}

#[async_trait(?Send)]
impl Provider for Https {
    fn name(&self) -> &'static str {
        "HTTPS"
    }

    fn caption(&self) -> &'static str {
        "HTTPS Private Registry"
    }

    fn option(&self) -> i32 {
        5
    }

    fn flags(&self) -> Flags {
        PRIVATE_FLAGS
    }

    fn credential(&self) -> &Credential {
        &self.credential
    }

    fn credential_mut(&mut self) -> &mut Credential {
        &mut self.credential
    }

    async fn gather(&mut self, session: &mut Session<'_>, flags: Option<&FlagValues>) -> Result<(), Error> {
        self.credential = gather_private(session, flags, valid_repository).await?;
        Ok(())
    }

    fn materialize(&mut self, target: &Target<'_>) -> Result<(), Error> {
        materialize_private(&self.credential, target)
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use crate::config;
    use crate::kubectl::fake::FakeCluster;
    use crate::manifest::DOCKER_CONFIG_JSON;
    use crate::prompt::scripted::Scripted;
    use super::*;

    #[test]
    fn registry_url_is_the_host_part() {
        assert_eq!(registry_url("10.100.5.225:5000/jennifer"), "10.100.5.225:5000");
        assert_eq!(registry_url("registry.example.com/team/app"), "registry.example.com");
        assert_eq!(registry_url("localhost"), "localhost");
    }

    #[test]
    fn http_repository_pattern() {
        assert!(valid_http_repository("10.100.5.225:5000/jennifer"));
        assert!(valid_http_repository("jennifer"));
        assert!(!valid_http_repository("10.100.5.225:5000/team/jennifer"));
        assert!(!valid_http_repository("10.100.5.225:5000/"));
    }

    #[tokio::test]
    async fn anonymous_http_registry() {
        let registry = config::File::default().registry;
        let http = reqwest::Client::new();
        let mut prompt = Scripted::new(&[]);
        let flags = FlagValues::new()
            .text(flag::REPOSITORY, Some("10.100.5.225:5000/jennifer".into()))
            .text(flag::USERNAME, None)
            .text(flag::PASSWORD, None)
            .switch(flag::PASSWORD_STDIN, false);

        let mut provider = Http::default();
        provider.gather(&mut Session { prompt: &mut prompt, http: &http, config: &registry }, Some(&flags)).await.unwrap();

        let cluster = FakeCluster::new();
        provider.materialize(&Target { cluster: &cluster, namespace: "wso2-system", config: &registry }).unwrap();

        let secret = cluster.secret(Some("wso2-system"), "docker-registry-credentials").unwrap();
        let encoded = secret["data"][DOCKER_CONFIG_JSON].as_str().unwrap();
        let config: serde_json::Value = serde_json::from_slice(&STANDARD.decode(encoded).unwrap()).unwrap();
        assert_eq!(config["auths"]["10.100.5.225:5000"]["username"], "N/A");
    }

    #[tokio::test]
    async fn interactive_https_registry() {
        let registry = config::File::default().registry;
        let http = reqwest::Client::new();
        let mut prompt = Scripted::new(&["quay.io/org/jennifer", "jennifer", "s3cret", "y"]);

        let mut provider = Https::default();
        provider.gather(&mut Session { prompt: &mut prompt, http: &http, config: &registry }, None).await.unwrap();
        assert_eq!(provider.credential().repository, "quay.io/org/jennifer");
        assert_eq!(provider.credential().password.as_str(), "s3cret");
    }

    #[tokio::test]
    async fn batch_mode_rejects_bad_username() {
        let registry = config::File::default().registry;
        let http = reqwest::Client::new();
        let mut prompt = Scripted::new(&[]);
        let flags = FlagValues::new()
            .text(flag::REPOSITORY, Some("quay.io/jennifer".into()))
            .text(flag::USERNAME, Some("two words".into()));

        let mut provider = Https::default();
        let result = provider.gather(&mut Session { prompt: &mut prompt, http: &http, config: &registry }, Some(&flags)).await;
        assert!(matches!(result, Err(Error::InvalidUsername(_))));
    }
}
