use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use serde::Serialize;
use zeroize::Zeroizing;
use crate::manifest;
use crate::prompt;
use super::{batch_password, flag, show, valid_repository, valid_username, Credential, Error, FlagValues, Flags, Provider, Session, Target};

const DOCKER_IO: &str = "docker.io/";

#[derive(Default, Debug)]
pub struct DockerHub {
    credential: Credential,
}

#[derive(Serialize)]
struct Login<'a> {
    username: &'a str,
    password: &'a str,
}

/// Ask Docker Hub whether the credentials are good.
pub async fn validate_credentials(client: &reqwest::Client, login_url: &str, username: &str, password: &str) -> Result<bool, Error> {
    debug!("Validating Docker Hub credentials of {username}");
    let resp = client
        .post(login_url)
        .json(&Login { username, password })
        .send()
        .await?;
    Ok(resp.status() == StatusCode::OK)
}

#[async_trait(?Send)]
impl Provider for DockerHub {
    fn name(&self) -> &'static str {
        "DOCKER_HUB"
    }

    fn caption(&self) -> &'static str {
        "Docker Hub"
    }

    fn option(&self) -> i32 {
        1
    }

    fn flags(&self) -> Flags {
        Flags {
            required: &[flag::REPOSITORY, flag::USERNAME],
            optional: &[flag::PASSWORD, flag::PASSWORD_STDIN],
        }
    }

    fn credential(&self) -> &Credential {
        &self.credential
    }

    fn credential_mut(&mut self) -> &mut Credential {
        &mut self.credential
    }

    async fn gather(&mut self, session: &mut Session<'_>, flags: Option<&FlagValues>) -> Result<(), Error> {
        let (repository, username, password) = match flags {
            Some(flags) => {
                let repository = flags.get_text(flag::REPOSITORY).to_string();
                if !valid_repository(&repository) {
                    return Err(Error::InvalidRepository(repository));
                }
                let username = flags.get_text(flag::USERNAME).to_string();
                if !valid_username(&username) {
                    return Err(Error::InvalidUsername(username));
                }
                let password = batch_password(session, flags)?;
                (repository, username, password)
            }
            None => loop {
                let prompt = &mut *session.prompt;
                let repository = prompt::read_validated(prompt, "Enter repository name (john or docker.io/john)", None, valid_repository, "Invalid repository name")?;
                let username = prompt::read_validated(prompt, "Enter username", None, valid_username, "Invalid username")?;
                let password = Zeroizing::new(prompt.password("Enter password")?);

                if !validate_credentials(session.http, &session.config.docker_hub_login_url, &username, &password).await? {
                    return Err(Error::InvalidCredentials);
                }

                let prompt = &mut *session.prompt;
                show(prompt, &[("Repository", repository.as_str()), ("Username  ", username.as_str())]);
                if prompt::confirm(prompt, "Confirm configurations")? {
                    break (repository, username, password.to_string());
                }
            },
        };

        self.credential = Credential {
            repository: repository.strip_prefix(DOCKER_IO).unwrap_or(&repository).to_string(),
            username,
            password: Zeroizing::new(password),
            key_file: None,
        };
        Ok(())
    }

    fn materialize(&mut self, target: &Target<'_>) -> Result<(), Error> {
        let secret = manifest::docker_config_secret(
            &target.config.credentials_secret,
            target.namespace,
            &target.config.docker_hub_server,
            &self.credential.username,
            &self.credential.password,
        );
        Ok(manifest::create(target.cluster, &secret)?)
    }
}
