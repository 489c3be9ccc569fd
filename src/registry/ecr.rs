use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use async_trait::async_trait;
use regex::Regex;
use crate::manifest;
use crate::prompt;
use super::{flag, show, valid_file, Credential, Error, FlagValues, Flags, Provider, Session, Target};

static AMAZON_REPOSITORY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.amazonaws\.com/.*$").unwrap());

/// Docker config that hands authentication over to the ECR credential helper.
const CONFIG_JSON: &str = r#"{ "credsStore": "ecr-login" }"#;

#[derive(Default, Debug)]
pub struct AmazonEcr {
    credential: Credential,
}

fn valid_amazon_repository(value: &str) -> bool {
    AMAZON_REPOSITORY.is_match(value)
}

fn default_credentials_file() -> Option<String> {
    dirs::home_dir().map(|home| home.join(".aws").join("credentials").display().to_string())
}

#[async_trait(?Send)]
impl Provider for AmazonEcr {
    fn name(&self) -> &'static str {
        "AMAZON_ECR"
    }

    fn caption(&self) -> &'static str {
        "Amazon ECR"
    }

    fn option(&self) -> i32 {
        2
    }

    fn flags(&self) -> Flags {
        Flags {
            required: &[flag::REPOSITORY, flag::KEY_FILE],
            optional: &[],
        }
    }

    fn credential(&self) -> &Credential {
        &self.credential
    }

    fn credential_mut(&mut self) -> &mut Credential {
        &mut self.credential
    }

    async fn gather(&mut self, session: &mut Session<'_>, flags: Option<&FlagValues>) -> Result<(), Error> {
        let (repository, key_file) = match flags {
            Some(flags) => {
                let repository = flags.get_text(flag::REPOSITORY).to_string();
                if !valid_amazon_repository(&repository) {
                    return Err(Error::InvalidRepository(repository));
                }
                let key_file = flags.get_text(flag::KEY_FILE).to_string();
                if !valid_file(&key_file) {
                    return Err(Error::MissingFile { what: "credential file", path: key_file });
                }
                (repository, key_file)
            }
            None => {
                let prompt = &mut *session.prompt;
                let default_file = default_credentials_file();
                loop {
                    let repository = prompt::read_validated(
                        prompt,
                        "Enter repository URI (<aws_account_id.dkr.ecr.region.amazonaws.com>/repository)",
                        None,
                        valid_amazon_repository,
                        "Invalid repository URI",
                    )?;
                    let key_file = prompt::read_validated(
                        prompt,
                        "Amazon credential file",
                        default_file.as_deref(),
                        valid_file,
                        "Invalid file",
                    )?;

                    show(prompt, &[("Repository     ", repository.as_str()), ("Credential file", key_file.as_str())]);
                    if prompt::confirm(prompt, "Confirm configurations")? {
                        break (repository, key_file);
                    }
                }
            }
        };

        self.credential = Credential {
            repository,
            key_file: Some(PathBuf::from(key_file)),
            ..Default::default()
        };
        Ok(())
    }

    fn materialize(&mut self, target: &Target<'_>) -> Result<(), Error> {
        let config = &target.config;
        let config_map = manifest::config_map(
            &config.ecr_config_map,
            target.namespace,
            BTreeMap::from([("config.json".to_string(), CONFIG_JSON.to_string())]),
        );
        manifest::create(target.cluster, &config_map)?;

        let key_file = self.credential.key_file.as_deref().ok_or(Error::NotGathered)?;
        let secret = manifest::file_secret(&config.ecr_credentials_secret, target.namespace, key_file, "credentials")?;
        Ok(manifest::create(target.cluster, &secret)?)
    }
}
