use std::path::{Path, PathBuf};
use async_trait::async_trait;
use serde::Deserialize;
use zeroize::Zeroizing;
use crate::manifest;
use crate::prompt;
use super::{flag, show, valid_file, Credential, Error, FlagValues, Flags, Provider, Session, Target};

const GCR_SERVER: &str = "gcr.io";
const JSON_KEY_USER: &str = "_json_key";

#[derive(Default, Debug)]
pub struct Gcr {
    credential: Credential,
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    project_id: String,
}

fn read_key(path: &Path) -> Result<Zeroizing<String>, Error> {
    std::fs::read_to_string(path)
        .map(Zeroizing::new)
        .map_err(|err| Error::ServiceAccountKey {
            path: path.display().to_string(),
            reason: err.to_string(),
        })
}

/// The GCP project a service account key belongs to.
pub fn project_id(path: &Path) -> Result<String, Error> {
    let key: ServiceAccountKey = serde_json::from_str(&read_key(path)?).map_err(|err| Error::ServiceAccountKey {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;
    Ok(key.project_id)
}

#[async_trait(?Send)]
impl Provider for Gcr {
    fn name(&self) -> &'static str {
        "GCR"
    }

    fn caption(&self) -> &'static str {
        "GCR"
    }

    fn option(&self) -> i32 {
        3
    }

    fn flags(&self) -> Flags {
        Flags {
            required: &[flag::KEY_FILE],
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
        let key_file = match flags {
            Some(flags) => {
                let key_file = flags.get_text(flag::KEY_FILE).to_string();
                if !valid_file(&key_file) {
                    return Err(Error::MissingFile { what: "service account key file", path: key_file });
                }
                key_file
            }
            None => loop {
                let prompt = &mut *session.prompt;
                let key_file = prompt::read_validated(
                    prompt,
                    "GCR service account key json file",
                    None,
                    valid_file,
                    "Invalid file",
                )?;

                show(prompt, &[("GCR service account key json file", key_file.as_str())]);
                if prompt::confirm(prompt, "Confirm configurations")? {
                    break key_file;
                }
            },
        };

        let key_file = PathBuf::from(key_file);
        self.credential = Credential {
            repository: project_id(&key_file)?,
            key_file: Some(key_file),
            ..Default::default()
        };
        Ok(())
    }

    /// The key file as an opaque secret, plus a pull secret authenticating as `_json_key`.
    fn materialize(&mut self, target: &Target<'_>) -> Result<(), Error> {
        let config = &target.config;
        let key_file = self.credential.key_file.as_deref().ok_or(Error::NotGathered)?;

        let key_secret = manifest::file_secret(&config.gcr_key_secret, target.namespace, key_file, &config.gcr_key_file)?;
        manifest::create(target.cluster, &key_secret)?;

        let key = read_key(key_file)?;
        let pull_secret = manifest::docker_config_secret(&config.gcr_pull_secret, target.namespace, GCR_SERVER, JSON_KEY_USER, &key);
        Ok(manifest::create(target.cluster, &pull_secret)?)
    }
}
