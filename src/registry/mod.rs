use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::sync::LazyLock;
use async_trait::async_trait;
use log::{debug, info};
use regex::Regex;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};
use crate::config;
use crate::kubectl::Cluster;
use crate::manifest;
use crate::prompt::{self, Prompt};

pub mod dockerhub;
pub mod ecr;
pub mod gcr;
pub mod http;

#[derive(Error, Debug)]
pub enum Error {
    #[error("error adding registry {0}: 'option' should be positive")]
    NonPositiveOption(&'static str),

    #[error("error adding registry {0}: duplicate 'option' value {1}")]
    DuplicateOption(&'static str, i32),

    #[error("invalid registry type: {0}")]
    UnknownRegistry(String),

    #[error("no registry type selected")]
    NoneSelected,

    #[error("registry credentials have not been read yet")]
    NotGathered,

    #[error("required flag is missing in batch mode. Flag: {0}")]
    MissingFlag(&'static str),

    #[error("invalid, not supported flag found in batch mode. Flag: {0}")]
    UnsupportedFlag(String),

    #[error("flags --password and --password-stdin cannot be used together")]
    ConflictingPasswordFlags,

    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    #[error("invalid username: {0}")]
    InvalidUsername(String),

    #[error("invalid {what}: {path}")]
    MissingFile {
        what: &'static str,
        path: String,
    },

    #[error("read service account key {path}: {reason}")]
    ServiceAccountKey {
        path: String,
        reason: String,
    },

    #[error("invalid credentials for Docker Hub")]
    InvalidCredentials,

    #[error("connect to registry using credentials: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Prompt(#[from] prompt::Error),

    #[error(transparent)]
    Manifest(#[from] manifest::Error),
}

/// Batch mode flag names.
pub mod flag {
    pub const REPOSITORY: &str = "repository";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const PASSWORD_STDIN: &str = "password-stdin";
    pub const KEY_FILE: &str = "key-file";
}

/// Flags a provider accepts in batch mode.
#[derive(Debug, Clone, Copy)]
pub struct Flags {
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Switch(bool),
}

/// A flag value and whether the caller supplied it at all.
/// An explicitly empty value is still provided.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagValue {
    pub value: Value,
    pub provided: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FlagValues(BTreeMap<String, FlagValue>);

impl FlagValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, key: &str, value: Option<String>) -> Self {
        let provided = value.is_some();
        self.0.insert(key.to_string(), FlagValue {
            value: Value::Text(value.unwrap_or_default()),
            provided,
        });
        self
    }

    pub fn switch(mut self, key: &str, on: bool) -> Self {
        self.0.insert(key.to_string(), FlagValue {
            value: Value::Switch(on),
            provided: on,
        });
        self
    }

    pub fn is_provided(&self, key: &str) -> bool {
        self.0.get(key).is_some_and(|flag| flag.provided)
    }

    pub fn get_text(&self, key: &str) -> &str {
        match self.0.get(key).map(|flag| &flag.value) {
            Some(Value::Text(text)) => text,
            _ => "",
        }
    }

    pub fn get_switch(&self, key: &str) -> bool {
        matches!(self.0.get(key).map(|flag| &flag.value), Some(Value::Switch(true)))
    }

    fn provided(&self) -> impl Iterator<Item = &str> {
        self.0.iter().filter(|(_, flag)| flag.provided).map(|(key, _)| key.as_str())
    }
}

/// Credentials read for a single invocation. The password is wiped on drop.
#[derive(Default)]
pub struct Credential {
    pub repository: String,
    pub username: String,
    pub password: Zeroizing<String>,
    pub key_file: Option<PathBuf>,
}

impl Credential {
    pub fn clear_password(&mut self) {
        self.password.zeroize();
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("repository", &self.repository)
            .field("username", &self.username)
            .field("password", &"***")
            .field("key_file", &self.key_file)
            .finish()
    }
}

/// What the gather phase may use.
pub struct Session<'a> {
    pub prompt: &'a mut dyn Prompt,
    pub http: &'a reqwest::Client,
    pub config: &'a config::Registry,
}

/// Where the materialize phase writes to.
pub struct Target<'a> {
    pub cluster: &'a dyn Cluster,
    pub namespace: &'a str,
    pub config: &'a config::Registry,
}

/// A container registry type.
///
/// Each provider gathers credentials (interactively or from batch-mode flags) and then
/// materializes them in the cluster as secrets the API Operator can use to push images.
#[async_trait(?Send)]
pub trait Provider {
    /// Stable machine key, matched against `--registry-type`.
    fn name(&self) -> &'static str;

    /// Menu text.
    fn caption(&self) -> &'static str;

    /// Menu position, unique and positive.
    fn option(&self) -> i32;

    fn flags(&self) -> Flags;

    fn credential(&self) -> &Credential;

    fn credential_mut(&mut self) -> &mut Credential;

    /// Read credentials. `None` means interactive mode.
    async fn gather(&mut self, session: &mut Session<'_>, flags: Option<&FlagValues>) -> Result<(), Error>;

    /// Create the cluster objects holding the credentials.
    fn materialize(&mut self, target: &Target<'_>) -> Result<(), Error>;
}

/// The known providers, keyed by menu position, and the one chosen for this invocation.
#[derive(Default)]
pub struct Catalog {
    providers: BTreeMap<i32, Box<dyn Provider>>,
    active: Option<i32>,
    gathered: bool,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Docker Hub, Amazon ECR, GCR, HTTP and HTTPS private registries.
    pub fn with_builtin() -> Result<Self, Error> {
        let mut catalog = Self::new();
        catalog.register(Box::new(dockerhub::DockerHub::default()))?;
        catalog.register(Box::new(ecr::AmazonEcr::default()))?;
        catalog.register(Box::new(gcr::Gcr::default()))?;
        catalog.register(Box::new(http::Http::default()))?;
        catalog.register(Box::new(http::Https::default()))?;
        Ok(catalog)
    }

    pub fn register(&mut self, provider: Box<dyn Provider>) -> Result<(), Error> {
        let option = provider.option();
        if option < 1 {
            return Err(Error::NonPositiveOption(provider.name()));
        }
        if self.providers.contains_key(&option) {
            return Err(Error::DuplicateOption(provider.name(), option));
        }
        self.providers.insert(option, provider);
        Ok(())
    }

    pub fn choose_interactive(&mut self, prompt: &mut dyn Prompt) -> Result<&dyn Provider, Error> {
        prompt.say("Choose registry type:");
        for (option, provider) in &self.providers {
            prompt.say(&format!("{}: {}", option, provider.caption()));
        }
        let options: Vec<i32> = self.providers.keys().copied().collect();
        let option = prompt::read_option(prompt, "Choose a number", &options)?;
        self.activate(option)
    }

    pub fn select_by_name(&mut self, name: &str) -> Result<&dyn Provider, Error> {
        let option = self
            .providers
            .iter()
            .find(|(_, provider)| provider.name() == name)
            .map(|(option, _)| *option)
            .ok_or_else(|| Error::UnknownRegistry(name.to_string()))?;
        self.activate(option)
    }

    fn activate(&mut self, option: i32) -> Result<&dyn Provider, Error> {
        debug!("Registry option {option} selected");
        self.active = Some(option);
        self.gathered = false;
        self.active()
    }

    pub fn active(&self) -> Result<&dyn Provider, Error> {
        self.active
            .and_then(|option| self.providers.get(&option))
            .map(|provider| provider.as_ref())
            .ok_or(Error::NoneSelected)
    }

    fn active_mut(&mut self) -> Result<&mut Box<dyn Provider>, Error> {
        self.active
            .and_then(|option| self.providers.get_mut(&option))
            .ok_or(Error::NoneSelected)
    }

    /// Run the active provider's gather phase. Batch flags are validated before the
    /// provider sees them.
    pub async fn gather_active(&mut self, session: &mut Session<'_>, flags: Option<&FlagValues>) -> Result<(), Error> {
        self.gathered = false;
        let provider = self.active_mut()?;
        if let Some(flags) = flags {
            validate_flags(&provider.flags(), flags)?;
        }
        provider.gather(session, flags).await?;
        info!("Registry {} configured for repository {}", provider.name(), provider.credential().repository);
        self.gathered = true;
        Ok(())
    }

    /// Run the active provider's materialize phase. The password is wiped afterwards
    /// whether or not the cluster accepted the secrets.
    pub fn materialize_active(&mut self, target: &Target<'_>) -> Result<(), Error> {
        if !self.gathered {
            return Err(Error::NotGathered);
        }
        self.gathered = false;
        let provider = self.active_mut()?;
        let result = provider.materialize(target);
        provider.credential_mut().clear_password();
        result
    }

    /// Point the operator's controller config at the active registry.
    pub fn apply_controller_config(&self, cluster: &dyn Cluster, operator: &config::Operator) -> Result<(), Error> {
        if !self.gathered {
            return Err(Error::NotGathered);
        }
        let provider = self.active()?;
        let data = BTreeMap::from([
            (operator.registry_type_key.clone(), provider.name().to_string()),
            (operator.repository_key.clone(), provider.credential().repository.clone()),
        ]);
        let config_map = manifest::config_map(&operator.controller_config, &operator.namespace, data);
        Ok(manifest::create(cluster, &config_map)?)
    }

    /// Controller config first: it fails when the operator is not installed,
    /// and then no secret has been written yet.
    pub fn update_configs_secrets(&mut self, target: &Target<'_>, operator: &config::Operator) -> Result<(), Error> {
        self.apply_controller_config(target.cluster, operator)?;
        self.materialize_active(target)
    }
}

/// Check batch flags against what the provider accepts.
pub fn validate_flags(accepted: &Flags, flags: &FlagValues) -> Result<(), Error> {
    for &required in accepted.required {
        if !flags.is_provided(required) {
            return Err(Error::MissingFlag(required));
        }
    }

    let known: BTreeSet<&str> = accepted.required.iter().chain(accepted.optional).copied().collect();
    if let Some(unsupported) = flags.provided().find(|flag| !known.contains(flag)) {
        return Err(Error::UnsupportedFlag(unsupported.to_string()));
    }

    check_password_flags(flags)
}

fn check_password_flags(flags: &FlagValues) -> Result<(), Error> {
    if flags.is_provided(flag::PASSWORD) && flags.get_switch(flag::PASSWORD_STDIN) {
        return Err(Error::ConflictingPasswordFlags);
    }
    Ok(())
}

/// The batch mode password, from `--password` or read from standard input.
pub(crate) fn batch_password(session: &mut Session<'_>, flags: &FlagValues) -> Result<String, Error> {
    check_password_flags(flags)?;
    if flags.get_switch(flag::PASSWORD_STDIN) {
        return Ok(session.prompt.password("Enter password")?);
    }
    Ok(flags.get_text(flag::PASSWORD).to_string())
}

static REPOSITORY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\-.:]+(/[\w\-.]+)*$").unwrap());
static USERNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\-.@+]+$").unwrap());

pub(crate) fn valid_repository(value: &str) -> bool {
    REPOSITORY.is_match(value)
}

pub(crate) fn valid_username(value: &str) -> bool {
    USERNAME.is_match(value)
}

pub(crate) fn valid_file(value: &str) -> bool {
    std::path::Path::new(value).is_file()
}

/// Print what was entered, without the password.
pub(crate) fn show(prompt: &mut dyn Prompt, rows: &[(&str, &str)]) {
    prompt.say("");
    for (label, value) in rows {
        prompt.say(&format!("{label}: {value}"));
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;
    use crate::kubectl::fake::FakeCluster;
    use crate::prompt::scripted::Scripted;
    use super::*;

    /// Counts how often each phase runs.
    struct Counting {
        option: i32,
        name: &'static str,
        credential: Credential,
        gathered: Rc<Cell<u32>>,
        materialized: Rc<Cell<u32>>,
    }

    impl Counting {
        fn new(option: i32, name: &'static str) -> Self {
            Self {
                option,
                name,
                credential: Credential::default(),
                gathered: Rc::new(Cell::new(0)),
                materialized: Rc::new(Cell::new(0)),
            }
        }
    }

    #[async_trait(?Send)]
    impl Provider for Counting {
        fn name(&self) -> &'static str { self.name }
        fn caption(&self) -> &'static str { "Counting registry" }
        fn option(&self) -> i32 { self.option }
        fn flags(&self) -> Flags {
            Flags { required: &[flag::REPOSITORY], optional: &[flag::PASSWORD, flag::PASSWORD_STDIN] }
        }
        fn credential(&self) -> &Credential { &self.credential }
        fn credential_mut(&mut self) -> &mut Credential { &mut self.credential }

        async fn gather(&mut self, _session: &mut Session<'_>, _flags: Option<&FlagValues>) -> Result<(), Error> {
            self.gathered.set(self.gathered.get() + 1);
            self.credential.repository = "jennifer".into();
            self.credential.password = Zeroizing::new("s3cret".into());
            Ok(())
        }

        fn materialize(&mut self, _target: &Target<'_>) -> Result<(), Error> {
            self.materialized.set(self.materialized.get() + 1);
            Ok(())
        }
    }

    fn session<'a>(prompt: &'a mut Scripted, http: &'a reqwest::Client, config: &'a config::Registry) -> Session<'a> {
        Session { prompt, http, config }
    }

    #[test]
    fn register_rejects_bad_options() {
        let mut catalog = Catalog::new();
        assert!(matches!(
            catalog.register(Box::new(Counting::new(0, "ZERO"))),
            Err(Error::NonPositiveOption("ZERO"))
        ));
        catalog.register(Box::new(Counting::new(1, "FIRST"))).unwrap();
        assert!(matches!(
            catalog.register(Box::new(Counting::new(1, "SECOND"))),
            Err(Error::DuplicateOption("SECOND", 1))
        ));
    }

    #[test]
    fn builtin_menu_order() {
        let mut catalog = Catalog::with_builtin().unwrap();
        let mut prompt = Scripted::new(&["7", "abc", "4"]);
        let provider = catalog.choose_interactive(&mut prompt).unwrap();
        assert_eq!(provider.name(), "HTTP");
        assert_eq!(
            &prompt.said[..6],
            &[
                "Choose registry type:",
                "1: Docker Hub",
                "2: Amazon ECR",
                "3: GCR",
                "4: HTTP Private Registry",
                "5: HTTPS Private Registry",
            ]
        );
    }

    #[test]
    fn select_by_name_is_a_lookup() {
        let mut catalog = Catalog::with_builtin().unwrap();
        let first = std::ptr::from_ref(catalog.select_by_name("GCR").unwrap()).cast::<()>();
        let second = std::ptr::from_ref(catalog.select_by_name("GCR").unwrap()).cast::<()>();
        assert_eq!(first, second);
        assert_eq!(catalog.active().unwrap().option(), 3);

        assert!(matches!(catalog.select_by_name("gcr"), Err(Error::UnknownRegistry(_))));
    }

    #[tokio::test]
    async fn missing_required_flag_stops_before_gather() {
        let provider = Counting::new(1, "COUNTING");
        let (gathered, materialized) = (provider.gathered.clone(), provider.materialized.clone());
        let mut catalog = Catalog::new();
        catalog.register(Box::new(provider)).unwrap();
        catalog.select_by_name("COUNTING").unwrap();

        let (mut prompt, http, config) = (Scripted::new(&[]), reqwest::Client::new(), crate::config::File::default().registry);
        let flags = FlagValues::new().text(flag::REPOSITORY, None).text(flag::PASSWORD, Some("pw".into()));
        let result = catalog.gather_active(&mut session(&mut prompt, &http, &config), Some(&flags)).await;
        assert!(matches!(result, Err(Error::MissingFlag(flag::REPOSITORY))));

        let cluster = FakeCluster::new();
        let target = Target { cluster: &cluster, namespace: "wso2-system", config: &config };
        assert!(matches!(catalog.materialize_active(&target), Err(Error::NotGathered)));
        assert_eq!(gathered.get(), 0);
        assert_eq!(materialized.get(), 0);
        assert!(cluster.history().is_empty());
    }

    #[tokio::test]
    async fn password_flags_are_exclusive() {
        let provider = Counting::new(1, "COUNTING");
        let gathered = provider.gathered.clone();
        let mut catalog = Catalog::new();
        catalog.register(Box::new(provider)).unwrap();
        catalog.select_by_name("COUNTING").unwrap();

        let (mut prompt, http, config) = (Scripted::new(&["from-stdin"]), reqwest::Client::new(), crate::config::File::default().registry);
        let flags = FlagValues::new()
            .text(flag::REPOSITORY, Some("jennifer".into()))
            .text(flag::PASSWORD, Some("pw".into()))
            .switch(flag::PASSWORD_STDIN, true);
        let result = catalog.gather_active(&mut session(&mut prompt, &http, &config), Some(&flags)).await;
        assert!(matches!(result, Err(Error::ConflictingPasswordFlags)));
        assert_eq!(gathered.get(), 0);
        assert_eq!(prompt.remaining(), 1);
    }

    #[tokio::test]
    async fn unsupported_flag_is_rejected() {
        let mut catalog = Catalog::new();
        catalog.register(Box::new(Counting::new(1, "COUNTING"))).unwrap();
        catalog.select_by_name("COUNTING").unwrap();

        let (mut prompt, http, config) = (Scripted::new(&[]), reqwest::Client::new(), crate::config::File::default().registry);
        let flags = FlagValues::new()
            .text(flag::REPOSITORY, Some("jennifer".into()))
            .text(flag::KEY_FILE, Some(String::new()));
        let result = catalog.gather_active(&mut session(&mut prompt, &http, &config), Some(&flags)).await;
        assert!(matches!(result, Err(Error::UnsupportedFlag(flag)) if flag == "key-file"));
    }

    #[tokio::test]
    async fn materialize_clears_password_and_runs_once() {
        let provider = Counting::new(1, "COUNTING");
        let materialized = provider.materialized.clone();
        let mut catalog = Catalog::new();
        catalog.register(Box::new(provider)).unwrap();
        catalog.select_by_name("COUNTING").unwrap();

        let file = crate::config::File::default();
        let (mut prompt, http) = (Scripted::new(&[]), reqwest::Client::new());
        catalog.gather_active(&mut session(&mut prompt, &http, &file.registry), None).await.unwrap();

        let cluster = FakeCluster::new();
        let target = Target { cluster: &cluster, namespace: "wso2-system", config: &file.registry };
        catalog.update_configs_secrets(&target, &file.operator).unwrap();
        assert_eq!(materialized.get(), 1);
        assert!(catalog.active().unwrap().credential().password.is_empty());

        let key = ("wso2-system".to_string(), "controller-config".to_string());
        {
            let state = cluster.state.borrow();
            assert_eq!(state.config_maps[&key]["registryType"], "COUNTING");
            assert_eq!(state.config_maps[&key]["repositoryName"], "jennifer");
        }

        assert!(matches!(catalog.materialize_active(&target), Err(Error::NotGathered)));
        assert_eq!(materialized.get(), 1);
    }

    #[test]
    fn flag_presence_is_not_emptiness() {
        let flags = FlagValues::new()
            .text(flag::USERNAME, Some(String::new()))
            .text(flag::PASSWORD, None)
            .switch(flag::PASSWORD_STDIN, false);
        assert!(flags.is_provided(flag::USERNAME));
        assert!(!flags.is_provided(flag::PASSWORD));
        assert!(!flags.is_provided(flag::PASSWORD_STDIN));
        assert!(!flags.is_provided(flag::KEY_FILE));
    }

    #[test]
    fn repository_and_username_patterns() {
        assert!(valid_repository("jennifer"));
        assert!(valid_repository("docker.io/jennifer"));
        assert!(valid_repository("quay.io/org/team"));
        assert!(valid_repository("10.100.5.225:5000/jennifer"));
        assert!(!valid_repository(""));
        assert!(!valid_repository("bad repo"));
        assert!(!valid_repository("trailing/"));

        assert!(valid_username("jennifer.doe@example.com"));
        assert!(!valid_username("two words"));
        assert!(!valid_username(""));
    }

    #[test]
    fn credential_debug_hides_password() {
        let credential = Credential {
            repository: "jennifer".into(),
            username: "jennifer".into(),
            password: Zeroizing::new("s3cret".into()),
            key_file: None,
        };
        assert!(!format!("{credential:?}").contains("s3cret"));
    }
}
