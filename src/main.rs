/// API Operator command line
use std::path::PathBuf;
use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use log::{error, info, warn};
use crate::deploy::{Deployer, Deployment, Mode, Request};
use crate::install::Source;
use crate::kubectl::Kubectl;
use crate::prompt::{Prompt, Terminal};
use crate::registry::{flag, Catalog, FlagValues, Session, Target};

mod config;
mod deploy;
mod install;
mod kubectl;
mod manifest;
mod prompt;
mod registry;
mod version;

const API_OPERATOR: &str = "api-operator";

/// Install the WSO2 API Operator, manage its registry credentials and deploy APIs to Kubernetes.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Install an operator into the cluster.
    Install {
        #[command(subcommand)]
        target: InstallTarget,
    },
    /// Remove an operator from the cluster.
    Uninstall {
        #[command(subcommand)]
        target: UninstallTarget,
    },
    /// Change operator settings.
    Change {
        #[command(subcommand)]
        target: ChangeTarget,
    },
    /// Add an API to the cluster.
    Add {
        #[command(subcommand)]
        target: ApiTarget,
    },
    /// Update an API in the cluster.
    Update {
        #[command(subcommand)]
        target: ApiTarget,
    },
}

#[derive(Debug, Subcommand)]
enum InstallTarget {
    /// Install the API Operator and configure its registry.
    ApiOperator {
        /// Operator configs as a URL, file or directory. Defaults to the released configs.
        #[arg(short = 'f', long)]
        from_file: Option<String>,

        #[command(flatten)]
        registry: RegistryArgs,
    },
}

#[derive(Debug, Subcommand)]
enum UninstallTarget {
    /// Remove the API Operator, its namespace and its CRDs.
    ApiOperator {
        /// Do not ask for confirmation.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Subcommand)]
enum ChangeTarget {
    /// Change the registry the API Operator pushes images to.
    Registry {
        #[command(flatten)]
        registry: RegistryArgs,
    },
}

#[derive(Debug, Subcommand)]
enum ApiTarget {
    /// An API from a definition file or project directory.
    Api(ApiArgs),
}

/// Registry flags. Without `--registry-type` everything is asked for interactively.
#[derive(Debug, Args)]
struct RegistryArgs {
    /// DOCKER_HUB, AMAZON_ECR, GCR, HTTP or HTTPS.
    #[arg(short = 'R', long)]
    registry_type: Option<String>,

    #[arg(short = 'r', long)]
    repository: Option<String>,

    #[arg(short = 'u', long)]
    username: Option<String>,

    #[arg(short = 'p', long)]
    password: Option<String>,

    /// Read the password from standard input.
    #[arg(long)]
    password_stdin: bool,

    /// Credentials file (Amazon ECR) or service account key (GCR).
    #[arg(short = 'c', long)]
    key_file: Option<String>,
}

impl RegistryArgs {
    fn flag_values(&self) -> Option<FlagValues> {
        self.registry_type.as_ref()?;
        Some(
            FlagValues::new()
                .text(flag::REPOSITORY, self.repository.clone())
                .text(flag::USERNAME, self.username.clone())
                .text(flag::PASSWORD, self.password.clone())
                .switch(flag::PASSWORD_STDIN, self.password_stdin)
                .text(flag::KEY_FILE, self.key_file.clone()),
        )
    }
}

#[derive(Debug, Args)]
struct ApiArgs {
    /// Name of the API.
    #[arg(short = 'n', long)]
    name: String,

    /// Definition file or API project directory.
    #[arg(short = 'f', long, visible_alias = "file")]
    from_file: PathBuf,

    /// Namespace of the API.
    #[arg(long)]
    namespace: Option<String>,

    #[arg(long)]
    replicas: Option<u32>,

    /// privateJet or sidecar.
    #[arg(long)]
    mode: Option<String>,
}

impl ApiArgs {
    fn request(self) -> Result<Request, deploy::Error> {
        Ok(Request {
            artifact: self.from_file,
            name: self.name,
            namespace: self.namespace,
            update_timestamp: None,
            replicas: self.replicas,
            mode: self.mode.as_deref().map(str::parse::<Mode>).transpose()?,
        })
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration file: {0}")]
    Config(#[from] config::Error),

    #[error("{0}")]
    Version(#[from] version::Error),

    #[error("registry: {0}")]
    Registry(#[from] registry::Error),

    #[error("operator: {0}")]
    Install(#[from] install::Error),

    #[error("{0}")]
    Deploy(#[from] deploy::Error),
}

/// Read configuration file from disk and merge it with the
/// `default.toml` [built-in config](../default.toml).
///
/// Without `--config`, `./apiop.toml` is used when it exists.
fn read_config(args: &Cli) -> Result<config::File, Error> {
    const DEFAULT_CONFIG_FILE: &str = "apiop.toml";

    let config_file = match &args.config {
        None => std::fs::metadata(DEFAULT_CONFIG_FILE)
            .map(|metadata| metadata.is_file())
            .unwrap_or(false)
            .then(|| DEFAULT_CONFIG_FILE.to_string()),
        Some(c) => Some(c.clone()),
    };

    Ok(if let Some(config_file) = config_file {
        config::File::default_with_user_config_file(&config_file)?
    } else {
        config::File::default()
    })
}

fn select_registry(catalog: &mut Catalog, prompt: &mut dyn Prompt, args: &RegistryArgs) -> Result<(), Error> {
    let provider = match &args.registry_type {
        Some(name) => catalog.select_by_name(name)?,
        None => catalog.choose_interactive(prompt)?,
    };
    info!("Registry type: {}", provider.caption());
    Ok(())
}

fn in_namespace(deployment: &Deployment) -> String {
    deployment
        .namespace
        .as_ref()
        .map(|namespace| format!(" in namespace {namespace}"))
        .unwrap_or_default()
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(_) => std::process::exit(0),
        Err(err) => {
            error!("fatal: {}", err.to_string());
            std::process::exit(1)
        }
    }
}

async fn run() -> Result<(), Error> {
    env_logger::init();

    let args = Cli::parse();
    let cfg = read_config(&args)?;

    let cluster = Kubectl::new(&cfg.kubectl);
    let http = reqwest::Client::new();
    let mut prompt = Terminal;

    match args.command {
        Commands::Install { target: InstallTarget::ApiOperator { from_file, registry } } => {
            let source = match from_file {
                Some(location) => Source::parse(&location),
                None => {
                    let component = cfg.component(API_OPERATOR)?;
                    let version = version::resolve(&http, &mut version::ProcessEnv, component).await?;
                    Source::Url(component.configs_url(&version))
                }
            };

            let mut catalog = Catalog::with_builtin()?;
            select_registry(&mut catalog, &mut prompt, &registry)?;

            let target = Target { cluster: &cluster, namespace: &cfg.operator.namespace, config: &cfg.registry };
            let mut session = Session { prompt: &mut prompt, http: &http, config: &cfg.registry };
            install::api_operator(&target, &mut session, &mut catalog, &cfg.operator, &source, registry.flag_values().as_ref()).await?;
            println!("API Operator installed in namespace {}", cfg.operator.namespace);
            Ok(())
        }
        Commands::Uninstall { target: UninstallTarget::ApiOperator { force } } => {
            let component = cfg.component(API_OPERATOR)?;
            let version = version::resolve(&http, &mut version::ProcessEnv, component).await?;
            if install::uninstall_api_operator(&cluster, &mut prompt, &cfg.operator, &version, force)? {
                println!("API Operator uninstalled");
            } else {
                println!("Cancelled");
            }
            Ok(())
        }
        Commands::Change { target: ChangeTarget::Registry { registry } } => {
            let mut catalog = Catalog::with_builtin()?;
            select_registry(&mut catalog, &mut prompt, &registry)?;

            let mut session = Session { prompt: &mut prompt, http: &http, config: &cfg.registry };
            catalog.gather_active(&mut session, registry.flag_values().as_ref()).await?;

            let target = Target { cluster: &cluster, namespace: &cfg.operator.namespace, config: &cfg.registry };
            catalog.update_configs_secrets(&target, &cfg.operator)?;
            println!("Registry configured");
            Ok(())
        }
        Commands::Add { target: ApiTarget::Api(api) } => {
            let deployment = Deployer::new(&cluster, &cfg.api).deploy(&api.request()?)?;
            println!("API {} added{}", deployment.name, in_namespace(&deployment));
            Ok(())
        }
        Commands::Update { target: ApiTarget::Api(api) } => {
            let deployment = Deployer::new(&cluster, &cfg.api).update(api.request()?)?;
            if !deployment.orphaned.is_empty() {
                warn!("Remove old configmaps manually: {}", deployment.orphaned.join(", "));
            }
            println!("API {} updated{}", deployment.name, in_namespace(&deployment));
            Ok(())
        }
    }
}
