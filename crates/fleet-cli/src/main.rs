mod config;
mod prompt;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fleet_infra::ami::{SshShell, save_as_ami};
use fleet_infra::deployer::{AssumeYes, Confirm, DeployOptions, FleetDeployer};
use fleet_infra::inventory::Inventory;
use fleet_infra::keys::create_key;
use fleet_infra::poller::ConvergencePoller;
use fleet_infra::security::authorize_port;
use fleet_infra::session::Session;
use fleet_infra::store::DesiredStateStore;
use fleet_infra::{Error, Result};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::prompt::StdinConfirm;

/// Reconcile an EC2 fleet against a desired-state document.
#[derive(Debug, Parser)]
#[command(name = "fleetctl", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Launch every machine of a stage that has no recorded instance.
    Deploy {
        stage: String,
        /// Key pair for the new instances (overrides FLEET_KEY_NAME).
        #[arg(long)]
        key_name: Option<String>,
        /// Do not ask for confirmation.
        #[arg(long)]
        yes: bool,
        /// Provision again machines whose recorded instance is gone.
        #[arg(long)]
        verify_ids: bool,
    },

    /// Wait for pending instances and record their live attributes.
    Converge,

    /// Open a port to the world on a security group.
    AuthorizePort {
        group: String,
        protocol: String,
        #[arg(allow_hyphen_values = true)]
        port: i64,
    },

    /// Create a key pair and write its private key to <dir>/<name>.pem.
    CreateKey {
        name: String,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },

    Instances,

    Images {
        /// Image owners (`self`, `amazon`, an account id).
        #[arg(long = "owner", default_value = "self")]
        owners: Vec<String>,
    },

    Sizes,

    Regions,

    /// Show the running instance tagged with a name.
    Instance { name: String },

    Image { id: String },

    Size { id: String },

    Region { id: String },

    /// Bundle a host into a new machine image over ssh.
    SaveAmi {
        host: String,
        name: String,
        #[arg(long, default_value = "i386")]
        arch: String,
    },
}

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli.command).await {
        tracing::error!(error = %e, "fleetctl failed");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<()> {
    if let Command::Sizes = command {
        return print_json(fleet_infra::sizes::CATALOG);
    }
    if let Command::Size { id } = &command {
        let size = fleet_infra::sizes::find(id)
            .ok_or_else(|| Error::NotFound(format!("size \"{id}\"")))?;
        return print_json(size);
    }

    let config = AppConfig::from_env()?;
    let session = Session::connect(config.provider.clone()).await?;
    let provider = session.provider();
    let inventory = Inventory::new(provider);

    match command {
        Command::Deploy {
            stage,
            key_name,
            yes,
            verify_ids,
        } => {
            let store = DesiredStateStore::new(&config.state_file, &config.provider.region_id);
            let confirm: &dyn Confirm = if yes { &AssumeYes } else { &StdinConfirm };
            let options = DeployOptions {
                key_name: key_name.or_else(|| config.provider.key_name.clone()),
                security_groups: config.provider.security_groups.clone(),
                verify_recorded_ids: verify_ids,
            };

            let report = FleetDeployer::new(provider, &store, confirm, options)
                .deploy(&stage)
                .await?;
            print_json(&DeploySummary::from(&report))
        }
        Command::Converge => {
            let store = DesiredStateStore::new(&config.state_file, &config.provider.region_id);
            let report = ConvergencePoller::new(provider, &store, config.poll)
                .converge()
                .await?;
            print_json(&report.settled)
        }
        Command::AuthorizePort {
            group,
            protocol,
            port,
        } => {
            let outcome = authorize_port(provider, &group, &protocol, port).await?;
            println!("{outcome:?}");
            Ok(())
        }
        Command::CreateKey { name, dir } => {
            let path = create_key(provider, &name, &dir).await?;
            println!("{}", path.display());
            Ok(())
        }
        Command::Instances => print_json(&inventory.list_instances().await?),
        Command::Images { owners } => print_json(&inventory.list_images(&owners).await?),
        Command::Regions => print_json(&inventory.list_regions().await?),
        Command::Instance { name } => {
            let instance = inventory
                .get_instance(&name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("running instance named \"{name}\"")))?;
            print_json(&instance)
        }
        Command::Image { id } => {
            let image = inventory
                .get_image(&id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("image \"{id}\"")))?;
            print_json(&image)
        }
        Command::Region { id } => {
            let region = inventory
                .get_region(&id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("region \"{id}\"")))?;
            print_json(&region)
        }
        Command::SaveAmi { host, name, arch } => {
            let bundle = config.ami_bundle(&name, &arch)?;
            let image_id = save_as_ami(&SshShell::new(host), &bundle).await?;
            println!("{image_id}");
            Ok(())
        }
        Command::Sizes | Command::Size { .. } => Ok(()),
    }
}

#[derive(Serialize)]
struct DeploySummary<'a> {
    stage: &'a str,
    provisioned: Vec<ProvisionedMachine<'a>>,
    skipped: &'a [String],
}

#[derive(Serialize)]
struct ProvisionedMachine<'a> {
    name: &'a str,
    instance_id: &'a str,
}

impl<'a> From<&'a fleet_infra::deployer::DeployReport> for DeploySummary<'a> {
    fn from(report: &'a fleet_infra::deployer::DeployReport) -> Self {
        Self {
            stage: &report.stage,
            provisioned: report
                .provisioned
                .iter()
                .map(|(name, id)| ProvisionedMachine {
                    name,
                    instance_id: id.as_str(),
                })
                .collect(),
            skipped: &report.skipped,
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
