use clap::Parser;
use cli::{Cli, Commands};
use common::tracing::init_tracing;
use hshstack::{
    config::Config,
    observability::observability,
    provision::{check_dependencies, destroy, sync, AssumeYes},
    Cluster,
};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing("info");

    let result = run(cli.command).await;

    if let Err(error) = result {
        eprintln!("{error:#}");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(command: Commands) -> anyhow::Result<()> {
    check_dependencies()?;

    match command {
        Commands::Sync {
            config_file,
            hetzner,
            object_storage,
        } => {
            tracing::debug!("{hetzner:?} {object_storage:?}");
            let config = Config::load(&config_file)?;
            sync(
                &config,
                hetzner.hetzner_token,
                object_storage.into_credentials()?,
            )
            .await
        }
        Commands::Bootstrap {
            config_file,
            object_storage,
        } => {
            let config = Config::load(&config_file)?;
            let outcome = hshstack::bootstrap(
                &Cluster::from(&config),
                object_storage.into_credentials()?,
            )
            .await?;

            if outcome.has_bootstrapped() {
                println!("Cluster bootstrapped, run sync to distribute the new tokens to the nodes");
            } else {
                println!("Cluster already bootstrapped, policies updated");
            }

            Ok(())
        }
        Commands::Observability { config_file } => {
            let config = Config::load(&config_file)?;
            observability(&config).await
        }
        Commands::Destroy {
            config_file,
            hetzner,
            assume_yes,
        } => {
            let config = Config::load(&config_file)?;
            destroy(
                &config,
                hetzner.hetzner_token,
                AssumeYes::from_boolean(assume_yes),
            )
            .await
        }
    }
}
