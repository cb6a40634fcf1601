use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use savesync::config::{ConfigStore, CredentialConfig, DEFAULT_CONFIG_FILE};
use savesync::engine::SyncEngine;
use savesync::oauth::{Credential, TokenManager};
use savesync::process::ProcessWatcher;
use savesync::remote::DropboxStore;

#[derive(Parser)]
#[command(
    name = "savesync",
    version,
    about = "Keeps a local save file in sync with its Dropbox copy around the monitored application's lifecycle"
)]
struct Cli {
    /// Path to the configuration document
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Validate configuration and remote connectivity, then exit
    #[arg(long)]
    test: bool,

    /// Run one import cycle and exit
    #[arg(long)]
    import: bool,

    /// Run one export cycle and exit
    #[arg(long)]
    upload: bool,

    /// Run the interactive authorization flow and exit
    #[arg(long)]
    authorize: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    // The only fatal error: without a configuration there is nothing to do.
    let store = ConfigStore::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let config = store.sync_config().context("invalid configuration")?;

    let mut credential = match &config.credentials {
        CredentialConfig::OAuth {
            app_key,
            app_secret,
        } => Credential::OAuth(Box::new(TokenManager::new(
            app_key.clone(),
            app_secret.clone(),
            store,
        ))),
        CredentialConfig::Static { token } => Credential::Static(token.clone()),
    };

    if cli.authorize {
        return match &mut credential {
            Credential::OAuth(manager) => {
                manager.authorize_new_user().await.context("authorization failed")?;
                info!("authorization complete");
                Ok(ExitCode::SUCCESS)
            }
            Credential::Static(_) => {
                anyhow::bail!("a static token is configured; there is nothing to authorize")
            }
        };
    }

    let watcher = ProcessWatcher::new(&config.app_name);
    let mut engine = SyncEngine::new(config, DropboxStore::new(), credential, watcher);

    if cli.test {
        return match engine.verify().await {
            Ok(()) => {
                info!("configuration test passed");
                Ok(ExitCode::SUCCESS)
            }
            Err(err) => {
                error!(error = %err, "configuration test failed");
                Ok(ExitCode::FAILURE)
            }
        };
    }

    if cli.import {
        return match engine.import().await {
            Ok(true) => {
                info!("manual import successful");
                Ok(ExitCode::SUCCESS)
            }
            Ok(false) => {
                info!("no remote copy to import");
                Ok(ExitCode::SUCCESS)
            }
            Err(err) => {
                error!(error = %err, "manual import failed");
                Ok(ExitCode::FAILURE)
            }
        };
    }

    if cli.upload {
        // The manual path deliberately skips the cooldown window.
        return match engine.export(true).await {
            Ok(true) => {
                info!("manual upload successful");
                Ok(ExitCode::SUCCESS)
            }
            Ok(false) => {
                error!("nothing to upload");
                Ok(ExitCode::FAILURE)
            }
            Err(err) => {
                error!(error = %err, "manual upload failed");
                Ok(ExitCode::FAILURE)
            }
        };
    }

    tokio::select! {
        _ = engine.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("sync stopped by user");
        }
    }
    Ok(ExitCode::SUCCESS)
}
