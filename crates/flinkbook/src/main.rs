use clap::Parser;
use eyre::Result;
use tracing::debug;

use flinkbook::cli::{Cli, Commands, ConfigCommands};
use flinkbook::commands::{
    Command,
    config::{ConfigAction, ConfigCommand},
    query::QueryCommand,
    serve::ServeCommand,
};
use flinkbook_core::config::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Load .env file if it exists
    flinkbook::cli::config::load_env()?;

    // Level configured via RUST_LOG
    if let Some(log_file) = flinkbook_core::utils::tracing::init_tracing(cli.log_stderr)? {
        debug!(path = %log_file.display(), "Logging to file");
    }

    match cli.command {
        Commands::Config { action } => {
            let cmd = ConfigCommand {
                path: cli.config,
                action: match action {
                    ConfigCommands::Show => ConfigAction::Show,
                    ConfigCommands::Path => ConfigAction::Path,
                    ConfigCommands::Init => ConfigAction::Init,
                },
            };
            cmd.execute().await
        }
        Commands::Serve => {
            let settings = load_settings(cli.config.as_deref())?;
            ServeCommand { settings }.execute().await
        }
        Commands::Query {
            sql,
            gateway_url,
            key,
            on_limit,
        } => {
            let settings = load_settings(cli.config.as_deref())?;
            let cmd = QueryCommand {
                settings,
                sql,
                gateway_url,
                key,
                on_limit,
            };
            cmd.execute().await
        }
    }
}

fn load_settings(path: Option<&std::path::Path>) -> Result<Settings> {
    let settings = match path {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    Ok(settings)
}
