mod adapters;
mod agent;
mod app;
mod conference;
mod config;
mod control;
mod dns;
mod failsafe;
mod keystore;
mod migrate;
mod model;
mod registry;
mod state;
mod util;

use clap::{CommandFactory, FromArgMatches};

use config::Config;

/// Build the full clap command: Config args + service subcommands.
///
/// `subcommand_negates_reqs` lets subcommands bypass the Config flags so
/// e.g. `nettica-client status` doesn't parse the agent arguments.
fn build_command() -> clap::Command {
    Config::command()
        .subcommand(clap::Command::new("install").about("Install and start the systemd service"))
        .subcommand(clap::Command::new("uninstall").about("Stop and remove the systemd service"))
        .subcommand(clap::Command::new("start").about("Start the systemd service"))
        .subcommand(clap::Command::new("stop").about("Stop the systemd service"))
        .subcommand(clap::Command::new("status").about("Show service status"))
        .subcommand_negates_reqs(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = build_command().get_matches();
    match matches.subcommand() {
        Some(("install", _)) => adapters::service::cmd_install(),
        Some(("uninstall", _)) => adapters::service::cmd_uninstall(),
        Some(("start", _)) => adapters::service::cmd_start(),
        Some(("stop", _)) => adapters::service::cmd_stop(),
        Some(("status", _)) => adapters::service::cmd_status(),
        Some(_) => unreachable!(),
        None => {
            let mut config = Config::from_arg_matches(&matches)?;
            config.finalize();
            app::run(config).await
        }
    }
}
