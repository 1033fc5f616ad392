#[macro_use]
extern crate tracing;

mod app;
mod command;
mod config;
mod docker;
mod error;
mod formation;
mod graph;
mod plugins;

use crate::config::{Command, bay_config, cli_args};

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let args = cli_args();
  logger::init(&bay_config().logging)?;

  match &args.command {
    Command::Up {
      containers,
      no_stop,
    } => command::run::up(containers, *no_stop).await,
    Command::Stop { containers } => {
      command::run::stop(containers).await
    }
    Command::Shell { container } => {
      command::run::shell(container).await
    }
    Command::Ps { container } => {
      command::ps::ps(container.as_deref()).await
    }
    Command::Tail {
      container,
      follow,
      lines,
      all,
    } => {
      command::tail::tail(container, *follow, *lines, *all).await
    }
    Command::Pull { containers } => {
      command::pull::pull(containers).await
    }
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;
  tokio::select! {
    res = tokio::spawn(app()) => res?,
    _ = term_signal.recv() => Ok(()),
  }
}
