use bollard::query_parameters::{
  ListContainersOptions, LogsOptions,
};
use colored::Colorize;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::{
  app::App,
  docker::{CONTAINER_LABEL, Host},
};

/// Streams a container's output to stdout. Stopped containers
/// still have logs, so the instance is found by label over the
/// full container list rather than through the formation.
pub async fn tail(
  container: &str,
  follow: bool,
  lines: u32,
  all: bool,
) -> anyhow::Result<()> {
  let app = App::load()?;
  let container = app.graph.require(container)?;
  let host = Host::from_env();
  let docker = host.docker()?;
  let containers = docker
    .list_containers(Some(ListContainersOptions {
      all: true,
      ..Default::default()
    }))
    .await?;
  let Some(name) = containers.into_iter().find_map(|summary| {
    let labels = summary.labels?;
    if labels.get(CONTAINER_LABEL) == Some(&container.name) {
      summary
        .names?
        .into_iter()
        .next()
        .map(|name| name.trim_start_matches('/').to_string())
    } else {
      None
    }
  }) else {
    eprintln!(
      "{}",
      format!(
        "Cannot find instance of {} to print logs for.",
        container.name
      )
      .red()
    );
    std::process::exit(1);
  };

  let tail = if all {
    String::from("all")
  } else {
    lines.to_string()
  };
  let mut stream = docker.logs(
    &name,
    Some(LogsOptions {
      follow,
      stdout: true,
      stderr: true,
      tail,
      ..Default::default()
    }),
  );
  let mut out = tokio::io::stdout();
  while let Some(chunk) = stream.next().await {
    let Ok(chunk) = chunk else {
      break;
    };
    out.write_all(&chunk.into_bytes()).await?;
    out.flush().await?;
  }
  Ok(())
}
