use std::sync::Arc;

use anyhow::Context;
use bollard::container::AttachContainerResults;
use bollard::query_parameters::{
  AttachContainerOptions, RemoveContainerOptions,
};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use super::Host;

/// Attaches the local terminal to a foreground container. Built by
/// a start worker, run on the driving task: the raw-mode terminal
/// and the stdin pump must not live on a worker.
pub struct AttachHandler {
  host: Arc<Host>,
  container_name: String,
}

impl AttachHandler {
  pub fn new(
    host: Arc<Host>,
    container_name: impl Into<String>,
  ) -> AttachHandler {
    AttachHandler {
      host,
      container_name: container_name.into(),
    }
  }

  /// Starts the container attached, mirrors stdio until the
  /// session ends, then removes the container.
  pub async fn run(self) -> anyhow::Result<()> {
    let docker = self.host.docker()?;
    let AttachContainerResults {
      mut output,
      mut input,
    } = docker
      .attach_container(
        &self.container_name,
        Some(AttachContainerOptions {
          stream: true,
          stdin: true,
          stdout: true,
          stderr: true,
          ..Default::default()
        }),
      )
      .await
      .with_context(|| {
        format!(
          "Failed to attach to container {}",
          self.container_name
        )
      })?;
    docker
      .start_container(
        &self.container_name,
        Option::<
          bollard::query_parameters::StartContainerOptions,
        >::None,
      )
      .await
      .with_context(|| {
        format!(
          "Failed to start container {}",
          self.container_name
        )
      })?;

    crossterm::terminal::enable_raw_mode()
      .context("Failed to put terminal into raw mode")?;
    let stdin_pump = tokio::spawn(async move {
      let mut stdin = tokio::io::stdin();
      let _ = tokio::io::copy(&mut stdin, &mut input).await;
    });
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = output.next().await {
      let Ok(chunk) = chunk else {
        break;
      };
      if stdout.write_all(&chunk.into_bytes()).await.is_err() {
        break;
      }
      let _ = stdout.flush().await;
    }
    stdin_pump.abort();
    let _ = crossterm::terminal::disable_raw_mode();

    self
      .host
      .docker()?
      .remove_container(
        &self.container_name,
        Option::<RemoveContainerOptions>::None,
      )
      .await
      .with_context(|| {
        format!(
          "Failed to remove container {} after the session",
          self.container_name
        )
      })?;
    Ok(())
  }
}
