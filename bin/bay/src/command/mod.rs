use std::sync::Arc;

use colored::Colorize;
use tasks::{StatusFlavor, Task, Update};

use crate::{
  app::App,
  docker::{Host, runner::FormationRunner},
  error::{BayError, RuntimeErrorCode},
  formation::Formation,
};

pub mod ps;
pub mod pull;
pub mod run;
pub mod tail;

/// Drives a formation change and handles runner errors the way
/// every command does: red one-liners for operational failures,
/// exit 1 when an image is missing.
pub(crate) async fn run_formation(
  app: &Arc<App>,
  host: &Arc<Host>,
  formation: Formation,
  task: Task,
  stop: bool,
) -> anyhow::Result<()> {
  let runner = FormationRunner::new(
    app.clone(),
    host.clone(),
    formation,
    task.clone(),
  )
  .with_stop(stop);
  let Err(e) = runner.run().await else {
    task.finish(Update::flavored("Done", StatusFlavor::Good));
    return Ok(());
  };
  match e.downcast_ref::<BayError>() {
    Some(BayError::DockerRuntime {
      message,
      code,
      container,
    }) => {
      app.plugins.run_docker_fail(&e).await;
      eprintln!("{}", message.red());
      if matches!(code, Some(RuntimeErrorCode::BootFail))
        && let Some(container) = container
      {
        eprintln!(
          "{}",
          format!(
            "You can see its output with `bay tail {container}`."
          )
          .red()
        );
      }
      return Ok(());
    }
    Some(BayError::ImageNotFound { container, .. }) => {
      match container {
        Some(container) => eprintln!(
          "{}",
          format!(
            "Missing image for {container} - cannot continue boot."
          )
          .red()
        ),
        None => eprintln!("{}", e.to_string().red()),
      }
      std::process::exit(1);
    }
    _ => {}
  }
  Err(e)
}

pub(crate) fn clamp_sha(maybe_sha: &str) -> String {
  if maybe_sha.starts_with("sha256:") {
    maybe_sha[0..20].to_string() + "..."
  } else {
    maybe_sha.to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn clamp_sha_shortens_hashes_only() {
    assert_eq!(
      clamp_sha(
        "sha256:1111111111111111111111111111111111111111"
      ),
      "sha256:1111111111111..."
    );
    assert_eq!(clamp_sha("postgres:latest"), "postgres:latest");
  }
}
