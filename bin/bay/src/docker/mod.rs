use std::sync::OnceLock;

use anyhow::Context;
use bollard::Docker;
use bollard::query_parameters::InspectContainerOptions;

use crate::error::BayError;

pub mod attach;
pub mod images;
pub mod introspect;
pub mod runner;
pub mod towline;

/// Label carried by every container the reconciler creates; the
/// sole identity mapping from a live container back to its catalog
/// entry.
pub const CONTAINER_LABEL: &str = "com.eventbrite.bay.container";

/// A Docker-running host. The underlying client connects lazily on
/// first use so that commands which never touch the daemon do not
/// require one.
pub struct Host {
  url: String,
  docker: OnceLock<Docker>,
}

impl Host {
  pub fn from_env() -> Host {
    Host {
      url: std::env::var("DOCKER_HOST").unwrap_or_else(|_| {
        String::from("unix:///var/run/docker.sock")
      }),
      docker: OnceLock::new(),
    }
  }

  pub fn docker(&self) -> anyhow::Result<&Docker> {
    if let Some(docker) = self.docker.get() {
      return Ok(docker);
    }
    let docker =
      Docker::connect_with_defaults().map_err(|e| {
        debug!("docker connection failed: {e:?}");
        BayError::DockerNotAvailable {
          url: self.url.clone(),
        }
      })?;
    Ok(self.docker.get_or_init(move || docker))
  }

  /// The address the host's published ports appear on, as seen
  /// from where bay runs.
  pub fn external_address(&self) -> &str {
    match self.url.strip_prefix("tcp://") {
      Some(location) => {
        location.split(':').next().unwrap_or("127.0.0.1")
      }
      None => "127.0.0.1",
    }
  }

  pub async fn container_exists(&self, name: &str) -> bool {
    match self.docker() {
      Ok(docker) => docker
        .inspect_container(
          name,
          Option::<InspectContainerOptions>::None,
        )
        .await
        .is_ok(),
      Err(_) => false,
    }
  }

  /// Errors when the container does not exist.
  pub async fn container_running(
    &self,
    name: &str,
  ) -> anyhow::Result<bool> {
    let details = self
      .docker()?
      .inspect_container(
        name,
        Option::<InspectContainerOptions>::None,
      )
      .await
      .with_context(|| {
        format!("Failed to inspect container {name}")
      })?;
    Ok(
      details
        .state
        .and_then(|state| state.running)
        .unwrap_or_default(),
    )
  }
}
