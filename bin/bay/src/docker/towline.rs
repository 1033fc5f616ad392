use std::sync::Arc;

use anyhow::Context;
use bollard::query_parameters::InspectContainerOptions;
use bollard::secret::{
  ContainerState, ContainerStateStatusEnum, HealthStatusEnum,
};

use super::Host;

/// What the boot side-channel currently reports for a container.
#[derive(Debug, Clone, PartialEq)]
pub enum BootStatus {
  /// Still booting, with an optional human-readable message.
  Pending(Option<String>),
  Ready,
  Failed(String),
}

/// Boot-status poll target for a starting container, backed by the
/// daemon's view of container state and healthcheck: a starting
/// healthcheck is pending, a dead container has failed, and a
/// running container without a healthcheck counts as booted.
pub struct Towline {
  host: Arc<Host>,
  container_name: String,
}

impl Towline {
  pub fn new(
    host: Arc<Host>,
    container_name: impl Into<String>,
  ) -> Towline {
    Towline {
      host,
      container_name: container_name.into(),
    }
  }

  pub async fn status(&self) -> anyhow::Result<BootStatus> {
    let details = self
      .host
      .docker()?
      .inspect_container(
        &self.container_name,
        Option::<InspectContainerOptions>::None,
      )
      .await
      .with_context(|| {
        format!(
          "Failed to inspect container {}",
          self.container_name
        )
      })?;
    Ok(classify(details.state))
  }
}

fn classify(state: Option<ContainerState>) -> BootStatus {
  let Some(state) = state else {
    return BootStatus::Pending(None);
  };
  match state.status {
    Some(ContainerStateStatusEnum::RUNNING) => {
      let Some(health) = state.health else {
        return BootStatus::Ready;
      };
      match health.status {
        Some(HealthStatusEnum::STARTING) => {
          // Surface the latest healthcheck output while booting.
          let message = health
            .log
            .unwrap_or_default()
            .into_iter()
            .next_back()
            .and_then(|result| result.output)
            .map(|output| output.trim().to_string())
            .filter(|output| !output.is_empty());
          BootStatus::Pending(message)
        }
        Some(HealthStatusEnum::UNHEALTHY) => {
          BootStatus::Failed(String::from("healthcheck failing"))
        }
        _ => BootStatus::Ready,
      }
    }
    Some(ContainerStateStatusEnum::CREATED)
    | Some(ContainerStateStatusEnum::RESTARTING) => {
      BootStatus::Pending(None)
    }
    _ => {
      let exit_code = state.exit_code.unwrap_or_default();
      let error = state.error.unwrap_or_default();
      BootStatus::Failed(if error.is_empty() {
        format!("exited with code {exit_code}")
      } else {
        error
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use bollard::secret::{Health, HealthcheckResult};

  fn state(
    status: ContainerStateStatusEnum,
  ) -> ContainerState {
    ContainerState {
      status: Some(status),
      ..Default::default()
    }
  }

  #[test]
  fn running_without_healthcheck_is_ready() {
    assert_eq!(
      classify(Some(state(ContainerStateStatusEnum::RUNNING))),
      BootStatus::Ready
    );
  }

  #[test]
  fn starting_healthcheck_is_pending_with_message() {
    let mut container_state =
      state(ContainerStateStatusEnum::RUNNING);
    container_state.health = Some(Health {
      status: Some(HealthStatusEnum::STARTING),
      log: Some(vec![HealthcheckResult {
        output: Some(String::from("waiting for socket\n")),
        ..Default::default()
      }]),
      ..Default::default()
    });
    assert_eq!(
      classify(Some(container_state)),
      BootStatus::Pending(Some(String::from(
        "waiting for socket"
      )))
    );
  }

  #[test]
  fn exited_is_failed_with_exit_code() {
    let mut container_state =
      state(ContainerStateStatusEnum::EXITED);
    container_state.exit_code = Some(137);
    assert_eq!(
      classify(Some(container_state)),
      BootStatus::Failed(String::from("exited with code 137"))
    );
  }

  #[test]
  fn created_is_pending() {
    assert_eq!(
      classify(Some(state(ContainerStateStatusEnum::CREATED))),
      BootStatus::Pending(None)
    );
  }
}
