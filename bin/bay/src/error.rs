use strum::Display;

/// Machine-readable subcode on [BayError::DockerRuntime].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeErrorCode {
  BootFail,
}

#[derive(Debug, thiserror::Error)]
pub enum BayError {
  /// Malformed catalog or profile, illegal link target, unknown
  /// devmode, schema mismatch.
  #[error("{0}")]
  BadConfig(String),

  #[error("The docker host at {url} is not available")]
  DockerNotAvailable { url: String },

  /// Operational failure from the container runtime, including boot
  /// failure and reconciliation deadlock.
  #[error("{message}")]
  DockerRuntime {
    message: String,
    code: Option<RuntimeErrorCode>,
    container: Option<String>,
  },

  #[error("Cannot find image {image}:{image_tag}")]
  ImageNotFound {
    image: String,
    image_tag: String,
    /// The owning container, attached when raised from the
    /// reconciler.
    container: Option<String>,
  },

  #[error("Failed to pull {remote_name}:{image_tag} | {message}")]
  ImagePullFailure {
    message: String,
    remote_name: String,
    image_tag: String,
  },

  /// Missing filesystem source for a devmode or bind volume.
  #[error("{0}")]
  NotFound(String),
}

impl BayError {
  pub fn bad_config(message: impl Into<String>) -> BayError {
    BayError::BadConfig(message.into())
  }

  pub fn runtime(message: impl Into<String>) -> BayError {
    BayError::DockerRuntime {
      message: message.into(),
      code: None,
      container: None,
    }
  }

  pub fn boot_fail(
    message: impl Into<String>,
    container: impl Into<String>,
  ) -> BayError {
    BayError::DockerRuntime {
      message: message.into(),
      code: Some(RuntimeErrorCode::BootFail),
      container: Some(container.into()),
    }
  }
}
