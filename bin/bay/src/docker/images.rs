use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use bollard::query_parameters::{
  CreateImageOptions, TagImageOptions,
};
use dashmap::DashMap;
use futures::StreamExt;
use indexmap::IndexMap;
use tasks::{RateLimitedUpdater, StatusFlavor, Task, Update};

use super::Host;
use crate::{config::bay_config, error::BayError};

/// Tag meaning "use whatever is on disk; do not touch the
/// registry".
pub const LOCAL_TAG: &str = "local";

/// Per-host gateway for image-name to hash resolution and registry
/// pulls. Resolved hashes are cached for the life of the
/// repository; a pull invalidates the tag it refreshed.
pub struct ImageRepository {
  host: Arc<Host>,
  cache: DashMap<String, String>,
}

impl ImageRepository {
  pub fn new(host: Arc<Host>) -> ImageRepository {
    ImageRepository {
      host,
      cache: DashMap::new(),
    }
  }

  /// The image hash for the given name and tag, or ImageNotFound
  /// when the host does not have it.
  pub async fn image_version(
    &self,
    image_name: &str,
    image_tag: &str,
  ) -> anyhow::Result<String> {
    let key = format!("{image_name}:{image_tag}");
    if let Some(id) = self.cache.get(&key) {
      return Ok(id.clone());
    }
    match self.host.docker()?.inspect_image(&key).await {
      Ok(image) => {
        let id = image
          .id
          .with_context(|| format!("No id on image {key}"))?;
        self.cache.insert(key, id.clone());
        Ok(id)
      }
      Err(bollard::errors::Error::DockerResponseServerError {
        status_code: 404,
        ..
      }) => Err(
        BayError::ImageNotFound {
          image: image_name.to_string(),
          image_tag: image_tag.to_string(),
          container: None,
        }
        .into(),
      ),
      Err(e) => Err(e)
        .with_context(|| format!("Failed to inspect image {key}")),
    }
  }

  /// All known versions of an image. Currently just the `latest`
  /// tag when it resolves.
  pub async fn image_versions(
    &self,
    image_name: &str,
  ) -> HashMap<String, String> {
    match self.image_version(image_name, "latest").await {
      Ok(id) => HashMap::from([(String::from("latest"), id)]),
      Err(_) => HashMap::new(),
    }
  }

  /// Pulls `registry/{image_name}:{image_tag}` from the configured
  /// registry, streaming per-layer progress into a subtask of
  /// `parent_task`, then re-tags the result as
  /// `{image_name}:{image_tag}` locally.
  #[instrument(skip(self, parent_task))]
  pub async fn pull_image_version(
    &self,
    image_name: &str,
    image_tag: &str,
    parent_task: Option<&Task>,
    fail_silently: bool,
  ) -> anyhow::Result<()> {
    if image_tag == LOCAL_TAG {
      return Ok(());
    }
    let registry = &bay_config().registry;
    let remote_name = format!("{registry}/{image_name}");

    let docker = self.host.docker()?;
    let mut stream = docker.create_image(
      Some(CreateImageOptions {
        from_image: Some(remote_name.clone()),
        tag: Some(image_tag.to_string()),
        ..Default::default()
      }),
      None,
      None,
    );

    // Per-layer (current, total) download counters, aggregated
    // into one progress bar.
    let mut layers: IndexMap<String, (u64, u64)> = IndexMap::new();
    let mut progress: Option<(Task, RateLimitedUpdater)> = None;
    while let Some(event) = stream.next().await {
      let info = match event {
        Ok(info) => info,
        Err(e) => {
          drop(progress);
          if fail_silently {
            return Ok(());
          }
          return Err(
            BayError::ImagePullFailure {
              message: e.to_string(),
              remote_name,
              image_tag: image_tag.to_string(),
            }
            .into(),
          );
        }
      };
      if let Some(error) = info.error {
        drop(progress);
        if fail_silently {
          return Ok(());
        }
        return Err(
          BayError::ImagePullFailure {
            message: error,
            remote_name,
            image_tag: image_tag.to_string(),
          }
          .into(),
        );
      }
      let (Some(id), Some(status)) = (info.id, info.status) else {
        continue;
      };
      let status = status.to_ascii_lowercase();
      if status.contains("downloading") {
        let Some(detail) = info.progress_detail else {
          continue;
        };
        layers.insert(
          id,
          (
            detail.current.unwrap_or_default().max(0) as u64,
            detail.total.unwrap_or_default().max(0) as u64,
          ),
        );
      } else if status.contains("complete") {
        if let Some(layer) = layers.get_mut(&id) {
          layer.0 = layer.1;
        }
      } else {
        continue;
      }
      if let Some(parent) = parent_task {
        let pull = progress.get_or_insert_with(|| {
          let task = parent
            .subtask(format!("Pulling remote image {image_name}"));
          let updater =
            task.rate_limited(Duration::from_millis(100));
          (task, updater)
        });
        let current =
          layers.values().map(|(current, _)| current).sum();
        let total = layers.values().map(|(_, total)| total).sum();
        pull.1.update(Update::progress(current, total));
      }
    }

    match docker
      .tag_image(
        &format!("{remote_name}:{image_tag}"),
        Some(TagImageOptions {
          repo: Some(image_name.to_string()),
          tag: Some(image_tag.to_string()),
        }),
      )
      .await
    {
      Ok(()) => {}
      Err(bollard::errors::Error::DockerResponseServerError {
        status_code: 404,
        ..
      }) => {
        drop(progress);
        if fail_silently {
          return Ok(());
        }
        return Err(
          BayError::ImagePullFailure {
            message: format!(
              "Failed to tag {remote_name}:{image_tag}"
            ),
            remote_name,
            image_tag: image_tag.to_string(),
          }
          .into(),
        );
      }
      Err(e) => {
        return Err(e).with_context(|| {
          format!("Failed to tag {remote_name}:{image_tag}")
        });
      }
    }

    if let Some((task, updater)) = progress {
      // Join the flusher before the final mutation.
      drop(updater);
      task.finish(Update::flavored("Done", StatusFlavor::Good));
    }
    // The tag now points at the pulled image.
    self.cache.remove(&format!("{image_name}:{image_tag}"));
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn layer_counters_aggregate() {
    let mut layers: IndexMap<String, (u64, u64)> = IndexMap::new();
    layers.insert(String::from("aaa"), (10, 100));
    layers.insert(String::from("bbb"), (50, 50));
    let current: u64 =
      layers.values().map(|(current, _)| current).sum();
    let total: u64 = layers.values().map(|(_, total)| total).sum();
    assert_eq!((current, total), (60, 150));
    // A complete event snaps the layer to its total.
    if let Some(layer) = layers.get_mut("aaa") {
      layer.0 = layer.1;
    }
    let current: u64 =
      layers.values().map(|(current, _)| current).sum();
    assert_eq!(current, 150);
  }
}
