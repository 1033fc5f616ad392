use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use bollard::query_parameters::ListContainersOptions;
use bollard::secret::ContainerSummary;
use indexmap::IndexMap;

use super::{CONTAINER_LABEL, Host, images::ImageRepository};
use crate::{
  error::BayError,
  formation::{ContainerInstance, Formation},
  graph::ContainerGraph,
};

/// Materialises the [Formation] a host is currently running on a
/// given network, for comparison with a desired one.
pub struct FormationIntrospector {
  host: Arc<Host>,
  images: Arc<ImageRepository>,
  graph: Arc<ContainerGraph>,
  network: String,
}

impl FormationIntrospector {
  /// The network defaults to the graph prefix.
  pub fn new(
    host: Arc<Host>,
    images: Arc<ImageRepository>,
    graph: Arc<ContainerGraph>,
    network: Option<String>,
  ) -> FormationIntrospector {
    let network =
      network.unwrap_or_else(|| graph.prefix().to_string());
    FormationIntrospector {
      host,
      images,
      graph,
      network,
    }
  }

  #[instrument(skip(self), fields(network = %self.network))]
  pub async fn introspect(&self) -> anyhow::Result<Formation> {
    let containers = self
      .host
      .docker()?
      .list_containers(Some(ListContainersOptions {
        all: false,
        ..Default::default()
      }))
      .await
      .context("Failed to list containers")?;
    let mut formation =
      Formation::new(self.graph.clone(), Some(self.network.clone()));
    for summary in containers {
      let on_network = summary
        .network_settings
        .as_ref()
        .and_then(|settings| settings.networks.as_ref())
        .map(|networks| networks.contains_key(&self.network))
        .unwrap_or_default();
      if !on_network {
        continue;
      }
      let instance = self.build_instance(summary).await?;
      formation.add_instance(instance);
    }
    self.link_instances(&mut formation);
    Ok(formation)
  }

  /// Introspects one container directly by runtime name.
  pub async fn introspect_single_container(
    &self,
    name: &str,
  ) -> anyhow::Result<ContainerInstance> {
    let filters = HashMap::from([(
      String::from("name"),
      vec![name.to_string()],
    )]);
    let mut containers = self
      .host
      .docker()?
      .list_containers(Some(ListContainersOptions {
        filters: Some(filters),
        ..Default::default()
      }))
      .await
      .context("Failed to list containers")?;
    if containers.is_empty() {
      return Err(
        BayError::runtime(format!(
          "Cannot introspect single container {name}"
        ))
        .into(),
      );
    }
    self.build_instance(containers.remove(0)).await
  }

  async fn build_instance(
    &self,
    summary: ContainerSummary,
  ) -> anyhow::Result<ContainerInstance> {
    let container_name = summary
      .names
      .unwrap_or_default()
      .into_iter()
      .next()
      .context("No names on container")?
      .trim_start_matches('/')
      .to_string();
    let container = summary
      .labels
      .as_ref()
      .and_then(|labels| labels.get(CONTAINER_LABEL))
      .and_then(|catalog_name| self.graph.get(catalog_name))
      .ok_or_else(|| {
        BayError::runtime(format!(
          "Cannot find local container for running container {container_name}"
        ))
      })?
      .clone();

    let image_field = summary.image.unwrap_or_default();
    let (image, image_tag, image_id) =
      if image_field.starts_with("sha256:") {
        (String::new(), String::new(), image_field)
      } else {
        let (name, tag) = match image_field.split_once(':') {
          Some((name, tag)) => {
            (name.to_string(), tag.to_string())
          }
          None => (image_field, String::from("latest")),
        };
        let id = self.images.image_version(&name, &tag).await?;
        (name, tag, id)
      };

    let mut instance =
      ContainerInstance::new(container_name, container.clone());
    instance.image = image;
    instance.image_tag = image_tag;
    instance.image_id = Some(image_id);
    // Enabled devmodes are not observable on the host; the catalog
    // options are the source of truth for both sides of a diff.
    instance.devmodes =
      self.graph.options(&container.name).devmodes.clone();
    instance.ip_address = summary
      .network_settings
      .and_then(|settings| settings.networks)
      .and_then(|mut networks| networks.remove(&self.network))
      .and_then(|endpoint| endpoint.ip_address);
    instance.port_mapping = summary
      .ports
      .unwrap_or_default()
      .into_iter()
      .filter_map(|port| {
        Some((port.private_port, port.public_port?))
      })
      .collect();
    Ok(instance)
  }

  /// Reconstructs links the same way the desired side builds them:
  /// each instance links to the instance of every direct
  /// dependency present in the formation, aliased by container
  /// name.
  fn link_instances(&self, formation: &mut Formation) {
    let mut links: HashMap<String, IndexMap<String, String>> =
      HashMap::new();
    for instance in formation.iter() {
      for dependency in
        self.graph.dependencies(&instance.container)
      {
        if let Some(target) =
          formation.instance_of(&dependency.name)
        {
          links
            .entry(instance.name.clone())
            .or_default()
            .insert(dependency.name.clone(), target.to_string());
        }
      }
    }
    for (name, links) in links {
      if let Some(instance) = formation.get_mut(&name) {
        instance.links = links;
      }
    }
  }
}
