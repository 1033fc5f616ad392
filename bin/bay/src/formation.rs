use std::{
  collections::{BTreeSet, HashMap},
  hash::{Hash, Hasher},
  sync::Arc,
};

use indexmap::IndexMap;

use crate::{
  error::BayError,
  graph::{Container, ContainerGraph, dependency_sort},
};

/// The runtime projection of one [Container] inside a [Formation].
///
/// Instances are identified by runtime name alone; two instances
/// with the same name are the same instance for set membership and
/// diffing purposes, however much they otherwise differ (that is
/// what [ContainerInstance::different_from] is for).
#[derive(Debug, Clone)]
pub struct ContainerInstance {
  /// Runtime name, conventionally `{prefix}.{container}.1`.
  pub name: String,
  pub container: Arc<Container>,
  pub image: String,
  pub image_tag: String,
  /// Content hash, when observed from the host or resolved ahead
  /// of a diff. Authoritative over `image`/`image_tag` when both
  /// sides of a comparison carry one.
  pub image_id: Option<String>,
  /// Alias to instance name, within the same formation.
  pub links: IndexMap<String, String>,
  pub devmodes: BTreeSet<String>,
  /// Container port to host port, seeded from the container's
  /// declared ports.
  pub ports: IndexMap<u16, Option<u16>>,
  pub environment: IndexMap<String, String>,
  pub command: Option<Vec<String>>,
  /// Runs attached to a terminal instead of detached.
  pub foreground: bool,
  /// Observed only, filled by introspection or after start.
  pub ip_address: Option<String>,
  /// Observed only: private port to published host port.
  pub port_mapping: HashMap<u16, u16>,
}

impl ContainerInstance {
  pub fn new(
    name: impl Into<String>,
    container: Arc<Container>,
  ) -> ContainerInstance {
    let ports = container.ports.clone();
    ContainerInstance {
      name: name.into(),
      container,
      image: String::new(),
      image_tag: String::new(),
      image_id: None,
      links: IndexMap::new(),
      devmodes: BTreeSet::new(),
      ports,
      environment: IndexMap::new(),
      command: None,
      foreground: false,
      ip_address: None,
      port_mapping: HashMap::new(),
    }
  }

  /// Whether the other instance differs enough that it must be
  /// replaced (stopped and started) to match this one. Foreground
  /// instances always count as different: an interactive session
  /// is never reusable.
  pub fn different_from(&self, other: &ContainerInstance) -> bool {
    self.name != other.name
      || self.container.name != other.container.name
      || self.image_differs(other)
      || self.links != other.links
      || self.devmodes != other.devmodes
      || self.ports != other.ports
      || self.environment != other.environment
      || self.command != other.command
      || self.foreground
      || other.foreground
  }

  fn image_differs(&self, other: &ContainerInstance) -> bool {
    match (&self.image_id, &other.image_id) {
      (Some(own), Some(theirs)) => own != theirs,
      // Without two hashes, fall back to the name:tag pair, and
      // without two of those there is no evidence of drift.
      _ if !self.image.is_empty() && !other.image.is_empty() => {
        self.image != other.image
          || self.image_tag != other.image_tag
      }
      _ => false,
    }
  }

  /// Checks the instance settings against what its container
  /// declares and what the formation contains.
  pub fn validate(
    &self,
    formation: &Formation,
  ) -> anyhow::Result<()> {
    let graph = formation.graph();
    let dependencies = graph.dependencies(&self.container);
    for (alias, target_name) in &self.links {
      let target =
        formation.get(target_name).ok_or_else(|| {
          BayError::bad_config(format!(
            "Link target {target_name} is not in the formation"
          ))
        })?;
      if !dependencies.contains(&target.container) {
        return Err(
          BayError::bad_config(format!(
            "It is not possible to link {} to {} as {alias}",
            target_name, self.container.name
          ))
          .into(),
        );
      }
    }
    for devmode in &self.devmodes {
      if !self.container.devmodes.contains_key(devmode) {
        return Err(
          BayError::bad_config(format!(
            "Invalid devmode {devmode}"
          ))
          .into(),
        );
      }
    }
    Ok(())
  }
}

impl PartialEq for ContainerInstance {
  fn eq(&self, other: &ContainerInstance) -> bool {
    self.name == other.name
  }
}

impl Eq for ContainerInstance {}

impl Hash for ContainerInstance {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.name.hash(state);
  }
}

/// A desired or observed layout of container instances on a single
/// host, scoped by network. A container on the formation's network
/// that the formation does not contain should not be running.
#[derive(Debug, Clone)]
pub struct Formation {
  graph: Arc<ContainerGraph>,
  network: String,
  instances: IndexMap<String, ContainerInstance>,
}

impl Formation {
  /// The network defaults to the graph prefix.
  pub fn new(
    graph: Arc<ContainerGraph>,
    network: Option<String>,
  ) -> Formation {
    let network =
      network.unwrap_or_else(|| graph.prefix().to_string());
    Formation {
      graph,
      network,
      instances: IndexMap::new(),
    }
  }

  pub fn graph(&self) -> &Arc<ContainerGraph> {
    &self.graph
  }

  pub fn network(&self) -> &str {
    &self.network
  }

  pub fn get(&self, name: &str) -> Option<&ContainerInstance> {
    self.instances.get(name)
  }

  pub fn get_mut(
    &mut self,
    name: &str,
  ) -> Option<&mut ContainerInstance> {
    self.instances.get_mut(name)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.instances.contains_key(name)
  }

  pub fn is_empty(&self) -> bool {
    self.instances.is_empty()
  }

  pub fn len(&self) -> usize {
    self.instances.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &ContainerInstance> {
    self.instances.values()
  }

  pub fn iter_mut(
    &mut self,
  ) -> impl Iterator<Item = &mut ContainerInstance> {
    self.instances.values_mut()
  }

  /// The instance backing the given container, if any.
  pub fn instance_of(&self, container_name: &str) -> Option<&str> {
    self
      .instances
      .values()
      .find(|instance| instance.container.name == container_name)
      .map(|instance| instance.name.as_str())
  }

  /// Inserts an instance, replacing any instance with the same
  /// name.
  pub fn add_instance(&mut self, instance: ContainerInstance) {
    self.instances.insert(instance.name.clone(), instance);
  }

  pub fn remove_instance(
    &mut self,
    name: &str,
  ) -> Option<ContainerInstance> {
    self.instances.shift_remove(name)
  }

  /// Adds a container to run in the formation, together with every
  /// instance needed to satisfy its transitive runtime
  /// dependencies. Existing instances of a dependency are reused.
  /// Returns the name of the created instance.
  pub fn add_container(
    &mut self,
    container: &Arc<Container>,
  ) -> anyhow::Result<String> {
    let graph = self.graph.clone();
    let devmodes =
      graph.options(&container.name).devmodes.clone();
    // The sort also proves there is no dependency cycle. The
    // container itself comes out last.
    let ancestry = dependency_sort(
      std::slice::from_ref(container),
      |c| graph.dependencies(c),
    )?;
    let direct = graph.dependencies(container);
    let mut links = IndexMap::new();
    for dependency in &ancestry[..ancestry.len() - 1] {
      let instance_name =
        match self.instance_of(&dependency.name) {
          Some(name) => name.to_string(),
          None => self.add_container(dependency)?,
        };
      if direct.contains(dependency) {
        links.insert(dependency.name.clone(), instance_name);
      }
    }
    let name =
      format!("{}.{}.1", graph.prefix(), container.name);
    let mut instance =
      ContainerInstance::new(name.clone(), container.clone());
    instance.image = container.image_name.clone();
    instance.image_tag = String::from("latest");
    instance.links = links;
    instance.devmodes = devmodes;
    self.add_instance(instance);
    self
      .get(&name)
      .map(|instance| instance.validate(self))
      .transpose()?;
    Ok(name)
  }

  /// Checks every instance against the graph and the formation's
  /// own contents.
  pub fn validate(&self) -> anyhow::Result<()> {
    for instance in self.instances.values() {
      instance.validate(self)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::graph::tests::{container, graph};

  fn linked_graph() -> Arc<ContainerGraph> {
    graph(vec![
      container("a", &["b"]),
      container("b", &["c"]),
      container("c", &[]),
    ])
  }

  #[test]
  fn add_container_pulls_in_dependencies() {
    let graph = linked_graph();
    let mut formation = Formation::new(graph.clone(), None);
    let a = graph.get("a").unwrap().clone();
    let name = formation.add_container(&a).unwrap();
    assert_eq!(name, "p.a.1");
    assert_eq!(formation.len(), 3);
    assert!(formation.contains("p.b.1"));
    assert!(formation.contains("p.c.1"));
    // Links hold only the direct dependencies.
    let a = formation.get("p.a.1").unwrap();
    assert_eq!(a.links.len(), 1);
    assert_eq!(
      a.links.get("b").map(String::as_str),
      Some("p.b.1")
    );
    let b = formation.get("p.b.1").unwrap();
    assert_eq!(
      b.links.get("c").map(String::as_str),
      Some("p.c.1")
    );
  }

  #[test]
  fn add_container_reuses_existing_instances() {
    let graph = linked_graph();
    let mut formation = Formation::new(graph.clone(), None);
    let b = graph.get("b").unwrap().clone();
    formation.add_container(&b).unwrap();
    assert_eq!(formation.len(), 2);
    let a = graph.get("a").unwrap().clone();
    formation.add_container(&a).unwrap();
    assert_eq!(formation.len(), 3);
  }

  #[test]
  fn network_defaults_to_prefix() {
    let formation = Formation::new(linked_graph(), None);
    assert_eq!(formation.network(), "p");
    let named = Formation::new(
      linked_graph(),
      Some(String::from("custom")),
    );
    assert_eq!(named.network(), "custom");
  }

  #[test]
  fn clone_is_independent() {
    let graph = linked_graph();
    let mut formation = Formation::new(graph.clone(), None);
    let c = graph.get("c").unwrap().clone();
    formation.add_container(&c).unwrap();
    let mut cloned = formation.clone();
    cloned
      .get_mut("p.c.1")
      .unwrap()
      .environment
      .insert(String::from("KEY"), String::from("value"));
    assert!(
      formation
        .get("p.c.1")
        .unwrap()
        .environment
        .is_empty()
    );
  }

  #[test]
  fn equality_is_by_name_only() {
    let graph = linked_graph();
    let c = graph.get("c").unwrap().clone();
    let one = ContainerInstance::new("p.c.1", c.clone());
    let mut two = ContainerInstance::new("p.c.1", c);
    two.image = String::from("elsewhere");
    two.foreground = true;
    assert_eq!(one, two);
    let mut hasher_one =
      std::collections::hash_map::DefaultHasher::new();
    let mut hasher_two =
      std::collections::hash_map::DefaultHasher::new();
    one.hash(&mut hasher_one);
    two.hash(&mut hasher_two);
    assert_eq!(hasher_one.finish(), hasher_two.finish());
  }

  #[test]
  fn drift_detects_each_field() {
    let graph = linked_graph();
    let c = graph.get("c").unwrap().clone();
    let base = {
      let mut instance = ContainerInstance::new("p.c.1", c);
      instance.image = String::from("c");
      instance.image_tag = String::from("latest");
      instance
    };
    assert!(!base.different_from(&base.clone()));

    let mut changed = base.clone();
    changed.image_tag = String::from("v2");
    assert!(base.different_from(&changed));

    let mut changed = base.clone();
    changed
      .links
      .insert(String::from("b"), String::from("p.b.1"));
    assert!(base.different_from(&changed));

    let mut changed = base.clone();
    changed.devmodes.insert(String::from("editable"));
    assert!(base.different_from(&changed));

    let mut changed = base.clone();
    changed.ports.insert(80, Some(8080));
    assert!(base.different_from(&changed));

    let mut changed = base.clone();
    changed
      .environment
      .insert(String::from("DEBUG"), String::from("1"));
    assert!(base.different_from(&changed));

    let mut changed = base.clone();
    changed.command = Some(vec![String::from("/bin/true")]);
    assert!(base.different_from(&changed));

    // Either side being foreground forces a replacement.
    let mut changed = base.clone();
    changed.foreground = true;
    assert!(base.different_from(&changed));
    assert!(changed.different_from(&base));
  }

  #[test]
  fn drift_prefers_image_ids_when_both_present() {
    let graph = linked_graph();
    let c = graph.get("c").unwrap().clone();
    let mut desired = ContainerInstance::new("p.c.1", c.clone());
    desired.image = String::from("c");
    desired.image_tag = String::from("latest");
    desired.image_id = Some(String::from("sha256:aaa"));
    let mut observed = ContainerInstance::new("p.c.1", c);
    observed.image_id = Some(String::from("sha256:aaa"));
    // Observed side has no image name; the matching hashes win.
    assert!(!desired.different_from(&observed));
    observed.image_id = Some(String::from("sha256:bbb"));
    assert!(desired.different_from(&observed));
  }

  #[test]
  fn validate_rejects_illegal_links() {
    let graph = linked_graph();
    let mut formation = Formation::new(graph.clone(), None);
    let a = graph.get("a").unwrap().clone();
    let c = graph.get("c").unwrap().clone();
    formation.add_container(&c).unwrap();
    // a depends only on b, so a link to c is illegal.
    let mut instance = ContainerInstance::new("p.a.1", a);
    instance
      .links
      .insert(String::from("c"), String::from("p.c.1"));
    formation.add_instance(instance);
    let err = formation.validate().unwrap_err();
    assert!(
      err.to_string().contains("not possible to link"),
      "{err}"
    );
  }

  #[test]
  fn validate_rejects_unknown_devmodes() {
    let graph = linked_graph();
    let mut formation = Formation::new(graph.clone(), None);
    let c = graph.get("c").unwrap().clone();
    formation.add_container(&c).unwrap();
    formation
      .get_mut("p.c.1")
      .unwrap()
      .devmodes
      .insert(String::from("ghost"));
    let err = formation.validate().unwrap_err();
    assert!(
      err.to_string().contains("Invalid devmode ghost"),
      "{err}"
    );
  }
}
