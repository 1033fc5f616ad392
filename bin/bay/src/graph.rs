use std::{
  collections::{BTreeSet, HashMap, HashSet},
  path::Path,
  sync::{Arc, OnceLock},
};

use anyhow::Context;
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;

use crate::error::BayError;

/// One readiness probe declaration on a container. `params` is
/// forwarded verbatim to the wait variant constructor.
#[derive(Debug, Clone, Deserialize)]
pub struct WaitSpec {
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(default = "empty_params")]
  pub params: serde_json::Value,
}

fn empty_params() -> serde_json::Value {
  serde_json::Value::Object(Default::default())
}

/// A catalog entry: what a container is, what it links to at
/// runtime, what it was built from, and what it mounts. Immutable
/// for the life of a run.
#[derive(Debug)]
pub struct Container {
  pub name: String,
  pub image_name: String,
  /// Direct runtime dependencies, by container name.
  pub dependencies: Vec<String>,
  pub build_parent: Option<String>,
  /// Container port to default host port. `None` publishes on a
  /// daemon-assigned port.
  pub ports: IndexMap<u16, Option<u16>>,
  /// Container path to host source path.
  pub bound_volumes: IndexMap<String, String>,
  /// Container path to named volume.
  pub named_volumes: IndexMap<String, String>,
  /// Devmode name to its mount map (container path to source).
  pub devmodes: IndexMap<String, IndexMap<String, String>>,
  pub waits: Vec<WaitSpec>,
  /// Devmode sources matching this are rewritten to a sibling
  /// checkout directory named by the first capture group.
  pub git_volume_pattern: Option<Regex>,
}

impl PartialEq for Container {
  fn eq(&self, other: &Container) -> bool {
    self.name == other.name
  }
}

impl Eq for Container {}

/// Per-container runtime options from the catalog.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerOptions {
  #[serde(default)]
  pub default_boot: bool,
  /// Devmodes currently enabled on the container.
  #[serde(default)]
  pub devmodes: BTreeSet<String>,
}

fn default_options() -> &'static ContainerOptions {
  static DEFAULT: OnceLock<ContainerOptions> = OnceLock::new();
  DEFAULT.get_or_init(Default::default)
}

/// Read-only query surface over the container catalog. Acyclic
/// along both runtime-dependency and build-parent edges.
#[derive(Debug)]
pub struct ContainerGraph {
  prefix: String,
  containers: IndexMap<String, Arc<Container>>,
  options: HashMap<String, ContainerOptions>,
}

impl ContainerGraph {
  pub fn new(
    prefix: impl Into<String>,
    containers: Vec<Container>,
    options: HashMap<String, ContainerOptions>,
  ) -> anyhow::Result<ContainerGraph> {
    let graph = ContainerGraph {
      prefix: prefix.into(),
      containers: containers
        .into_iter()
        .map(|container| (container.name.clone(), Arc::new(container)))
        .collect(),
      options,
    };
    for container in graph.containers.values() {
      for dependency in &container.dependencies {
        if !graph.containers.contains_key(dependency) {
          return Err(
            BayError::bad_config(format!(
              "Container {} links to unknown container {dependency}",
              container.name
            ))
            .into(),
          );
        }
      }
      if let Some(parent) = &container.build_parent
        && !graph.containers.contains_key(parent)
      {
        return Err(
          BayError::bad_config(format!(
            "Container {} is built from unknown container {parent}",
            container.name
          ))
          .into(),
        );
      }
    }
    // Surface cycles at load time rather than mid-reconcile.
    let all = graph.containers.values().cloned().collect::<Vec<_>>();
    dependency_sort(&all, |container| graph.dependencies(container))?;
    for container in graph.containers.values() {
      graph.build_ancestry(container)?;
    }
    Ok(graph)
  }

  /// Loads a catalog from a directory of `<name>/bay.yaml`
  /// container definitions.
  pub fn load(
    dir: &Path,
    prefix: impl Into<String>,
  ) -> anyhow::Result<ContainerGraph> {
    let mut containers = Vec::new();
    let mut options = HashMap::new();
    let entries = std::fs::read_dir(dir).with_context(|| {
      format!("Failed to read container catalog at {dir:?}")
    })?;
    let mut paths = entries
      .filter_map(|entry| Some(entry.ok()?.path()))
      .filter(|path| path.join("bay.yaml").is_file())
      .collect::<Vec<_>>();
    paths.sort();
    for path in paths {
      let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| {
          format!("Failed to get directory name for {path:?}")
        })?;
      let file = path.join("bay.yaml");
      let contents =
        std::fs::read_to_string(&file).with_context(|| {
          format!("Failed to read container definition at {file:?}")
        })?;
      let definition =
        serde_yaml_ng::from_str::<ContainerFile>(&contents)
          .map_err(|e| {
            BayError::bad_config(format!(
              "Invalid container definition at {file:?} | {e}"
            ))
          })?;
      let (container, container_options) =
        definition.into_container(name)?;
      options.insert(container.name.clone(), container_options);
      containers.push(container);
    }
    ContainerGraph::new(prefix, containers, options)
  }

  pub fn prefix(&self) -> &str {
    &self.prefix
  }

  pub fn get(&self, name: &str) -> Option<&Arc<Container>> {
    self.containers.get(name)
  }

  pub fn require(
    &self,
    name: &str,
  ) -> anyhow::Result<&Arc<Container>> {
    self.containers.get(name).ok_or_else(|| {
      BayError::bad_config(format!("Unknown container {name}"))
        .into()
    })
  }

  pub fn containers(
    &self,
  ) -> impl Iterator<Item = &Arc<Container>> {
    self.containers.values()
  }

  /// Direct runtime dependencies.
  pub fn dependencies(
    &self,
    container: &Container,
  ) -> Vec<Arc<Container>> {
    container
      .dependencies
      .iter()
      .filter_map(|name| self.containers.get(name).cloned())
      .collect()
  }

  /// Containers that directly depend on this one at runtime.
  pub fn dependents(
    &self,
    container: &Container,
  ) -> Vec<Arc<Container>> {
    self
      .containers
      .values()
      .filter(|other| {
        other.dependencies.iter().any(|dep| dep == &container.name)
      })
      .cloned()
      .collect()
  }

  pub fn build_parent(
    &self,
    container: &Container,
  ) -> Option<Arc<Container>> {
    container
      .build_parent
      .as_ref()
      .and_then(|name| self.containers.get(name).cloned())
  }

  /// The build chain starting at the container and walking up to
  /// the root ancestor.
  pub fn build_ancestry(
    &self,
    container: &Container,
  ) -> anyhow::Result<Vec<Arc<Container>>> {
    let mut seen = HashSet::new();
    let mut ancestry = Vec::new();
    let mut current = self
      .containers
      .get(&container.name)
      .cloned();
    while let Some(container) = current {
      if !seen.insert(container.name.clone()) {
        return Err(
          BayError::bad_config(format!(
            "Build ancestry cycle involving {}",
            container.name
          ))
          .into(),
        );
      }
      current = self.build_parent(&container);
      ancestry.push(container);
    }
    Ok(ancestry)
  }

  pub fn options(&self, container_name: &str) -> &ContainerOptions {
    self
      .options
      .get(container_name)
      .unwrap_or_else(|| default_options())
  }
}

/// Topologically sorts the given containers and everything
/// reachable through `edges`, dependencies first, roots last. Fails
/// with BadConfig on a cycle.
pub fn dependency_sort(
  containers: &[Arc<Container>],
  edges: impl Fn(&Container) -> Vec<Arc<Container>>,
) -> anyhow::Result<Vec<Arc<Container>>> {
  #[derive(PartialEq)]
  enum Mark {
    InProgress,
    Done,
  }
  fn visit(
    container: &Arc<Container>,
    edges: &impl Fn(&Container) -> Vec<Arc<Container>>,
    marks: &mut HashMap<String, Mark>,
    sorted: &mut Vec<Arc<Container>>,
  ) -> anyhow::Result<()> {
    match marks.get(&container.name) {
      Some(Mark::Done) => return Ok(()),
      Some(Mark::InProgress) => {
        return Err(
          BayError::bad_config(format!(
            "Dependency cycle involving {}",
            container.name
          ))
          .into(),
        );
      }
      None => {}
    }
    marks.insert(container.name.clone(), Mark::InProgress);
    for dependency in edges(container) {
      visit(&dependency, edges, marks, sorted)?;
    }
    marks.insert(container.name.clone(), Mark::Done);
    sorted.push(container.clone());
    Ok(())
  }
  let mut marks = HashMap::new();
  let mut sorted = Vec::new();
  for container in containers {
    visit(container, &edges, &mut marks, &mut sorted)?;
  }
  Ok(sorted)
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ContainerFile {
  image: Option<String>,
  #[serde(default)]
  links: Vec<String>,
  #[serde(default)]
  build: BuildSection,
  #[serde(default)]
  ports: IndexMap<u16, Option<u16>>,
  #[serde(default)]
  volumes: VolumesSection,
  #[serde(default)]
  devmodes: IndexMap<String, IndexMap<String, String>>,
  #[serde(default)]
  waits: Vec<WaitSpec>,
  git_pattern: Option<String>,
  #[serde(default)]
  options: ContainerOptions,
}

#[derive(Debug, Default, Deserialize)]
struct BuildSection {
  parent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VolumesSection {
  #[serde(default)]
  bound: IndexMap<String, String>,
  #[serde(default)]
  named: IndexMap<String, String>,
}

impl ContainerFile {
  fn into_container(
    self,
    name: String,
  ) -> anyhow::Result<(Container, ContainerOptions)> {
    let git_volume_pattern = self
      .git_pattern
      .map(|pattern| {
        Regex::new(&pattern).map_err(|e| {
          BayError::bad_config(format!(
            "Invalid git_pattern on container {name} | {e}"
          ))
        })
      })
      .transpose()?;
    let container = Container {
      image_name: self.image.unwrap_or_else(|| name.clone()),
      name,
      dependencies: self.links,
      build_parent: self.build.parent,
      ports: self.ports,
      bound_volumes: self.volumes.bound,
      named_volumes: self.volumes.named,
      devmodes: self.devmodes,
      waits: self.waits,
      git_volume_pattern,
    };
    Ok((container, self.options))
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  pub(crate) fn container(
    name: &str,
    dependencies: &[&str],
  ) -> Container {
    Container {
      name: name.to_string(),
      image_name: name.to_string(),
      dependencies: dependencies
        .iter()
        .map(|dep| dep.to_string())
        .collect(),
      build_parent: None,
      ports: Default::default(),
      bound_volumes: Default::default(),
      named_volumes: Default::default(),
      devmodes: Default::default(),
      waits: Vec::new(),
      git_volume_pattern: None,
    }
  }

  pub(crate) fn graph(
    containers: Vec<Container>,
  ) -> Arc<ContainerGraph> {
    Arc::new(
      ContainerGraph::new("p", containers, Default::default())
        .unwrap(),
    )
  }

  #[test]
  fn sort_puts_dependencies_first() {
    let graph = graph(vec![
      container("a", &["b", "c"]),
      container("b", &["c"]),
      container("c", &[]),
    ]);
    let a = graph.get("a").unwrap().clone();
    let sorted =
      dependency_sort(&[a], |c| graph.dependencies(c)).unwrap();
    let names = sorted
      .iter()
      .map(|c| c.name.as_str())
      .collect::<Vec<_>>();
    assert_eq!(names, vec!["c", "b", "a"]);
  }

  #[test]
  fn sort_detects_cycles() {
    let containers = vec![
      container("a", &["b"]),
      container("b", &["a"]),
    ];
    let err =
      ContainerGraph::new("p", containers, Default::default())
        .unwrap_err();
    let err = err.downcast::<BayError>().unwrap();
    assert!(matches!(err, BayError::BadConfig(_)));
  }

  #[test]
  fn unknown_link_is_bad_config() {
    let err = ContainerGraph::new(
      "p",
      vec![container("a", &["ghost"])],
      Default::default(),
    )
    .unwrap_err();
    assert!(
      err.to_string().contains("unknown container ghost"),
      "{err}"
    );
  }

  #[test]
  fn build_ancestry_walks_to_root() {
    let mut base = container("base", &[]);
    let mut middle = container("middle", &[]);
    middle.build_parent = Some(String::from("base"));
    let mut app = container("app", &[]);
    app.build_parent = Some(String::from("middle"));
    base.build_parent = None;
    let graph = graph(vec![base, middle, app]);
    let app = graph.get("app").unwrap().clone();
    let ancestry = graph.build_ancestry(&app).unwrap();
    let names = ancestry
      .iter()
      .map(|c| c.name.as_str())
      .collect::<Vec<_>>();
    assert_eq!(names, vec!["app", "middle", "base"]);
  }

  #[test]
  fn dependents_are_reverse_edges() {
    let graph = graph(vec![
      container("a", &["c"]),
      container("b", &["c"]),
      container("c", &[]),
    ]);
    let c = graph.get("c").unwrap();
    let mut dependents = graph
      .dependents(c)
      .iter()
      .map(|c| c.name.clone())
      .collect::<Vec<_>>();
    dependents.sort();
    assert_eq!(dependents, vec!["a", "b"]);
  }

  #[test]
  fn load_reads_catalog_directory() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("db");
    std::fs::create_dir(&db).unwrap();
    std::fs::write(
      db.join("bay.yaml"),
      "image: postgres\nports:\n  5432: 5432\nwaits:\n  - type: tcp\n    params:\n      port: 5432\n",
    )
    .unwrap();
    let web = dir.path().join("web");
    std::fs::create_dir(&web).unwrap();
    std::fs::write(
      web.join("bay.yaml"),
      "links: [db]\noptions:\n  default_boot: true\n",
    )
    .unwrap();
    let graph = ContainerGraph::load(dir.path(), "p").unwrap();
    let web = graph.get("web").unwrap();
    assert_eq!(web.image_name, "web");
    assert_eq!(web.dependencies, vec!["db"]);
    assert!(graph.options("web").default_boot);
    let db = graph.get("db").unwrap();
    assert_eq!(db.image_name, "postgres");
    assert_eq!(db.ports.get(&5432), Some(&Some(5432)));
    assert_eq!(db.waits[0].kind, "tcp");
    assert_eq!(db.waits[0].params["port"], 5432);
  }
}
