use std::{collections::HashSet, sync::Arc};

use tasks::TaskTree;

use super::run_formation;
use crate::{
  app::App,
  config::bay_config,
  docker::{
    Host, images::ImageRepository,
    introspect::FormationIntrospector,
  },
  formation::Formation,
};

async fn introspect_current(
  app: &Arc<App>,
  host: &Arc<Host>,
) -> anyhow::Result<Formation> {
  let images = Arc::new(ImageRepository::new(host.clone()));
  FormationIntrospector::new(
    host.clone(),
    images,
    app.graph.clone(),
    bay_config().network.clone(),
  )
  .introspect()
  .await
}

/// Runs containers by name along with their dependencies. With no
/// names, boots every container marked default_boot.
pub async fn up(
  containers: &[String],
  no_stop: bool,
) -> anyhow::Result<()> {
  let app = App::load()?;
  let host = Arc::new(Host::from_env());
  let mut formation = introspect_current(&app, &host).await?;
  let targets = if containers.is_empty() {
    app
      .graph
      .containers()
      .filter(|container| {
        app.graph.options(&container.name).default_boot
      })
      .cloned()
      .collect()
  } else {
    let mut targets = Vec::new();
    for name in containers {
      targets.push(app.graph.require(name)?.clone());
    }
    targets
  };
  for container in targets {
    formation.add_container(&container)?;
  }
  let tree = TaskTree::new();
  let task = tree.root().subtask("Starting containers");
  run_formation(&app, &host, formation, task, !no_stop).await
}

/// Stops the named containers together with everything that
/// depends on them, or everything on the network when none are
/// named.
pub async fn stop(containers: &[String]) -> anyhow::Result<()> {
  let app = App::load()?;
  let host = Arc::new(Host::from_env());
  let mut formation = introspect_current(&app, &host).await?;
  // A container cannot keep running once a dependency goes away,
  // so the named set is closed over reverse dependency edges.
  let mut targets: HashSet<String> =
    containers.iter().cloned().collect();
  let mut frontier: Vec<String> = containers.to_vec();
  while let Some(name) = frontier.pop() {
    let Some(container) = app.graph.get(&name) else {
      continue;
    };
    for dependent in app.graph.dependents(container) {
      if targets.insert(dependent.name.clone()) {
        frontier.push(dependent.name.clone());
      }
    }
  }
  let obsolete = formation
    .iter()
    .filter(|instance| {
      containers.is_empty()
        || targets.contains(&instance.container.name)
    })
    .map(|instance| instance.name.clone())
    .collect::<Vec<_>>();
  for name in obsolete {
    formation.remove_instance(&name);
  }
  let tree = TaskTree::new();
  let task = tree.root().subtask("Stopping containers");
  run_formation(&app, &host, formation, task, true).await
}

/// Runs a single container in the foreground with bash, attached
/// to the terminal.
pub async fn shell(container: &str) -> anyhow::Result<()> {
  let app = App::load()?;
  let host = Arc::new(Host::from_env());
  let mut formation = introspect_current(&app, &host).await?;
  let container = app.graph.require(container)?.clone();
  let name = formation.add_container(&container)?;
  if let Some(instance) = formation.get_mut(&name) {
    instance.foreground = true;
    instance.command = Some(vec![String::from("/bin/bash")]);
  }
  let tree = TaskTree::new();
  let task = tree
    .root()
    .subtask(format!("Shelling into {}", container.name));
  run_formation(&app, &host, formation, task, true).await
}
