use std::{collections::HashSet, sync::Arc};

use colored::Colorize;
use tasks::{StatusFlavor, TaskTree, Update};

use crate::{
  app::App,
  docker::{Host, images::ImageRepository},
  graph::dependency_sort,
};

/// Pulls registry images for the named containers and their build
/// ancestry, ancestors first. With no names, covers every
/// default_boot container.
pub async fn pull(containers: &[String]) -> anyhow::Result<()> {
  let app = App::load()?;
  let host = Arc::new(Host::from_env());
  let images = ImageRepository::new(host.clone());

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
  let targets = dependency_sort(&targets, |container| {
    app.graph.dependencies(container)
  })?;

  let tree = TaskTree::new();
  let task = tree.root().subtask("Pulling");
  app.plugins.run_pre_group_build(&host, &targets).await?;
  task.add_extra_info(format!(
    "Order: {}",
    targets
      .iter()
      .map(|container| container.name.clone())
      .collect::<Vec<_>>()
      .join(", ")
      .cyan()
  ));

  let mut pulled: HashSet<String> = HashSet::new();
  for container in &targets {
    for ancestor in
      app.graph.build_ancestry(container)?.iter().rev()
    {
      if !pulled.insert(ancestor.name.clone()) {
        continue;
      }
      app.plugins.run_pre_build(&host, ancestor, &task).await?;
      // Base images may not live in the registry; only the
      // requested container itself is pulled strictly.
      let fail_silently = ancestor.name != container.name;
      images
        .pull_image_version(
          &ancestor.image_name,
          "latest",
          Some(&task),
          fail_silently,
        )
        .await?;
      app.plugins.run_post_build(&host, ancestor, &task).await?;
    }
    for (tag, id) in
      images.image_versions(&container.image_name).await
    {
      task.add_extra_info(format!(
        "{} {tag}={}",
        container.image_name,
        super::clamp_sha(&id)
      ));
    }
  }
  task.finish(Update::flavored("Done", StatusFlavor::Good));
  Ok(())
}
