use std::sync::Arc;

use futures::future::BoxFuture;
use strum::Display;
use tasks::Task;

use crate::{
  docker::Host,
  formation::ContainerInstance,
  graph::Container,
  plugins::waits::{WaitCatalog, WaitsPlugin},
};

pub mod waits;

/// The closed set of lifecycle extension points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum PluginHook {
  PreBuild,
  PostBuild,
  PreStart,
  PostStart,
  PreGroupBuild,
  DockerFail,
}

/// Context for the pre-start and post-start hooks.
#[derive(Clone, Copy)]
pub struct StartHooks<'a> {
  pub host: &'a Host,
  pub instance: &'a ContainerInstance,
  pub task: &'a Task,
  pub waits: &'a WaitCatalog,
}

/// Context for the pre-build and post-build hooks.
#[derive(Clone, Copy)]
pub struct BuildHooks<'a> {
  pub host: &'a Host,
  pub container: &'a Arc<Container>,
  pub task: &'a Task,
}

/// Context for the pre-group-build hook.
#[derive(Clone, Copy)]
pub struct GroupBuildHooks<'a> {
  pub host: &'a Host,
  pub containers: &'a [Arc<Container>],
}

/// Context for the docker-fail hook.
#[derive(Clone, Copy)]
pub struct FailHooks<'a> {
  pub error: &'a anyhow::Error,
}

/// A lifecycle plugin. Each hook has a fixed, typed contract; the
/// default for every hook is a no-op, so plugins implement only
/// the points they care about.
pub trait Plugin: Send + Sync {
  fn name(&self) -> &'static str;

  fn pre_start<'a>(
    &'a self,
    _hooks: StartHooks<'a>,
  ) -> BoxFuture<'a, anyhow::Result<()>> {
    Box::pin(async { Ok(()) })
  }

  fn post_start<'a>(
    &'a self,
    _hooks: StartHooks<'a>,
  ) -> BoxFuture<'a, anyhow::Result<()>> {
    Box::pin(async { Ok(()) })
  }

  fn pre_build<'a>(
    &'a self,
    _hooks: BuildHooks<'a>,
  ) -> BoxFuture<'a, anyhow::Result<()>> {
    Box::pin(async { Ok(()) })
  }

  fn post_build<'a>(
    &'a self,
    _hooks: BuildHooks<'a>,
  ) -> BoxFuture<'a, anyhow::Result<()>> {
    Box::pin(async { Ok(()) })
  }

  fn pre_group_build<'a>(
    &'a self,
    _hooks: GroupBuildHooks<'a>,
  ) -> BoxFuture<'a, anyhow::Result<()>> {
    Box::pin(async { Ok(()) })
  }

  fn docker_fail<'a>(
    &'a self,
    _hooks: FailHooks<'a>,
  ) -> BoxFuture<'a, anyhow::Result<()>> {
    Box::pin(async { Ok(()) })
  }
}

/// Fires hooks on every registered plugin in registration order,
/// and owns the wait-type catalog the waits plugin resolves
/// against. A hook error aborts the remaining handlers and
/// propagates to the caller, except docker-fail, which is
/// best-effort on an already failing path.
pub struct PluginHost {
  plugins: Vec<Arc<dyn Plugin>>,
  waits: WaitCatalog,
}

impl PluginHost {
  pub fn new() -> PluginHost {
    PluginHost {
      plugins: Vec::new(),
      waits: WaitCatalog::standard(),
    }
  }

  /// The host with the stock plugin set registered.
  pub fn standard() -> PluginHost {
    let mut host = PluginHost::new();
    host.register(Arc::new(WaitsPlugin));
    host
  }

  pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
    debug!("registering plugin {}", plugin.name());
    self.plugins.push(plugin);
  }

  pub async fn run_pre_start(
    &self,
    host: &Host,
    instance: &ContainerInstance,
    task: &Task,
  ) -> anyhow::Result<()> {
    let hooks = StartHooks {
      host,
      instance,
      task,
      waits: &self.waits,
    };
    trace!("running {} hooks", PluginHook::PreStart);
    for plugin in &self.plugins {
      plugin.pre_start(hooks).await?;
    }
    Ok(())
  }

  pub async fn run_post_start(
    &self,
    host: &Host,
    instance: &ContainerInstance,
    task: &Task,
  ) -> anyhow::Result<()> {
    let hooks = StartHooks {
      host,
      instance,
      task,
      waits: &self.waits,
    };
    trace!("running {} hooks", PluginHook::PostStart);
    for plugin in &self.plugins {
      plugin.post_start(hooks).await?;
    }
    Ok(())
  }

  pub async fn run_pre_build(
    &self,
    host: &Host,
    container: &Arc<Container>,
    task: &Task,
  ) -> anyhow::Result<()> {
    let hooks = BuildHooks {
      host,
      container,
      task,
    };
    trace!("running {} hooks", PluginHook::PreBuild);
    for plugin in &self.plugins {
      plugin.pre_build(hooks).await?;
    }
    Ok(())
  }

  pub async fn run_post_build(
    &self,
    host: &Host,
    container: &Arc<Container>,
    task: &Task,
  ) -> anyhow::Result<()> {
    let hooks = BuildHooks {
      host,
      container,
      task,
    };
    trace!("running {} hooks", PluginHook::PostBuild);
    for plugin in &self.plugins {
      plugin.post_build(hooks).await?;
    }
    Ok(())
  }

  pub async fn run_pre_group_build(
    &self,
    host: &Host,
    containers: &[Arc<Container>],
  ) -> anyhow::Result<()> {
    let hooks = GroupBuildHooks { host, containers };
    trace!("running {} hooks", PluginHook::PreGroupBuild);
    for plugin in &self.plugins {
      plugin.pre_group_build(hooks).await?;
    }
    Ok(())
  }

  pub async fn run_docker_fail(&self, error: &anyhow::Error) {
    trace!("running {} hooks", PluginHook::DockerFail);
    let hooks = FailHooks { error };
    for plugin in &self.plugins {
      if let Err(e) = plugin.docker_fail(hooks).await {
        warn!(
          "docker-fail handler of {} failed: {e:#}",
          plugin.name()
        );
      }
    }
  }
}

impl Default for PluginHost {
  fn default() -> PluginHost {
    PluginHost::standard()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hook_names_are_kebab_case() {
    assert_eq!(PluginHook::PreStart.to_string(), "pre-start");
    assert_eq!(
      PluginHook::PreGroupBuild.to_string(),
      "pre-group-build"
    );
    assert_eq!(
      PluginHook::DockerFail.to_string(),
      "docker-fail"
    );
  }
}
