use std::{
  collections::{HashMap, HashSet},
  path::Path,
  sync::Arc,
  time::Duration,
};

use anyhow::Context;
use bollard::query_parameters::{
  CreateContainerOptions, InspectContainerOptions,
  InspectNetworkOptions, RemoveContainerOptions,
  StartContainerOptions, StopContainerOptions,
};
use bollard::secret::{
  ContainerCreateBody, EndpointSettings, HostConfig,
  NetworkCreateRequest, NetworkingConfig, PortBinding,
};
use tasks::{StatusFlavor, Task, Update};
use tokio::task::JoinSet;

use super::{
  CONTAINER_LABEL, Host,
  attach::AttachHandler,
  images::ImageRepository,
  introspect::FormationIntrospector,
  towline::{BootStatus, Towline},
};
use crate::{
  app::App,
  error::BayError,
  formation::{ContainerInstance, Formation},
};

/// Serialises check-then-create on networks so parallel starts
/// cannot race a duplicate create.
static NETWORK_LOCK: tokio::sync::Mutex<()> =
  tokio::sync::Mutex::const_new(());

const REAP_INTERVAL: Duration = Duration::from_millis(100);
const TOWLINE_INTERVAL: Duration = Duration::from_millis(500);
/// Starts tolerate some idle time before declaring deadlock, since
/// image pulls can delay the first progress. Stops do not.
const START_IDLE_LIMIT: u32 = 10;

/// How a start worker ended.
pub enum StartOutcome {
  Completed,
  /// The instance is a foreground session; the driver must run the
  /// handler on the main task and exit.
  Interactive(AttachHandler),
}

/// Takes a [Formation] to aim for and a host to run it on, and
/// brings the two in line by stopping, starting and configuring
/// containers, in parallel where links allow it.
pub struct FormationRunner {
  app: Arc<App>,
  host: Arc<Host>,
  images: Arc<ImageRepository>,
  formation: Formation,
  task: Task,
  stop: bool,
}

impl FormationRunner {
  pub fn new(
    app: Arc<App>,
    host: Arc<Host>,
    formation: Formation,
    task: Task,
  ) -> FormationRunner {
    let images = Arc::new(ImageRepository::new(host.clone()));
    FormationRunner {
      app,
      host,
      images,
      formation,
      task,
      stop: true,
    }
  }

  /// When false, existing instances the formation no longer wants
  /// are left alone.
  pub fn with_stop(mut self, stop: bool) -> FormationRunner {
    self.stop = stop;
    self
  }

  fn introspector(&self) -> FormationIntrospector {
    FormationIntrospector::new(
      self.host.clone(),
      self.images.clone(),
      self.formation.graph().clone(),
      Some(self.formation.network().to_string()),
    )
  }

  /// Runs through and performs all the actions. Blocks until the
  /// formation converges or a worker fails.
  #[instrument(skip(self), fields(network = %self.formation.network()))]
  pub async fn run(&self) -> anyhow::Result<()> {
    self.formation.validate()?;
    let current = self.introspector().introspect().await?;
    // Resolve desired image hashes where possible so drift
    // comparison sees the same identity introspection reports.
    let mut desired = self.formation.clone();
    for instance in desired.iter_mut() {
      if instance.image_id.is_none()
        && !instance.image.is_empty()
        && let Ok(id) = self
          .images
          .image_version(&instance.image, &instance.image_tag)
          .await
      {
        instance.image_id = Some(id);
      }
    }
    let changes = compute_changes(&desired, &current);
    debug!(
      "desired {} instances, currently running {}, stopping {}, starting {}",
      desired.len(),
      current.len(),
      changes.to_stop.len(),
      changes.to_start.len(),
    );
    if !changes.to_stop.is_empty() && self.stop {
      self.stop_containers(&current, changes.to_stop).await?;
    }
    if !changes.to_start.is_empty() {
      self.start_containers(&desired, changes.to_start).await?;
    }
    Ok(())
  }

  /// Stops the named instances in parallel, respecting links: an
  /// instance is stopped only once nothing that links to it is
  /// still running or pending stop.
  async fn stop_containers(
    &self,
    current: &Formation,
    names: Vec<String>,
  ) -> anyhow::Result<()> {
    let incoming = incoming_links(current, &names);
    let mut to_stop: Vec<String> = names;
    let mut stopping: HashSet<String> = HashSet::new();
    let mut workers: JoinSet<(String, anyhow::Result<()>)> =
      JoinSet::new();
    loop {
      let eligible = to_stop
        .iter()
        .filter(|name| {
          stop_eligible(name, &incoming, &to_stop, &stopping)
        })
        .cloned()
        .collect::<Vec<_>>();
      for name in eligible {
        to_stop.retain(|pending| pending != &name);
        stopping.insert(name.clone());
        let host = self.host.clone();
        let parent = self.task.clone();
        workers.spawn(async move {
          let result =
            stop_container(host, parent, &name).await;
          (name, result)
        });
      }
      if to_stop.is_empty() && stopping.is_empty() {
        return Ok(());
      }
      // Nothing in flight and nothing eligible: deadlocked.
      if stopping.is_empty() {
        return Err(
          BayError::runtime(format!(
            "Deadlock during stop: Cannot stop any of {}",
            to_stop.join(", ")
          ))
          .into(),
        );
      }
      tokio::select! {
        joined = workers.join_next(), if !workers.is_empty() => {
          if let Some(joined) = joined {
            let (name, result) =
              joined.context("Stop worker panicked")?;
            stopping.remove(&name);
            result?;
          }
        }
        _ = tokio::time::sleep(REAP_INTERVAL) => {}
      }
    }
  }

  /// Starts the named instances in parallel, respecting links: an
  /// instance starts only once every link target has fully
  /// started, including its post-start waits.
  async fn start_containers(
    &self,
    desired: &Formation,
    names: Vec<String>,
  ) -> anyhow::Result<()> {
    // Fresh introspection: anything live after the stop phase
    // already satisfies dependencies.
    let live = self.introspector().introspect().await?;
    let mut started: HashSet<String> =
      live.iter().map(|instance| instance.name.clone()).collect();
    let mut to_start: Vec<String> = names;
    let mut starting: HashSet<String> = HashSet::new();
    let mut idle_iterations: u32 = 0;
    let mut workers: JoinSet<(
      String,
      anyhow::Result<StartOutcome>,
    )> = JoinSet::new();
    loop {
      let eligible = to_start
        .iter()
        .filter(|name| {
          desired
            .get(name)
            .map(|instance| {
              start_eligible(instance, &started)
            })
            .unwrap_or_default()
        })
        .cloned()
        .collect::<Vec<_>>();
      for name in eligible {
        to_start.retain(|pending| pending != &name);
        starting.insert(name.clone());
        idle_iterations = 0;
        let context = StartContext {
          app: self.app.clone(),
          host: self.host.clone(),
          images: self.images.clone(),
          network: self.formation.network().to_string(),
          parent: self.task.clone(),
        };
        let Some(instance) = desired.get(&name).cloned() else {
          continue;
        };
        workers.spawn(async move {
          let result = start_container(context, instance).await;
          (name, result)
        });
      }
      if to_start.is_empty() && starting.is_empty() {
        return Ok(());
      }
      if idle_iterations > START_IDLE_LIMIT
        && starting.is_empty()
      {
        return Err(
          BayError::runtime(format!(
            "Deadlock during start: Cannot start any of {}",
            to_start.join(", ")
          ))
          .into(),
        );
      }
      tokio::select! {
        joined = workers.join_next(), if !workers.is_empty() => {
          if let Some(joined) = joined {
            let (name, result) =
              joined.context("Start worker panicked")?;
            starting.remove(&name);
            idle_iterations = 0;
            match result? {
              StartOutcome::Completed => {
                started.insert(name);
              }
              StartOutcome::Interactive(handler) => {
                // Foreground sessions take over the terminal on
                // the driving task, then the process is done.
                handler.run().await?;
                std::process::exit(0);
              }
            }
          }
        }
        _ = tokio::time::sleep(REAP_INTERVAL) => {
          idle_iterations += 1;
        }
      }
    }
  }
}

/// The stop-set and start-set needed to bring `current` in line
/// with `desired`. Drifted instances appear in both.
pub(crate) struct Changes {
  pub to_stop: Vec<String>,
  pub to_start: Vec<String>,
}

pub(crate) fn compute_changes(
  desired: &Formation,
  current: &Formation,
) -> Changes {
  let mut to_stop = Vec::new();
  let mut to_start = Vec::new();
  for instance in current.iter() {
    if !desired.contains(&instance.name) {
      to_stop.push(instance.name.clone());
    }
  }
  for instance in desired.iter() {
    match current.get(&instance.name) {
      None => to_start.push(instance.name.clone()),
      Some(existing) => {
        if instance.different_from(existing) {
          to_stop.push(instance.name.clone());
          to_start.push(instance.name.clone());
        }
      }
    }
  }
  Changes { to_stop, to_start }
}

/// For each instance to stop, the set of current instances whose
/// links point at it.
pub(crate) fn incoming_links(
  current: &Formation,
  names: &[String],
) -> HashMap<String, HashSet<String>> {
  let mut incoming: HashMap<String, HashSet<String>> = names
    .iter()
    .map(|name| (name.clone(), HashSet::new()))
    .collect();
  for linker in current.iter() {
    for target in linker.links.values() {
      if let Some(linkers) = incoming.get_mut(target) {
        linkers.insert(linker.name.clone());
      }
    }
  }
  incoming
}

/// An instance may stop once none of its incoming linkers is still
/// pending stop or mid-stop.
pub(crate) fn stop_eligible(
  name: &str,
  incoming: &HashMap<String, HashSet<String>>,
  to_stop: &[String],
  stopping: &HashSet<String>,
) -> bool {
  incoming
    .get(name)
    .map(|linkers| {
      linkers.iter().all(|linker| {
        !to_stop.contains(linker) && !stopping.contains(linker)
      })
    })
    .unwrap_or(true)
}

/// An instance may start once every one of its link targets has
/// started.
pub(crate) fn start_eligible(
  instance: &ContainerInstance,
  started: &HashSet<String>,
) -> bool {
  instance
    .links
    .values()
    .all(|target| started.contains(target))
}

async fn stop_container(
  host: Arc<Host>,
  parent: Task,
  name: &str,
) -> anyhow::Result<()> {
  let task = parent.subtask(format!("Stopping {name}"));
  host
    .docker()?
    .stop_container(name, Option::<StopContainerOptions>::None)
    .await
    .with_context(|| format!("Failed to stop container {name}"))?;
  task.finish(Update::flavored("Done", StatusFlavor::Good));
  Ok(())
}

#[derive(Clone)]
struct StartContext {
  app: Arc<App>,
  host: Arc<Host>,
  images: Arc<ImageRepository>,
  network: String,
  parent: Task,
}

/// Removes a leftover stopped container with the instance's name.
/// A running one is an error: the diff said it should not exist.
async fn remove_stopped(
  host: &Host,
  instance: &ContainerInstance,
) -> anyhow::Result<()> {
  if !host.container_exists(&instance.name).await {
    return Ok(());
  }
  if host.container_running(&instance.name).await? {
    return Err(
      BayError::runtime(format!(
        "The container {} is already running.",
        instance.container.name
      ))
      .into(),
    );
  }
  host
    .docker()?
    .remove_container(
      &instance.name,
      Option::<RemoveContainerOptions>::None,
    )
    .await
    .with_context(|| {
      format!("Failed to remove container {}", instance.name)
    })?;
  Ok(())
}

/// Ensures the formation network exists, creating it with the
/// bridge driver when missing.
async fn ensure_network(
  host: &Host,
  network: &str,
) -> anyhow::Result<()> {
  let _guard = NETWORK_LOCK.lock().await;
  let docker = host.docker()?;
  match docker
    .inspect_network(
      network,
      Option::<InspectNetworkOptions>::None,
    )
    .await
  {
    Ok(_) => Ok(()),
    Err(bollard::errors::Error::DockerResponseServerError {
      status_code: 404,
      ..
    }) => {
      docker
        .create_network(NetworkCreateRequest {
          name: network.to_string(),
          driver: Some(String::from("bridge")),
          ..Default::default()
        })
        .await
        .with_context(|| {
          format!("Failed to create network {network}")
        })?;
      Ok(())
    }
    Err(e) => Err(e).with_context(|| {
      format!("Failed to inspect network {network}")
    }),
  }
}

/// Bind mounts for the instance: declared bound and named volumes
/// plus every mount of every enabled devmode.
fn build_binds(
  instance: &ContainerInstance,
) -> anyhow::Result<(Vec<String>, Vec<String>)> {
  let container = &instance.container;
  let mut mountpoints = Vec::new();
  let mut binds = Vec::new();
  for (mount_path, source) in &container.bound_volumes {
    if !Path::new(source).is_dir() {
      return Err(
        BayError::runtime(format!(
          "Volume mount source directory {source} does not exist"
        ))
        .into(),
      );
    }
    mountpoints.push(mount_path.clone());
    binds.push(format!("{source}:{mount_path}:rw"));
  }
  for (mount_path, volume) in &container.named_volumes {
    mountpoints.push(mount_path.clone());
    binds.push(format!("{volume}:{mount_path}:rw"));
  }
  for devmode in &instance.devmodes {
    let Some(mounts) = container.devmodes.get(devmode) else {
      continue;
    };
    for (mount_path, source) in mounts {
      mountpoints.push(mount_path.clone());
      let mut source = source.clone();
      if let Some(pattern) = &container.git_volume_pattern
        && let Some(captures) = pattern.captures(&source)
        && let Some(checkout) = captures.get(1)
      {
        source = std::path::absolute(format!(
          "../{}/",
          checkout.as_str()
        ))
        .context("Failed to resolve devmode checkout path")?
        .to_string_lossy()
        .into_owned();
      }
      if !Path::new(&source).exists() {
        return Err(
          BayError::NotFound(format!(
            "The source path {source} does not exist"
          ))
          .into(),
        );
      }
      binds.push(format!("{source}:{mount_path}:rw"));
    }
  }
  Ok((mountpoints, binds))
}

#[instrument(
  skip(context, instance),
  fields(instance = %instance.name)
)]
async fn start_container(
  context: StartContext,
  mut instance: ContainerInstance,
) -> anyhow::Result<StartOutcome> {
  let StartContext {
    app,
    host,
    images,
    network,
    parent,
  } = context;
  let task =
    parent.subtask(format!("Starting {}", instance.name));

  remove_stopped(&host, &instance).await?;

  app
    .plugins
    .run_pre_start(&host, &instance, &task)
    .await?;

  ensure_network(&host, &network).await?;

  // Join the formation network with the network name as alias,
  // and the instance's links as legacy container links.
  let endpoint = EndpointSettings {
    aliases: Some(vec![network.clone()]),
    links: Some(
      instance
        .links
        .iter()
        .map(|(alias, target)| format!("{target}:{alias}"))
        .collect(),
    ),
    ..Default::default()
  };

  let (mountpoints, binds) = build_binds(&instance)?;

  let image_id = match images
    .image_version(&instance.image, &instance.image_tag)
    .await
  {
    Ok(id) => id,
    // Attach the owning container for use further up.
    Err(e) => {
      return Err(match e.downcast::<BayError>() {
        Ok(BayError::ImageNotFound {
          image, image_tag, ..
        }) => BayError::ImageNotFound {
          image,
          image_tag,
          container: Some(instance.container.name.clone()),
        }
        .into(),
        Ok(other) => other.into(),
        Err(e) => e,
      });
    }
  };

  let body = ContainerCreateBody {
    image: Some(image_id),
    cmd: instance.command.clone(),
    attach_stdin: Some(instance.foreground),
    open_stdin: Some(instance.foreground),
    tty: Some(instance.foreground),
    exposed_ports: Some(
      instance
        .ports
        .keys()
        .map(|port| (format!("{port}/tcp"), HashMap::new()))
        .collect(),
    ),
    env: Some(
      instance
        .environment
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect(),
    ),
    volumes: Some(
      mountpoints
        .into_iter()
        .map(|mountpoint| (mountpoint, HashMap::new()))
        .collect(),
    ),
    labels: Some(HashMap::from([(
      CONTAINER_LABEL.to_string(),
      instance.container.name.clone(),
    )])),
    host_config: Some(HostConfig {
      binds: Some(binds),
      port_bindings: Some(
        instance
          .ports
          .iter()
          .map(|(container_port, host_port)| {
            (
              format!("{container_port}/tcp"),
              host_port.map(|host_port| {
                vec![PortBinding {
                  host_ip: None,
                  host_port: Some(host_port.to_string()),
                }]
              }),
            )
          })
          .collect(),
      ),
      publish_all_ports: Some(true),
      security_opt: Some(vec![String::from(
        "seccomp:unconfined",
      )]),
      ..Default::default()
    }),
    networking_config: Some(NetworkingConfig {
      endpoints_config: Some(HashMap::from([(
        network.clone(),
        endpoint,
      )])),
    }),
    ..Default::default()
  };

  let docker = host.docker()?;
  docker
    .create_container(
      Some(CreateContainerOptions {
        name: Some(instance.name.clone()),
        ..Default::default()
      }),
      body,
    )
    .await
    .with_context(|| {
      format!("Failed to create container {}", instance.name)
    })?;

  // Foreground containers hand the terminal over on the driving
  // task rather than starting detached here.
  if instance.foreground {
    task.finish(Update::flavored(
      "Going to shell",
      StatusFlavor::Good,
    ));
    return Ok(StartOutcome::Interactive(AttachHandler::new(
      host.clone(),
      instance.name.clone(),
    )));
  }

  docker
    .start_container(
      &instance.name,
      Option::<StartContainerOptions>::None,
    )
    .await
    .with_context(|| {
      format!("Failed to start container {}", instance.name)
    })?;

  let towline = Towline::new(host.clone(), &instance.name);
  loop {
    match towline.status().await? {
      BootStatus::Pending(message) => {
        if let Some(message) = message {
          task.update(Update::status(message));
        }
      }
      BootStatus::Ready => break,
      BootStatus::Failed(_) => {
        return Err(
          BayError::boot_fail(
            format!(
              "Container {} failed to boot!",
              instance.container.name
            ),
            instance.container.name.clone(),
          )
          .into(),
        );
      }
    }
    tokio::time::sleep(TOWLINE_INTERVAL).await;
  }

  // The IP is needed by post-start readiness probes.
  let details = docker
    .inspect_container(
      &instance.name,
      Option::<InspectContainerOptions>::None,
    )
    .await
    .with_context(|| {
      format!("Failed to inspect container {}", instance.name)
    })?;
  instance.ip_address = details
    .network_settings
    .and_then(|settings| settings.networks)
    .and_then(|mut networks| networks.remove(&network))
    .and_then(|endpoint| endpoint.ip_address);

  app
    .plugins
    .run_post_start(&host, &instance, &task)
    .await?;

  task.finish(Update::flavored("Done", StatusFlavor::Good));
  Ok(StartOutcome::Completed)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::graph::tests::{container, graph};

  fn formation_with(
    names: &[&str],
  ) -> (Formation, Arc<crate::graph::ContainerGraph>) {
    let graph = graph(vec![
      container("a", &["b"]),
      container("b", &[]),
      container("c", &[]),
    ]);
    let mut formation =
      Formation::new(graph.clone(), None);
    for name in names {
      let container = graph.get(name).unwrap().clone();
      formation.add_container(&container).unwrap();
    }
    (formation, graph)
  }

  #[test]
  fn changes_cover_new_obsolete_and_drifted() {
    let (desired, graph) = formation_with(&["a"]);
    let (mut current, _) = formation_with(&["b"]);
    let c = graph.get("c").unwrap().clone();
    current.add_container(&c).unwrap();
    // Drift b by pinning a different tag on the current side.
    current.get_mut("p.b.1").unwrap().image_tag =
      String::from("v1");
    current.get_mut("p.b.1").unwrap().image =
      String::from("b");
    let changes = compute_changes(&desired, &current);
    let mut to_stop = changes.to_stop.clone();
    to_stop.sort();
    assert_eq!(to_stop, vec!["p.b.1", "p.c.1"]);
    let mut to_start = changes.to_start.clone();
    to_start.sort();
    assert_eq!(to_start, vec!["p.a.1", "p.b.1"]);
  }

  #[test]
  fn changes_empty_when_converged() {
    let (desired, _) = formation_with(&["a"]);
    let current = desired.clone();
    let changes = compute_changes(&desired, &current);
    assert!(changes.to_stop.is_empty());
    assert!(changes.to_start.is_empty());
  }

  #[test]
  fn stop_waits_for_incoming_linkers() {
    let (current, _) = formation_with(&["a"]);
    let names = vec![
      String::from("p.a.1"),
      String::from("p.b.1"),
    ];
    let incoming = incoming_links(&current, &names);
    assert!(
      incoming["p.b.1"].contains("p.a.1"),
      "a links to b, so a is an incoming linker of b"
    );
    let to_stop = names.clone();
    let stopping = HashSet::new();
    // b cannot stop while a is still pending.
    assert!(!stop_eligible(
      "p.b.1", &incoming, &to_stop, &stopping
    ));
    assert!(stop_eligible(
      "p.a.1", &incoming, &to_stop, &stopping
    ));
    // Once a has fully stopped, b becomes eligible.
    let to_stop = vec![String::from("p.b.1")];
    assert!(stop_eligible(
      "p.b.1", &incoming, &to_stop, &stopping
    ));
    // But not while a is still mid-stop.
    let stopping =
      HashSet::from([String::from("p.a.1")]);
    assert!(!stop_eligible(
      "p.b.1", &incoming, &to_stop, &stopping
    ));
  }

  #[test]
  fn start_waits_for_link_targets() {
    let (desired, _) = formation_with(&["a"]);
    let a = desired.get("p.a.1").unwrap();
    let mut started = HashSet::new();
    assert!(!start_eligible(a, &started));
    started.insert(String::from("p.b.1"));
    assert!(start_eligible(a, &started));
    let b = desired.get("p.b.1").unwrap();
    assert!(start_eligible(b, &HashSet::new()));
  }
}
