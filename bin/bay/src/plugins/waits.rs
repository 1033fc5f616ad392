use std::time::Duration;

use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::Deserialize;
use tasks::{StatusFlavor, Update};

use super::{Plugin, StartHooks};
use crate::{error::BayError, formation::ContainerInstance};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Registry of wait variants by type tag. Owned by the plugin
/// host; the waits plugin resolves the catalog's `waits` entries
/// against it.
pub struct WaitCatalog {
  factories: IndexMap<String, WaitFactory>,
}

type WaitFactory = fn(
  serde_json::Value,
  &ContainerInstance,
) -> anyhow::Result<Wait>;

impl WaitCatalog {
  /// The catalog with the standard variants registered.
  pub fn standard() -> WaitCatalog {
    let mut catalog = WaitCatalog {
      factories: IndexMap::new(),
    };
    catalog.register("http", |params, instance| {
      Ok(Wait::Http(HttpWait::new(params, instance, false)?))
    });
    catalog.register("https", |params, instance| {
      Ok(Wait::Http(HttpWait::new(params, instance, true)?))
    });
    catalog.register("tcp", |params, instance| {
      Ok(Wait::Tcp(TcpWait::new(params, instance)?))
    });
    catalog.register("time", |params, _instance| {
      Ok(Wait::Time(TimeWait::new(params)?))
    });
    catalog
  }

  pub fn register(
    &mut self,
    kind: impl Into<String>,
    factory: WaitFactory,
  ) {
    self.factories.insert(kind.into(), factory);
  }

  pub fn get(&self, kind: &str) -> Option<&WaitFactory> {
    self.factories.get(kind)
  }
}

/// One readiness probe bound to a running instance.
#[derive(Debug)]
pub enum Wait {
  Http(HttpWait),
  Tcp(TcpWait),
  Time(TimeWait),
}

impl Wait {
  pub async fn ready(&self) -> bool {
    match self {
      Wait::Http(wait) => wait.ready().await,
      Wait::Tcp(wait) => wait.ready().await,
      Wait::Time(wait) => wait.ready(),
    }
  }

  pub fn description(&self) -> String {
    match self {
      Wait::Http(wait) => wait.description(),
      Wait::Tcp(wait) => wait.description(),
      Wait::Time(wait) => wait.description(),
    }
  }
}

fn bad_params(
  kind: &str,
  e: impl std::fmt::Display,
) -> BayError {
  BayError::bad_config(format!("Invalid {kind} wait params | {e}"))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpParams {
  port: Option<u16>,
  #[serde(default = "default_path")]
  path: String,
  #[serde(default = "default_timeout")]
  timeout: f64,
  #[serde(default = "default_method")]
  method: String,
  #[serde(default)]
  headers: IndexMap<String, String>,
  expected_codes: Option<Vec<u16>>,
}

fn default_path() -> String {
  String::from("/")
}

fn default_timeout() -> f64 {
  1.0
}

fn default_method() -> String {
  String::from("GET")
}

/// Issues a request against the instance's address and checks the
/// response code. Any connection or protocol error is simply "not
/// ready yet".
#[derive(Debug)]
pub struct HttpWait {
  https: bool,
  address: String,
  port: u16,
  path: String,
  timeout: Duration,
  method: reqwest::Method,
  headers: IndexMap<String, String>,
  expected_codes: Option<Vec<u16>>,
}

impl HttpWait {
  fn new(
    params: serde_json::Value,
    instance: &ContainerInstance,
    https: bool,
  ) -> anyhow::Result<HttpWait> {
    let kind = if https { "https" } else { "http" };
    let params: HttpParams = serde_json::from_value(params)
      .map_err(|e| bad_params(kind, e))?;
    let method = reqwest::Method::from_bytes(
      params.method.as_bytes(),
    )
    .map_err(|e| bad_params(kind, e))?;
    Ok(HttpWait {
      https,
      address: instance
        .ip_address
        .clone()
        .unwrap_or_default(),
      port: params
        .port
        .unwrap_or(if https { 443 } else { 80 }),
      path: params.path,
      timeout: Duration::from_secs_f64(params.timeout),
      method,
      headers: params.headers,
      expected_codes: params.expected_codes,
    })
  }

  async fn ready(&self) -> bool {
    let scheme = if self.https { "https" } else { "http" };
    let url = format!(
      "{scheme}://{}:{}{}",
      self.address, self.port, self.path
    );
    let client = match reqwest::Client::builder()
      .timeout(self.timeout)
      // Containers carry self-signed certs more often than not.
      .danger_accept_invalid_certs(true)
      .build()
    {
      Ok(client) => client,
      Err(_) => return false,
    };
    let mut request =
      client.request(self.method.clone(), url);
    for (name, value) in &self.headers {
      request = request.header(name, value);
    }
    match request.send().await {
      Ok(response) => {
        self.code_expected(response.status().as_u16())
      }
      Err(_) => false,
    }
  }

  fn code_expected(&self, code: u16) -> bool {
    match &self.expected_codes {
      Some(codes) => codes.contains(&code),
      None => (200..400).contains(&code),
    }
  }

  fn description(&self) -> String {
    if self.https {
      format!("HTTPS on port {}", self.port)
    } else {
      format!("HTTP on port {}", self.port)
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TcpParams {
  #[serde(default = "default_tcp_port")]
  port: u16,
  #[serde(default = "default_timeout")]
  timeout: f64,
}

fn default_tcp_port() -> u16 {
  80
}

/// Checks that a TCP port accepts connections.
#[derive(Debug)]
pub struct TcpWait {
  address: String,
  port: u16,
  timeout: Duration,
}

impl TcpWait {
  fn new(
    params: serde_json::Value,
    instance: &ContainerInstance,
  ) -> anyhow::Result<TcpWait> {
    let params: TcpParams = serde_json::from_value(params)
      .map_err(|e| bad_params("tcp", e))?;
    Ok(TcpWait {
      address: instance
        .ip_address
        .clone()
        .unwrap_or_default(),
      port: params.port,
      timeout: Duration::from_secs_f64(params.timeout),
    })
  }

  async fn ready(&self) -> bool {
    tokio::time::timeout(
      self.timeout,
      tokio::net::TcpStream::connect((
        self.address.as_str(),
        self.port,
      )),
    )
    .await
    .map(|connection| connection.is_ok())
    .unwrap_or_default()
  }

  fn description(&self) -> String {
    format!("TCP on port {}", self.port)
  }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimeParams {
  seconds: f64,
}

/// Ready once a fixed delay after construction has elapsed.
#[derive(Debug)]
pub struct TimeWait {
  seconds: f64,
  deadline: tokio::time::Instant,
}

impl TimeWait {
  fn new(params: serde_json::Value) -> anyhow::Result<TimeWait> {
    let params: TimeParams = serde_json::from_value(params)
      .map_err(|e| bad_params("time", e))?;
    Ok(TimeWait {
      seconds: params.seconds,
      deadline: tokio::time::Instant::now()
        + Duration::from_secs_f64(params.seconds),
    })
  }

  fn ready(&self) -> bool {
    tokio::time::Instant::now() >= self.deadline
  }

  fn description(&self) -> String {
    format!("{} seconds", self.seconds)
  }
}

/// Runs every wait declared on a started container's catalog entry
/// until all pass, failing fast if the container dies underneath
/// them.
pub struct WaitsPlugin;

impl Plugin for WaitsPlugin {
  fn name(&self) -> &'static str {
    "waits"
  }

  fn post_start<'a>(
    &'a self,
    hooks: StartHooks<'a>,
  ) -> BoxFuture<'a, anyhow::Result<()>> {
    Box::pin(async move {
      let mut waiting = Vec::new();
      for spec in &hooks.instance.container.waits {
        let factory =
          hooks.waits.get(&spec.kind).ok_or_else(|| {
            BayError::runtime(format!(
              "Unknown wait type {} for {}",
              spec.kind, hooks.instance.container.name
            ))
          })?;
        let wait = factory(spec.params.clone(), hooks.instance)?;
        let task = hooks.task.subtask(format!(
          "Waiting for {}",
          wait.description()
        ));
        waiting.push((wait, task));
      }
      while !waiting.is_empty() {
        if !hooks
          .host
          .container_running(&hooks.instance.name)
          .await?
        {
          hooks.task.update(Update::flavored(
            "Dead",
            StatusFlavor::Bad,
          ));
          return Err(
            BayError::runtime(format!(
              "Container {} died while waiting for boot completion",
              hooks.instance.container.name
            ))
            .into(),
          );
        }
        hooks.task.update(Update::status("Waiting"));
        let mut still_waiting = Vec::new();
        for (wait, task) in waiting {
          if wait.ready().await {
            task.finish(Update::flavored(
              "Done",
              StatusFlavor::Good,
            ));
          } else {
            still_waiting.push((wait, task));
          }
        }
        waiting = still_waiting;
        if waiting.is_empty() {
          break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
      }
      Ok(())
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::graph::tests::{container, graph};
  use serde_json::json;

  fn instance_with_ip() -> ContainerInstance {
    let graph = graph(vec![container("web", &[])]);
    let container = graph.get("web").unwrap().clone();
    let mut instance =
      ContainerInstance::new("p.web.1", container);
    instance.ip_address = Some(String::from("172.18.0.2"));
    instance
  }

  #[test]
  fn catalog_knows_the_standard_variants() {
    let catalog = WaitCatalog::standard();
    for kind in ["http", "https", "tcp", "time"] {
      assert!(catalog.get(kind).is_some(), "missing {kind}");
    }
    assert!(catalog.get("carrier-pigeon").is_none());
  }

  #[test]
  fn http_defaults() {
    let instance = instance_with_ip();
    let factory =
      *WaitCatalog::standard().get("http").unwrap();
    let Wait::Http(wait) =
      factory(json!({}), &instance).unwrap()
    else {
      panic!("expected an http wait");
    };
    assert_eq!(wait.port, 80);
    assert_eq!(wait.path, "/");
    assert_eq!(wait.method, reqwest::Method::GET);
    assert_eq!(wait.timeout, Duration::from_secs(1));
    assert_eq!(wait.description(), "HTTP on port 80");
    // Default window is 200..400.
    assert!(wait.code_expected(200));
    assert!(wait.code_expected(302));
    assert!(!wait.code_expected(400));
    assert!(!wait.code_expected(500));
  }

  #[test]
  fn https_defaults_to_port_443() {
    let instance = instance_with_ip();
    let factory =
      *WaitCatalog::standard().get("https").unwrap();
    let Wait::Http(wait) =
      factory(json!({}), &instance).unwrap()
    else {
      panic!("expected an https wait");
    };
    assert_eq!(wait.port, 443);
    assert_eq!(wait.description(), "HTTPS on port 443");
  }

  #[test]
  fn explicit_expected_codes_win() {
    let instance = instance_with_ip();
    let factory =
      *WaitCatalog::standard().get("http").unwrap();
    let Wait::Http(wait) = factory(
      json!({"expected_codes": [418]}),
      &instance,
    )
    .unwrap() else {
      panic!("expected an http wait");
    };
    assert!(wait.code_expected(418));
    assert!(!wait.code_expected(200));
  }

  #[test]
  fn bad_params_are_bad_config() {
    let instance = instance_with_ip();
    let factory =
      *WaitCatalog::standard().get("tcp").unwrap();
    let err = factory(json!({"port": "not-a-port"}), &instance)
      .unwrap_err();
    let err = err.downcast::<BayError>().unwrap();
    assert!(matches!(err, BayError::BadConfig(_)));
  }

  #[tokio::test(start_paused = true)]
  async fn time_wait_becomes_ready_after_elapsing() {
    let factory =
      *WaitCatalog::standard().get("time").unwrap();
    let instance = instance_with_ip();
    let wait =
      factory(json!({"seconds": 5}), &instance).unwrap();
    assert!(!wait.ready().await);
    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(wait.ready().await);
    assert_eq!(wait.description(), "5 seconds");
  }

  #[tokio::test]
  async fn tcp_wait_refused_connection_is_not_ready() {
    let graph = graph(vec![container("db", &[])]);
    let container = graph.get("db").unwrap().clone();
    let mut instance =
      ContainerInstance::new("p.db.1", container);
    instance.ip_address = Some(String::from("127.0.0.1"));
    let factory =
      *WaitCatalog::standard().get("tcp").unwrap();
    let wait = factory(
      // Reserved port that nothing listens on.
      json!({"port": 1, "timeout": 0.2}),
      &instance,
    )
    .unwrap();
    assert!(!wait.ready().await);
  }

  #[tokio::test]
  async fn tcp_wait_open_port_is_ready() {
    let listener =
      tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();
    let graph = graph(vec![container("db", &[])]);
    let db = graph.get("db").unwrap().clone();
    let mut instance = ContainerInstance::new("p.db.1", db);
    instance.ip_address = Some(String::from("127.0.0.1"));
    let factory =
      *WaitCatalog::standard().get("tcp").unwrap();
    let wait =
      factory(json!({"port": port}), &instance).unwrap();
    assert!(wait.ready().await);
  }
}
