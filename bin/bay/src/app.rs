use std::sync::Arc;

use crate::{
  config::bay_config, graph::ContainerGraph, plugins::PluginHost,
};

/// The application handle threaded through commands and the
/// reconciler: the loaded container catalog plus the plugin host.
pub struct App {
  pub graph: Arc<ContainerGraph>,
  pub plugins: PluginHost,
}

impl App {
  pub fn load() -> anyhow::Result<Arc<App>> {
    let config = bay_config();
    let graph = ContainerGraph::load(
      &config.catalog_dir,
      config.prefix.clone(),
    )?;
    Ok(Arc::new(App {
      graph: Arc::new(graph),
      plugins: PluginHost::standard(),
    }))
  }
}
