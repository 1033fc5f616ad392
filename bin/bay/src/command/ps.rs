use std::sync::Arc;

use comfy_table::{Attribute, Cell, Table, presets};

use super::clamp_sha;
use crate::{
  app::App,
  config::bay_config,
  docker::{
    Host, images::ImageRepository,
    introspect::FormationIntrospector,
  },
  formation::ContainerInstance,
};

/// Prints the formation currently running on the host, or a single
/// container when one is named.
pub async fn ps(container: Option<&str>) -> anyhow::Result<()> {
  let app = App::load()?;
  let host = Arc::new(Host::from_env());
  let images = Arc::new(ImageRepository::new(host.clone()));
  let introspector = FormationIntrospector::new(
    host.clone(),
    images,
    app.graph.clone(),
    bay_config().network.clone(),
  );

  let instances = match container {
    Some(name) => {
      let container = app.graph.require(name)?;
      let instance_name = format!(
        "{}.{}.1",
        app.graph.prefix(),
        container.name
      );
      vec![
        introspector
          .introspect_single_container(&instance_name)
          .await?,
      ]
    }
    None => {
      let formation = introspector.introspect().await?;
      if formation.is_empty() {
        println!(
          "Nothing running on network {}",
          formation.network()
        );
        return Ok(());
      }
      let mut instances =
        formation.iter().cloned().collect::<Vec<_>>();
      instances.sort_by(|a, b| a.name.cmp(&b.name));
      instances
    }
  };

  let mut table = Table::new();
  table.load_preset(presets::UTF8_HORIZONTAL_ONLY).set_header(
    ["Container", "Instance", "Image", "Address", "Ports"]
      .iter()
      .map(|header| {
        Cell::new(header).add_attribute(Attribute::Bold)
      }),
  );
  for instance in &instances {
    table.add_row(instance_row(&host, instance));
  }
  println!("{table}");
  Ok(())
}

fn instance_row(
  host: &Host,
  instance: &ContainerInstance,
) -> Vec<Cell> {
  let image = match &instance.image_id {
    Some(id) if instance.image.is_empty() => clamp_sha(id),
    _ => format!("{}:{}", instance.image, instance.image_tag),
  };
  // Published ports appear on the host's external address, not the
  // container IP.
  let mut ports = instance
    .port_mapping
    .iter()
    .map(|(private, public)| {
      format!(
        "{}:{public}->{private}",
        host.external_address()
      )
    })
    .collect::<Vec<_>>();
  ports.sort();
  vec![
    Cell::new(&instance.container.name)
      .add_attribute(Attribute::Bold),
    Cell::new(&instance.name),
    Cell::new(image),
    Cell::new(
      instance.ip_address.as_deref().unwrap_or_default(),
    ),
    Cell::new(ports.join(", ")),
  ]
}
