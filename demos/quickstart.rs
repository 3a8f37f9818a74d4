//! Example demonstrating a client kept in sync with a configuration service.
//!
//! The service here is simulated in process, so the example runs offline:
//! the instance API is a small in-memory implementation and the duplex
//! connection uses `MemoryTransport`. Against a real service, drop
//! `with_api`/`with_transport` and set the `CONFSYNC_*` environment variables.

use async_trait::async_trait;
use confsync::api::{CreateInstanceRequest, InstanceApi, InstanceInfo};
use confsync::connection::MemoryTransport;
use confsync::core::RawValueMap;
use confsync::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const TEMPLATE: &str = r#"
version: v1
configuration:
  - id: app
    name: Application
    properties:
      - id: port
        type: number
        default: 3000
      - id: maintenance
        type: boolean
        default: false
      - id: banner
        type: string
        default: Welcome!
"#;

struct DemoService {
    values: Mutex<RawValueMap>,
}

#[async_trait]
impl InstanceApi for DemoService {
    async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<InstanceInfo> {
        println!(
            "  [service] registering {}/{} ({} {})",
            request.application_name, request.environment_name, request.sdk_name, request.sdk_version
        );
        Ok(InstanceInfo {
            id: "inst_demo".into(),
            name: "quickstart-1".into(),
            url: "https://dashboard.example.com/instances/inst_demo".into(),
        })
    }

    async fn get_instance_configuration(&self, _instance_id: &str) -> Result<RawValueMap> {
        Ok(self.values.lock().clone())
    }

    async fn send_heartbeat(&self, instance_id: &str) -> Result<()> {
        println!("  [service] heartbeat from {instance_id}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== confsync Quickstart ===\n");

    let service = Arc::new(DemoService {
        values: Mutex::new(RawValueMap::from([("app.port".into(), "8080".into())])),
    });
    let transport = MemoryTransport::new();

    let settings = ClientSettings::builder()
        .with_access_token("demo-token")
        .with_application_name("quickstart")
        .with_environment_name("development")
        .with_api_base_url("https://api.example.com")
        .with_websocket_base_url("wss://ws.example.com")
        .with_tag("team", "platform")
        .build()?;

    let client = Client::builder()
        .with_template_yaml(TEMPLATE)
        .with_settings(settings)
        .with_api(service.clone())
        .with_transport(Arc::new(transport.clone()))
        .build()?;

    println!("Before connecting (template defaults):");
    print_config(&client);

    let _handle = client.on_config_update(|update| {
        println!("\nConfig update #{}:", update.version);
        for (id, change) in &update.changes {
            println!("  {id}: {} -> {}", change.old_value, change.new_value);
        }
    });

    client.connect().await?;
    println!(
        "\n✓ Connected as {} ({})",
        client.instance_name().unwrap_or_default(),
        client.instance_url().unwrap_or_default()
    );

    // The service changes a value and announces it over the connection.
    {
        let mut values = service.values.lock();
        values.insert("app.maintenance".into(), "true".into());
        values.insert("app.banner".into(), "Back soon".into());
    }
    if let Some(peer) = transport.accept().await {
        peer.push(
            r#"{"kind":"command_execution","instanceId":"inst_demo",
                "command":{"kind":"config_update","details":{}}}"#,
        );
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("\nAfter the pushed update:");
    print_config(&client);

    client.disconnect().await;
    println!("\n✓ Disconnected; last values stay readable");
    print_config(&client);

    Ok(())
}

fn print_config(client: &Client) {
    for (id, value) in client.config() {
        println!("  {id} = {value}");
    }
}
