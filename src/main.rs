use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use zwave_bridge::mqtt::mqtt_handler::{Disconnected, GatewaySession, Ready};
use zwave_bridge::{AppConfig, DeviceSelector};

#[derive(Parser, Debug)]
#[command(author, version, about = "Talk to a Z-Wave gateway over its MQTT API")]
struct Cli {
    /// Config file (defaults to <config dir>/zwave-bridge/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// MQTT broker host, overrides the config file
    #[arg(long, global = true, env = "ZWAVE_MQTT_HOST")]
    host: Option<String>,

    /// Gateway topic prefix, overrides the config file
    #[arg(long, global = true, env = "ZWAVE_TOPIC_PREFIX")]
    prefix: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices and their properties
    List {
        /// Also print the values captured in the listing
        #[arg(long)]
        values: bool,
    },
    /// Write a property and wait for the gateway to acknowledge it
    Set {
        /// Device name or numeric node id
        device: String,
        property: String,
        /// JSON value; anything that is not valid JSON is sent as a string
        value: String,
    },
    /// Print value changes until interrupted
    Watch {
        /// Device name or numeric node id
        device: String,
        #[arg(required = true)]
        properties: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();

    let mut config = setup_config(cli.config).await?;
    if let Some(host) = cli.host {
        config.mqtt.host = host;
    }
    if let Some(prefix) = cli.prefix {
        config.gateway.topic_prefix = prefix;
    }

    let session = GatewaySession::<Disconnected>::create(config)
        .connect()
        .await
        .map_err(|e| eyre!("Failed to connect: {}", e))?
        .bootstrap()
        .await
        .map_err(|e| eyre!("Failed to load device directory: {}", e))?;

    let result = match cli.command {
        Command::List { values } => {
            list(&session, values);
            Ok(())
        }
        Command::Set {
            device,
            property,
            value,
        } => set(&session, &device, &property, &value).await,
        Command::Watch { device, properties } => watch(&session, &device, &properties).await,
    };

    session.shutdown().await;
    result
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let directives = std::env::var("RUST_LOG").unwrap_or_default();

    FmtSubscriber::builder()
        .with_env_filter(log_filter(&directives))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Parses `RUST_LOG` style directives such as `zwave_bridge=debug,rumqttc=warn`.
fn log_filter(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|e| {
        eprintln!("Ignoring invalid RUST_LOG {:?}: {}", directives, e);
        EnvFilter::new("info")
    })
}

async fn setup_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let path = match path {
        Some(path) => path,
        None => {
            let path = AppConfig::default_path();
            AppConfig::ensure_default_config(&path).await?;
            path
        }
    };
    debug!("Using config {}", path.display());
    Ok(AppConfig::load(&path).await?)
}

fn selector(device: &str) -> DeviceSelector {
    match device.parse::<u32>() {
        Ok(id) => DeviceSelector::Id(id),
        Err(_) => DeviceSelector::Name(device.to_string()),
    }
}

fn list(session: &GatewaySession<Ready>, values: bool) {
    for summary in session.devices() {
        println!(
            "{:>4}  {:<24} {:<20} {}",
            summary.id,
            summary.name.as_deref().unwrap_or("-"),
            summary.location,
            summary.product
        );

        let Some(device) = session.broker().device(summary.id) else {
            continue;
        };
        for property in device.properties() {
            let access = match (property.readable, property.writeable) {
                (_, true) => "rw",
                (true, false) => "r",
                (false, false) => "-",
            };
            if values {
                let value = property
                    .decode()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|e| format!("<{}>", e));
                println!(
                    "      {:<32} {:<10} {:<3} {}",
                    property.property, property.value_type.as_str(), access, value
                );
            } else {
                println!(
                    "      {:<32} {:<10} {}",
                    property.property, property.value_type.as_str(), access
                );
            }
        }
    }
}

async fn set(
    session: &GatewaySession<Ready>,
    device: &str,
    property: &str,
    value: &str,
) -> Result<()> {
    let value = serde_json::from_str::<serde_json::Value>(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));

    session
        .write_property(selector(device), property, &value)
        .await
        .map_err(|e| eyre!("Failed to set {}.{}: {}", device, property, e))?;

    info!("Set {}.{} to {}", device, property, value);
    Ok(())
}

async fn watch(
    session: &GatewaySession<Ready>,
    device: &str,
    properties: &[String],
) -> Result<()> {
    let buffer = session.config().gateway.watch_buffer.max(1);
    let (tx, mut rx) = mpsc::channel(buffer);

    let mut handles = Vec::with_capacity(properties.len());
    for property in properties {
        let handle = session
            .broker()
            .watch(selector(device), property, tx.clone())
            .map_err(|e| eyre!("Cannot watch {}.{}: {}", device, property, e))?;
        handles.push(handle);
    }
    drop(tx);
    info!("Watching {} properties on {}, Ctrl-C to stop", handles.len(), device);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            update = rx.recv() => match update {
                Some(update) => println!(
                    "{} {}/{} = {}",
                    update.received_at.format("%H:%M:%S%.3f"),
                    update.device_name.as_deref().unwrap_or("-"),
                    update.property,
                    update.value
                ),
                None => {
                    warn!("All watches were dropped");
                    break;
                }
            },
        }
    }

    for handle in &handles {
        handle.cancel();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn log_filter_accepts_per_target_directives() {
        let filter = log_filter("zwave_bridge=debug,rumqttc=warn");
        let rendered = filter.to_string();
        assert!(rendered.contains("zwave_bridge=debug"));
        assert!(rendered.contains("rumqttc=warn"));
    }

    #[test]
    fn invalid_log_filter_falls_back_to_info() {
        let filter = log_filter("zwave_bridge=loud");
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn numeric_device_arguments_are_ids() {
        assert!(matches!(selector("12"), DeviceSelector::Id(12)));
        assert!(matches!(selector("hall"), DeviceSelector::Name(name) if name == "hall"));
    }
}
