//! inspection_bridge - Subscribe to per-camera inspection events and emit finished batches.
//!
//! This bridge:
//! 1. Subscribes to the inspection topic on an MQTT broker
//! 2. Feeds every camera event into the batch engine
//! 3. Keeps a bounded history of finalized batches
//! 4. Writes each finalized batch as one JSON line to stdout
//!
//! Stations publish one message per camera per cycle with no end-of-batch marker;
//! the engine closes a batch once its cameras go quiet for the debounce window.

use anyhow::{anyhow, Result};
use clap::Parser;
use rumqttc::v5::{mqttbytes::QoS, Event, Incoming};
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use inspection_batcher::transport::{decode_payload, MqttEndpoint, MqttSession, TlsMaterials};
use inspection_batcher::{AggregatorConfig, BatchEngine, BatchHistory, EventIngestor, FinalizedBatch};

const BRIDGE_NAME: &str = "inspection_bridge";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Aggregate per-camera inspection events from MQTT into batches"
)]
struct Args {
    /// MQTT broker address.
    /// By default, only loopback addresses are allowed.
    #[arg(long, env = "MQTT_BROKER_ADDR", default_value = "127.0.0.1:1883")]
    mqtt_broker_addr: String,

    /// Allow non-loopback MQTT connections (line controller on another host).
    #[arg(long, env = "ALLOW_REMOTE_MQTT")]
    allow_remote_mqtt: bool,

    /// MQTT username for authentication.
    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// MQTT password for authentication.
    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// Enable TLS for MQTT (required for mqtts:// brokers).
    #[arg(long, env = "MQTT_USE_TLS")]
    mqtt_use_tls: bool,

    /// Path to a PEM-encoded CA certificate to trust for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CA_PATH")]
    mqtt_tls_ca_path: Option<PathBuf>,

    /// Path to a PEM-encoded client certificate for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_CERT_PATH")]
    mqtt_tls_client_cert_path: Option<PathBuf>,

    /// Path to a PEM-encoded client private key for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_KEY_PATH")]
    mqtt_tls_client_key_path: Option<PathBuf>,

    /// Topic filter carrying per-camera inspection events.
    #[arg(long, env = "INSPECTION_MQTT_TOPIC", default_value = "inspection/events")]
    topic: String,

    /// MQTT client identifier.
    #[arg(long, env = "MQTT_CLIENT_ID", default_value = BRIDGE_NAME)]
    mqtt_client_id: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = AggregatorConfig::load()?;

    let endpoint = MqttEndpoint::parse(&args.mqtt_broker_addr, args.mqtt_use_tls)?;
    if !args.allow_remote_mqtt {
        endpoint.require_loopback()?;
    } else {
        log::warn!("Remote MQTT enabled - ensure broker is in a trusted network");
    }
    let tls = TlsMaterials::load(
        args.mqtt_tls_ca_path.as_deref(),
        args.mqtt_tls_client_cert_path.as_deref(),
        args.mqtt_tls_client_key_path.as_deref(),
    )?;
    let session = MqttSession {
        endpoint,
        tls,
        client_id: args.mqtt_client_id.clone(),
        username: args.mqtt_username.clone(),
        password: args.mqtt_password.clone(),
    };

    log::info!("Inspection bridge starting");
    log::info!(
        "  MQTT broker: {}:{} (TLS: {})",
        session.endpoint.host,
        session.endpoint.port,
        session.endpoint.use_tls
    );
    log::info!("  Topic: {}", args.topic);
    log::info!("  Debounce: {} ms", cfg.debounce_window.as_millis());
    log::info!("  History capacity: {}", cfg.history_capacity);

    let history_capacity = cfg.history_capacity;
    let (engine, batches) = BatchEngine::new(cfg).spawn_with_channel()?;
    let publisher = std::thread::spawn(move || publish_batches(batches, history_capacity));

    let ingestor = engine.ingestor();
    let topic = args.topic.clone();
    std::thread::Builder::new()
        .name("mqtt-subscriber".to_string())
        .spawn(move || subscribe_loop(&session, &topic, &ingestor))?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let _ = rx.recv();
    log::info!("shutdown signal received, flushing open batches...");
    engine.stop()?;
    publisher
        .join()
        .map_err(|_| anyhow!("batch publisher thread panicked"))??;
    Ok(())
}

fn subscribe_loop(session: &MqttSession, topic: &str, ingestor: &EventIngestor) {
    loop {
        if let Err(e) = run_session(session, topic, ingestor) {
            log::error!("MQTT session failed: {}. Reconnecting...", e);
        } else {
            log::warn!("MQTT connection closed. Reconnecting...");
        }
        std::thread::sleep(RECONNECT_DELAY);
    }
}

fn run_session(session: &MqttSession, topic: &str, ingestor: &EventIngestor) -> Result<()> {
    let (client, mut connection) = session.connect()?;
    client.subscribe(topic, QoS::AtMostOnce)?;
    log::info!("Subscribed to {}", topic);

    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let events = match decode_payload(&publish.payload) {
                    Ok(events) => events,
                    Err(e) => {
                        log::warn!(
                            "Skipping malformed payload on {}: {}",
                            String::from_utf8_lossy(&publish.topic),
                            e
                        );
                        continue;
                    }
                };
                for event in events {
                    ingestor.ingest(event)?;
                }
            }
            Ok(_) => {}
            Err(e) => return Err(anyhow!("MQTT connection error: {}", e)),
        }
    }
    Ok(())
}

fn publish_batches(batches: Receiver<FinalizedBatch>, capacity: usize) -> Result<()> {
    let mut history = BatchHistory::new(capacity);
    let stdout = std::io::stdout();
    for batch in batches {
        let line = serde_json::to_string(&batch)?;
        {
            let mut out = stdout.lock();
            writeln!(out, "{}", line)?;
            out.flush()?;
        }
        log::info!(
            "Batch {}: {} ({} camera(s), {} fail)",
            batch.id,
            batch.overall_status,
            batch.total_inputs,
            batch.fail_count()
        );
        if let Some(evicted) = history.push(batch) {
            log::debug!("History full, evicted batch {}", evicted.id);
        }
    }
    log::info!("Batch stream closed ({} batch(es) in history)", history.len());
    Ok(())
}
