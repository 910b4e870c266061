use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, MqttOptions};
use rumqttc::Transport;

use super::Notifier;
use crate::config::MqttConfig;

const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";
const RECONNECT_PAUSE: Duration = Duration::from_secs(2);

/// MQTT v5 notifier.
///
/// Publishing only enqueues into the client's request buffer (`try_publish`);
/// a background thread drives the connection and reconnects on error. The
/// broker publishes `offline` on `<prefix>/status` (retained) if this process
/// disappears without disconnecting.
pub struct MqttNotifier {
    client: Client,
    availability_topic: String,
    closing: Arc<AtomicBool>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttNotifier {
    pub fn connect(config: &MqttConfig) -> Result<Self> {
        let (host, port) = config.broker()?;
        let availability_topic = format!("{}/status", config.topic_prefix.trim_end_matches('/'));

        let mut options = MqttOptions::new(&config.client_id, &host, port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = config.username.as_deref() {
            options.set_credentials(user, config.password.as_deref().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            availability_topic.as_str(),
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        ));
        if config.use_tls() {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, 10);
        let closing = Arc::new(AtomicBool::new(false));
        let handle = spawn_connection_drain(connection, Arc::clone(&closing))?;

        let notifier = Self {
            client,
            availability_topic,
            closing,
            connection_handle: Mutex::new(Some(handle)),
        };
        notifier.publish(
            &notifier.availability_topic,
            PAYLOAD_ONLINE.as_bytes(),
            true,
        )?;
        log::info!(
            "MQTT notifier for {host}:{port} (TLS: {}, auth: {})",
            config.use_tls(),
            config.username.is_some()
        );
        Ok(notifier)
    }

    /// Publish `offline` and request a clean disconnect.
    pub fn disconnect(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.publish(
            &self.availability_topic,
            PAYLOAD_OFFLINE.as_bytes(),
            true,
        ) {
            log::debug!("MQTT offline notice: {err:#}");
        }
        if let Err(err) = self.client.try_disconnect() {
            log::debug!("MQTT disconnect: {err}");
        }
        let handle = self
            .connection_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        // Brokers may hold the socket after DISCONNECT; only join a finished thread.
        if let Some(handle) = handle.filter(|h| h.is_finished()) {
            let _ = handle.join();
        }
    }
}

impl Notifier for MqttNotifier {
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .with_context(|| format!("enqueue MQTT publish to {topic}"))
    }
}

impl Drop for MqttNotifier {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn spawn_connection_drain(
    mut connection: Connection,
    closing: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mqtt-connection".to_string())
        .spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(err) => {
                        if closing.load(Ordering::SeqCst) {
                            break;
                        }
                        log::warn!("MQTT connection error: {err}");
                        std::thread::sleep(RECONNECT_PAUSE);
                    }
                }
            }
        })
        .context("spawn MQTT connection thread")
}
