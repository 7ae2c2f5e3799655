use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use ez1mqtt::targets::mqtt::{mqtt_config::MqttConfig, mqtt_wrapper};
use log::{debug, info, warn};
use rumqttc::{
    tokio_rustls::{self, rustls::ClientConfig},
    Client, Event, Incoming, MqttOptions, Outgoing, Transport,
};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct RumqttcWrapper {
    client: Client,
    status_topic: String,
    closing: Arc<AtomicBool>,
    event_loop: Option<JoinHandle<()>>,
}

/// Takes the connection down at the end of the process.
pub struct ShutdownHandle {
    client: Client,
    status_topic: String,
    closing: Arc<AtomicBool>,
    event_loop: Option<JoinHandle<()>>,
}

impl ShutdownHandle {
    /// Publishes `offline`, disconnects and waits until the queued messages
    /// are flushed or the broker turns out to be unreachable.
    pub fn close(mut self) {
        self.closing.store(true, Ordering::Relaxed);
        if let Err(e) = self.client.try_publish(
            &self.status_topic,
            rumqttc::QoS::AtLeastOnce,
            true,
            "offline",
        ) {
            warn!("could not publish offline state: {e}");
        }
        if let Err(e) = self.client.try_disconnect() {
            warn!("could not disconnect from broker: {e}");
        }
        if let Some(handle) = self.event_loop.take() {
            if handle.join().is_err() {
                warn!("mqtt event loop panicked");
            }
        }
    }
}

impl RumqttcWrapper {
    pub fn shutdown_handle(&mut self) -> ShutdownHandle {
        ShutdownHandle {
            client: self.client.clone(),
            status_topic: self.status_topic.clone(),
            closing: Arc::clone(&self.closing),
            event_loop: self.event_loop.take(),
        }
    }
}

fn match_qos(qos: mqtt_wrapper::QoS) -> rumqttc::QoS {
    match qos {
        mqtt_wrapper::QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        mqtt_wrapper::QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        mqtt_wrapper::QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn tls_transport() -> Transport {
    // Use rustls-native-certs to load root certificates from the operating system.
    let mut roots = tokio_rustls::rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for e in native.errors {
        warn!("could not load platform cert: {e}");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!("loaded {added} platform certs, ignored {ignored}");

    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Transport::tls_with_config(client_config.into())
}

impl mqtt_wrapper::MqttWrapper for RumqttcWrapper {
    fn publish<S, V>(
        &mut self,
        topic: S,
        qos: mqtt_wrapper::QoS,
        retain: bool,
        payload: V,
    ) -> anyhow::Result<()>
    where
        S: Clone + Into<String>,
        V: Clone + Into<Vec<u8>>,
    {
        // never block the poll loop on a full queue while the broker is away
        self.client.try_publish(topic, match_qos(qos), retain, payload)?;
        Ok(())
    }

    fn new(config: &MqttConfig, status_topic: &str) -> Self {
        let mut mqttoptions = MqttOptions::new(&config.client_id, &config.host, config.port());
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if config.use_tls() {
            mqttoptions.set_transport(tls_transport());
        }

        //parse the mqtt authentication options
        if let Some((username, password)) = match (&config.username, &config.password) {
            (None, None) => None,
            (None, Some(_)) => None,
            (Some(username), None) => Some((username.clone(), "".into())),
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
        } {
            mqttoptions.set_credentials(username, password);
        }

        mqttoptions.set_last_will(rumqttc::LastWill::new(
            status_topic,
            "offline",
            rumqttc::QoS::AtLeastOnce,
            true,
        ));

        info!(
            "Connecting to MQTT broker {}:{} as {}",
            config.host,
            config.port(),
            config.client_id
        );
        let (client, mut connection) = Client::new(mqttoptions, 512);
        let closing = Arc::new(AtomicBool::new(false));

        let event_loop = {
            let client = client.clone();
            let status_topic = status_topic.to_string();
            let closing = Arc::clone(&closing);
            thread::spawn(move || {
                // keep polling the event loop to make sure outgoing messages get sent
                // the call to .iter() blocks and suspends the thread effectively by
                // calling .recv() under the hood
                for notification in connection.iter() {
                    match notification {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("Connected to MQTT broker");
                            // birth message, repeated after every reconnect
                            if let Err(e) = client.try_publish(
                                &status_topic,
                                rumqttc::QoS::AtLeastOnce,
                                true,
                                "online",
                            ) {
                                warn!("could not publish online state: {e}");
                            }
                        }
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            if closing.load(Ordering::Relaxed) {
                                break;
                            }
                            warn!("MQTT connection error: {e}");
                            thread::sleep(RECONNECT_DELAY);
                        }
                    }
                }
                debug!("MQTT event loop stopped");
            })
        };

        Self {
            client,
            status_topic: status_topic.to_string(),
            closing,
            event_loop: Some(event_loop),
        }
    }
}
