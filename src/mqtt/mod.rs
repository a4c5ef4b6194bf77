pub mod broker;
pub mod topic;

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{MqttOptions, TlsConfiguration, Transport};

pub use broker::{LocalBroker, MqttBroker, Published, RetainedStore};
pub use topic::{parse_topic, ParsedTopic, TopicKind};

/// Receives every message delivered on a subscribed topic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: &str, payload: &[u8]);
}

/// Options for the plain-TCP connection to the home-automation broker.
pub fn local_options(
    client_id: &str,
    host: &str,
    port: u16,
    credentials: Option<(&str, &str)>,
) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);
    if let Some((user, password)) = credentials {
        options.set_credentials(user, password);
    }
    options
}

/// Options for the mutually-authenticated TLS connection to the cloud IoT
/// endpoint that pushes heater status.
pub fn cloud_options(
    client_id: &str,
    host: &str,
    port: u16,
    ca_path: &Path,
    cert_path: &Path,
    key_path: &Path,
) -> Result<MqttOptions> {
    let read = |path: &Path, what: &str| {
        std::fs::read(path).with_context(|| format!("failed to read {what} {}", path.display()))
    };
    let ca = read(ca_path, "CA certificate")?;
    let cert = read(cert_path, "client certificate")?;
    let key = read(key_path, "client key")?;

    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);
    options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth: Some((cert, key)),
    }));
    Ok(options)
}
