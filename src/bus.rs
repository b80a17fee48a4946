use std::sync::Arc;

use async_nats::{Client, ConnectOptions, Event, Subscriber};
use futures::StreamExt;
use thiserror::Error;

use crate::config::BusConfig;
use crate::registry::{Registry, ScrapeTarget};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no bus servers configured")]
    NoServers,
    #[error("load bus tls config failed, {0}")]
    Tls(#[source] std::io::Error),
    #[error("connect to {servers} failed, {err}")]
    Connect {
        servers: String,
        #[source]
        err: async_nats::ConnectError,
    },
    #[error("subscribe to {topic} failed, {err}")]
    Subscribe {
        topic: String,
        #[source]
        err: async_nats::SubscribeError,
    },
}

/// Comma separated `nats://host:port` list for every configured host.
pub fn server_urls(config: &BusConfig) -> String {
    config
        .hosts
        .iter()
        .map(|host| format!("nats://{}:{}", host, config.port))
        .collect::<Vec<_>>()
        .join(",")
}

fn connect_options(config: &BusConfig) -> Result<ConnectOptions, BusError> {
    let reconnect_delay = config.reconnect_delay;

    let mut options = match &config.password {
        Some(password) => {
            ConnectOptions::with_user_and_password(config.user.clone(), password.clone())
        }
        None => ConnectOptions::new(),
    }
    .name(env!("CARGO_PKG_NAME"))
    .ping_interval(config.ping_interval)
    .max_reconnects(None::<usize>)
    .reconnect_delay_callback(move |_attempts| reconnect_delay)
    .event_callback(|event| async move {
        match event {
            Event::Connected => info!(message = "Bus connected"),
            Event::Disconnected => warn!(message = "Bus disconnected, reconnecting"),
            Event::Closed => warn!(message = "Bus connection closed"),
            event => warn!(message = "Bus event", %event),
        }
    });

    if let Some(tls) = &config.tls {
        options = options.require_tls(true);

        if let Some(ca_file) = &tls.ca_file {
            options = options.add_root_certificates(ca_file.clone());
        }

        match (&tls.cert_file, &tls.key_file) {
            (Some(cert), Some(key)) => {
                options = options.add_client_certificate(cert.clone(), key.clone());
            }
            (None, None) => {}
            _ => {
                return Err(BusError::Tls(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "both cert_file and key_file are required for client authentication",
                )));
            }
        }
    }

    Ok(options)
}

/// Connect to the bus. Failing here is fatal, while later disconnects are
/// retried forever by the client.
pub async fn connect(config: &BusConfig) -> Result<Client, BusError> {
    if config.hosts.is_empty() {
        return Err(BusError::NoServers);
    }

    let servers = server_urls(config);
    let options = connect_options(config)?;

    options
        .connect(servers.as_str())
        .await
        .map_err(|err| BusError::Connect { servers, err })
}

pub async fn subscribe(client: &Client, topic: &str) -> Result<Subscriber, BusError> {
    client
        .subscribe(topic.to_string())
        .await
        .map_err(|err| BusError::Subscribe {
            topic: topic.to_string(),
            err,
        })
}

/// Decode one announcement and store it. A malformed payload never reaches
/// the registry.
pub fn handle_message(registry: &Registry, payload: &[u8]) -> Result<(), serde_yaml::Error> {
    let target = serde_yaml::from_slice::<ScrapeTarget>(payload)?;

    debug!(
        message = "Scrape target received",
        source = %target.source,
        targets = target.targets.len(),
    );

    registry.upsert(target);

    Ok(())
}

/// Feed every message of `subscriber` into the registry until the
/// subscription ends. Termination is logged only, cached targets keep being
/// served until they age out.
pub async fn run(mut subscriber: Subscriber, registry: Arc<Registry>) {
    while let Some(message) = subscriber.next().await {
        if let Err(err) = handle_message(&registry, &message.payload) {
            warn!(
                message = "Drop malformed scrape target",
                subject = %message.subject,
                %err,
            );
        }
    }

    warn!(message = "Subscription closed, no more scrape targets will be received");
}
