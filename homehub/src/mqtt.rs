use crate::config::Config;
use crate::envelope::SUBSCRIPTIONS;
use crate::errors::{Error, Result};
use crate::ledger::CommandPublisher;
use crate::metrics::{CHANNEL_FULL_TOTAL, MESSAGES_TOTAL};
use crate::model::now_ms;
use crate::router::Inbound;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 5000;

/// Outbound half of the transport, shared with the command ledger.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

impl CommandPublisher for MqttPublisher {
    fn is_available(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish(&self, topic: String, payload: Vec<u8>) -> Result<()> {
        if !self.is_available() {
            return Err(Error::TransportUnavailable);
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(Error::Mqtt)
    }
}

/// Inbound half: owns the event loop.
pub struct MqttConnection {
    client: AsyncClient,
    eventloop: EventLoop,
    connected: Arc<AtomicBool>,
}

pub fn mqtt_options(config: &Config) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_broker.clone(),
        config.mqtt_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);
    if let (Some(username), Some(password)) = (&config.mqtt_username, &config.mqtt_password) {
        mqtt_options.set_credentials(username.clone(), password.clone());
    }
    mqtt_options
}

pub fn connect(config: &Config) -> (MqttPublisher, MqttConnection) {
    info!(
        "Connecting to MQTT broker at {}:{} as {}",
        config.mqtt_broker, config.mqtt_port, config.mqtt_client_id
    );
    let (client, eventloop) = AsyncClient::new(mqtt_options(config), 10000);
    let connected = Arc::new(AtomicBool::new(false));

    let publisher = MqttPublisher {
        client: client.clone(),
        connected: connected.clone(),
    };
    (
        publisher,
        MqttConnection {
            client,
            eventloop,
            connected,
        },
    )
}

fn next_backoff(current_ms: u64) -> u64 {
    (current_ms * 2).min(MAX_BACKOFF_MS)
}

/// Drives the event loop forever. Returns only when the router is gone.
pub async fn run_mqtt(connection: MqttConnection, tx: mpsc::Sender<Inbound>) -> Result<()> {
    let MqttConnection {
        client,
        mut eventloop,
        connected,
    } = connection;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker");
                connected.store(true, Ordering::SeqCst);
                backoff_ms = INITIAL_BACKOFF_MS;

                // Re-subscribe on every connect so a reconnect restores the set.
                let filters = SUBSCRIPTIONS
                    .iter()
                    .map(|topic| SubscribeFilter::new(topic.to_string(), QoS::AtLeastOnce));
                if let Err(e) = client.subscribe_many(filters).await {
                    error!("Failed to subscribe: {}", e);
                } else {
                    info!("Subscribed to {} topics with QoS 1", SUBSCRIPTIONS.len());
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                MESSAGES_TOTAL.inc();
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                let inbound = Inbound {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    received_at: now_ms(),
                };
                forward(&tx, inbound).await?;
            }
            Ok(_) => {}
            Err(e) => {
                if connected.swap(false, Ordering::SeqCst) {
                    warn!("Lost connection to MQTT broker");
                }
                error!("MQTT error: {}. Reconnecting in {}ms", e, backoff_ms);
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = next_backoff(backoff_ms);
            }
        }
    }
}

/// Hands a publish to the router, waiting for room when the queue is full.
async fn forward(tx: &mpsc::Sender<Inbound>, inbound: Inbound) -> Result<()> {
    match tx.try_send(inbound) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(inbound)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Router queue full, waiting for capacity");
            tx.send(inbound).await.map_err(|_| Error::ChannelSend)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("Router queue closed, cannot forward message");
            Err(Error::ChannelSend)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(topic: &str) -> Inbound {
        Inbound {
            topic: topic.to_string(),
            payload: b"{}".to_vec(),
            received_at: 0,
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        assert_eq!(next_backoff(100), 200);
        assert_eq!(next_backoff(4000), MAX_BACKOFF_MS);
        assert_eq!(next_backoff(MAX_BACKOFF_MS), MAX_BACKOFF_MS);
    }

    #[test]
    fn test_forward_delivers_in_order() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel(10);

            forward(&tx, inbound("home/a/b/telemetry")).await.unwrap();
            forward(&tx, inbound("home/a/b/ack")).await.unwrap();

            assert_eq!(rx.recv().await.unwrap().topic, "home/a/b/telemetry");
            assert_eq!(rx.recv().await.unwrap().topic, "home/a/b/ack");
        });
    }

    #[test]
    fn test_forward_to_closed_router_fails() {
        tokio_test::block_on(async {
            let (tx, rx) = mpsc::channel(1);
            drop(rx);

            assert!(matches!(
                forward(&tx, inbound("home/a/b/telemetry")).await,
                Err(Error::ChannelSend)
            ));
        });
    }

    #[test]
    fn test_publisher_refuses_while_disconnected() {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10);
        let connected = Arc::new(AtomicBool::new(false));
        let publisher = MqttPublisher {
            client,
            connected: connected.clone(),
        };

        assert!(!publisher.is_available());
        assert!(matches!(
            publisher.publish("home/a/b/command".to_string(), Vec::new()),
            Err(Error::TransportUnavailable)
        ));

        connected.store(true, Ordering::SeqCst);
        assert!(publisher.publish("home/a/b/command".to_string(), Vec::new()).is_ok());
    }
}
