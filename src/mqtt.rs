use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{Event, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};

use crate::config;
use crate::presence::{Broker, ConnectError, PublishError};

/// How long the background event loop waits before polling again after a
/// connection error. rumqttc reconnects on the next poll.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct MqttClient {
    client: rumqttc::AsyncClient,
    eventloop: Option<rumqttc::EventLoop>,
    acks: Option<mpsc::UnboundedReceiver<u16>>,
    task: Option<JoinHandle<()>>,
    connect_timeout: Duration,
    ack_timeout: Duration,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> Self {
        let mut mqttoptions =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);

        mqttoptions.set_keep_alive(config.keep_alive);
        mqttoptions.set_credentials(config.username.clone(), config.password.clone());

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        MqttClient {
            client,
            eventloop: Some(eventloop),
            acks: None,
            task: None,
            connect_timeout: config.connect_timeout,
            ack_timeout: config.ack_timeout,
        }
    }
}

/// rumqttc reports a refused ConnAck as `ConnectionError::ConnectionRefused`,
/// so only an accepted session gets here as an event.
async fn wait_for_connack(eventloop: &mut rumqttc::EventLoop) -> Result<(), ConnectError> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::ConnAck(_)) => return Ok(()),
            event => debug!("MQTT event before ConnAck: {:?}", event),
        }
    }
}

/// Drives the rumqttc event loop until the client disconnects, forwarding
/// the packet id of every PubAck.
async fn event_loop(mut eventloop: rumqttc::EventLoop, acks: mpsc::UnboundedSender<u16>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                debug!("Publish {} acknowledged", ack.pkid);
                // Receiver gone means the client is shutting down.
                let _ = acks.send(ack.pkid);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Reconnected to MQTT broker");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Error polling MQTT event loop: {:?}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

impl Broker for MqttClient {
    async fn connect(&mut self) -> Result<(), ConnectError> {
        let Some(mut eventloop) = self.eventloop.take() else {
            return Err(ConnectError::AlreadyAttempted);
        };

        match timeout(self.connect_timeout, wait_for_connack(&mut eventloop)).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectError::Timeout(self.connect_timeout)),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.acks = Some(rx);
        self.task = Some(tokio::spawn(event_loop(eventloop, tx)));
        Ok(())
    }

    async fn publish_retained(
        &mut self,
        topic: &str,
        payload: &'static str,
    ) -> Result<(), PublishError> {
        let client = &self.client;
        let acks = self.acks.as_mut().ok_or(PublishError::NotConnected)?;

        // Acks for publishes that already timed out would otherwise be
        // mistaken for this one.
        while acks.try_recv().is_ok() {}

        let send = async {
            client
                .publish(topic, QoS::AtLeastOnce, true, payload)
                .await?;
            acks.recv().await.ok_or(PublishError::EventLoopGone)?;
            Ok::<_, PublishError>(())
        };

        match timeout(self.ack_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(self.ack_timeout)),
        }
    }

    async fn disconnect(&mut self, grace: Duration) {
        debug!("Disconnecting MQTT client");
        let deadline = Instant::now() + grace;

        match timeout_at(deadline, self.client.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Error disconnecting from MQTT broker: {:?}", e),
            Err(_) => warn!("Timed out queueing MQTT disconnect"),
        }

        if let Some(mut task) = self.task.take() {
            if timeout_at(deadline, &mut task).await.is_err() {
                warn!("MQTT event loop still busy after {:?}, dropping it", grace);
                task.abort();
            }
        }
        self.acks = None;
    }
}
