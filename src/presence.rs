use std::time::Duration;

use log::{debug, info};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("timed out after {0:?} waiting for the broker to acknowledge the connection")]
    Timeout(Duration),

    #[error(transparent)]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("connect was already attempted on this client")]
    AlreadyAttempted,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("not connected to the broker")]
    NotConnected,

    #[error(transparent)]
    Client(#[from] rumqttc::ClientError),

    #[error("broker did not acknowledge publish within {0:?}")]
    Timeout(Duration),

    #[error("MQTT event loop stopped")]
    EventLoopGone,
}

/// A broker session that can deliver a retained message and confirm it
/// arrived.
pub trait Broker {
    async fn connect(&mut self) -> Result<(), ConnectError>;

    /// Sends `payload` retained on `topic` and resolves once the broker has
    /// acknowledged it.
    async fn publish_retained(
        &mut self,
        topic: &str,
        payload: &'static str,
    ) -> Result<(), PublishError>;

    /// Best-effort close. Never takes much longer than `grace`.
    async fn disconnect(&mut self, grace: Duration);
}

pub fn payload(meeting_found: bool) -> &'static str {
    if meeting_found { "ON" } else { "OFF" }
}

/// Owns the broker session and the last state the broker confirmed.
pub struct PresencePublisher<B> {
    broker: B,
    topic: String,
    last_state: bool,
    /// Set after a failed send. The message may still reach the broker
    /// later, so the retained value is unknown until the next ack.
    unconfirmed: bool,
}

impl<B: Broker> PresencePublisher<B> {
    pub fn new(broker: B, topic: impl Into<String>) -> Self {
        PresencePublisher {
            broker,
            topic: topic.into(),
            last_state: false,
            unconfirmed: false,
        }
    }

    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        self.broker.connect().await
    }

    pub fn last_state(&self) -> bool {
        self.last_state
    }

    /// Whether `publish(meeting_found)` would send anything.
    pub fn needs_publish(&self, meeting_found: bool) -> bool {
        self.unconfirmed || meeting_found != self.last_state
    }

    /// Publishes `meeting_found` unless it is already the last confirmed
    /// state and nothing has failed since. Returns whether a message went out.
    ///
    /// `last_state` only moves once the broker acknowledges. After a failure
    /// the next call sends even an unchanged state, since the failed message
    /// may land late and leave the wrong value retained.
    pub async fn publish(&mut self, meeting_found: bool) -> Result<bool, PublishError> {
        if !self.needs_publish(meeting_found) {
            debug!("State for {} already {}, not publishing", self.topic, payload(meeting_found));
            return Ok(false);
        }

        if let Err(err) = self
            .broker
            .publish_retained(&self.topic, payload(meeting_found))
            .await
        {
            self.unconfirmed = true;
            return Err(err);
        }
        self.last_state = meeting_found;
        self.unconfirmed = false;
        info!("Published {} to {}", payload(meeting_found), self.topic);
        Ok(true)
    }

    pub async fn disconnect(&mut self, grace: Duration) {
        self.broker.disconnect(grace).await;
    }
}
