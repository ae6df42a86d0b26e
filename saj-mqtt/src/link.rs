//! Outbound side of a session.
//!
//! A [`Link`] hands request frames to the transport. [`MqttLink`] wraps the
//! `rumqttc` client whose event loop is owned by the session pump;
//! [`ChannelLink`] delivers frames to an in-process receiver so a simulated
//! inverter can answer them without a broker.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use tokio::sync::mpsc;

use crate::error::{Result, SajError};

/// Publishing half of a transport connection.
#[async_trait]
pub trait Link: Send + Sync {
    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Ask the transport to close the connection.
    async fn disconnect(&self) -> Result<()>;
}

/// Map a numeric QoS level to the `rumqttc` type.
pub fn qos_from_level(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(SajError::invalid_request(format!(
            "invalid MQTT qos level {}",
            other
        ))),
    }
}

/// [`Link`] backed by an MQTT client.
#[derive(Clone, Debug)]
pub struct MqttLink {
    client: AsyncClient,
    qos: QoS,
}

impl MqttLink {
    pub fn new(client: AsyncClient, qos: QoS) -> Self {
        Self { client, qos }
    }
}

#[async_trait]
impl Link for MqttLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client.publish(topic, self.qos, false, payload).await?;
        tracing::trace!(topic = %topic, "Queued request for publishing");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await?;
        Ok(())
    }
}

/// A frame handed to a [`ChannelLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedFrame {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// [`Link`] that forwards published frames to an in-process channel.
#[derive(Debug)]
pub struct ChannelLink {
    tx: mpsc::UnboundedSender<PublishedFrame>,
    closed: AtomicBool,
}

impl ChannelLink {
    /// Create a link and the receiver its frames are delivered to.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PublishedFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Self {
            tx,
            closed: AtomicBool::new(false),
        };
        (link, rx)
    }
}

#[async_trait]
impl Link for ChannelLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SajError::transport("link is disconnected"));
        }

        self.tx
            .send(PublishedFrame {
                topic: topic.to_string(),
                payload,
            })
            .map_err(|_| SajError::transport("receiver dropped"))
    }

    async fn disconnect(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_from_level() {
        assert_eq!(qos_from_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(qos_from_level(3).is_err());
    }

    #[tokio::test]
    async fn test_channel_link_delivers_frames() {
        let (link, mut rx) = ChannelLink::new();

        link.publish("saj/S1/data_transmission", vec![1, 2, 3])
            .await
            .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.topic, "saj/S1/data_transmission");
        assert_eq!(frame.payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_channel_link_rejects_after_disconnect() {
        let (link, _rx) = ChannelLink::new();
        link.disconnect().await.unwrap();

        let result = link.publish("topic", vec![0]).await;
        assert!(matches!(result, Err(SajError::Transport(_))));
    }

    #[tokio::test]
    async fn test_channel_link_receiver_dropped() {
        let (link, rx) = ChannelLink::new();
        drop(rx);

        let result = link.publish("topic", vec![0]).await;
        assert!(matches!(result, Err(SajError::Transport(_))));
    }
}
