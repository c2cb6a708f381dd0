//! Pure message routing for MQTT events, plus the telemetry forwarder
//!
//! The event loop only classifies packets and hands raw telemetry payloads
//! on; parsing and validation belong to the ingestor.

use rumqttc::v5::{mqttbytes::QoS, Event};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Whether a publish on `topic` is lamp telemetry (pure function)
    pub fn is_telemetry(topic: &str, status_topic: &str) -> bool {
        if topic != status_topic {
            debug!(topic = %topic, expected = %status_topic, "Ignoring message on unexpected topic");
            return false;
        }
        true
    }

    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => {
                use rumqttc::v5::mqttbytes::v5::Packet;
                match incoming {
                    Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                    Packet::Publish(publish) => EventRoute::MessageReceived {
                        topic: String::from_utf8_lossy(&publish.topic).to_string(),
                        payload: publish.payload.to_vec(),
                        retain: publish.retain,
                    },
                    Packet::Disconnect(_) => EventRoute::Disconnected,
                    Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                        packet_id: suback.pkid,
                        filters: suback.return_codes.len(),
                    },
                    other => EventRoute::InfrastructureEvent(format!("{other:?}")),
                }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Commands are fire-and-forget: at most once, never retained (pure function)
    pub fn command_qos() -> QoS {
        QoS::AtMostOnce
    }

    /// Telemetry subscription QoS (pure function)
    pub fn telemetry_qos() -> QoS {
        QoS::AtLeastOnce
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the session
    ConnectionAcknowledged,
    /// Publish received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// Broker closed the session
    Disconnected,
    /// SubAck for `filters` topic filters
    SubscriptionConfirmed { packet_id: u16, filters: usize },
    /// PingResp and friends
    InfrastructureEvent(String),
    /// Outgoing packet bookkeeping
    OutgoingEvent,
}

/// Hands raw telemetry payloads to the ingestor's channel
#[derive(Default)]
pub struct MessageForwarder {
    telemetry_sender: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_telemetry_sender(&self, sender: mpsc::Sender<Vec<u8>>) {
        if let Ok(mut slot) = self.telemetry_sender.lock() {
            *slot = Some(sender);
        }
    }

    /// Drop the sender so the ingestor sees the channel close
    pub fn clear_telemetry_sender(&self) {
        if let Ok(mut slot) = self.telemetry_sender.lock() {
            slot.take();
        }
    }

    /// Forward one payload; waits if the ingestor is behind
    pub async fn forward_telemetry(&self, payload: Vec<u8>) -> Result<(), String> {
        let sender = self
            .telemetry_sender
            .lock()
            .ok()
            .and_then(|slot| slot.clone());

        match sender {
            Some(sender) => sender
                .send(payload)
                .await
                .map_err(|e| format!("Failed to forward telemetry to ingestor: {e}")),
            None => {
                warn!("Received telemetry but no ingestor is attached - message dropped");
                Err("No telemetry sender configured".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, Packet, Publish,
    };

    #[test]
    fn test_is_telemetry() {
        assert!(MessageHandler::is_telemetry(
            "iot/light/status",
            "iot/light/status"
        ));
        assert!(!MessageHandler::is_telemetry(
            "iot/light/command",
            "iot/light/status"
        ));
    }

    #[test]
    fn test_route_connack_and_disconnect() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        );

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        );
    }

    #[test]
    fn test_route_publish() {
        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from("iot/light/status"),
            pkid: 1,
            payload: Bytes::from(r#"{"sensor_value":420}"#),
            properties: None,
        }));

        assert_eq!(
            MessageHandler::route_mqtt_event(&publish),
            EventRoute::MessageReceived {
                topic: "iot/light/status".to_string(),
                payload: br#"{"sensor_value":420}"#.to_vec(),
                retain: false,
            }
        );
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(MessageHandler::command_qos(), QoS::AtMostOnce);
        assert_eq!(MessageHandler::telemetry_qos(), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_forwarder_requires_sender() {
        let forwarder = MessageForwarder::new();
        assert!(forwarder.forward_telemetry(b"{}".to_vec()).await.is_err());

        let (tx, mut rx) = mpsc::channel(1);
        forwarder.set_telemetry_sender(tx);
        forwarder
            .forward_telemetry(br#"{"is_on":true}"#.to_vec())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), br#"{"is_on":true}"#.to_vec());
    }

    #[tokio::test]
    async fn test_clearing_sender_closes_channel() {
        let forwarder = MessageForwarder::new();
        let (tx, mut rx) = mpsc::channel(1);
        forwarder.set_telemetry_sender(tx);
        forwarder.clear_telemetry_sender();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_forwarder_reports_closed_channel() {
        let forwarder = MessageForwarder::new();
        let (tx, rx) = mpsc::channel(1);
        forwarder.set_telemetry_sender(tx);
        drop(rx);
        assert!(forwarder.forward_telemetry(b"{}".to_vec()).await.is_err());
    }
}
