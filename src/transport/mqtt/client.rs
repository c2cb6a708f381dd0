//! Impure I/O for the MQTT client
//!
//! Owns the rumqttc event loop. A supervisor task polls it, routes events,
//! restores the telemetry subscription after every ConnAck and rebuilds the
//! connection with backoff when it drops.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use crate::config::MqttSection;
use crate::observability::metrics;
use crate::protocol::DeviceCommand;
use crate::transport::Transport;
use async_trait::async_trait;
use rumqttc::v5::{AsyncClient, ConnectionError, EventLoop};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// Timestamps behind the link health report
#[derive(Debug, Default, Clone, Copy)]
struct LinkTimes {
    connected_at: Option<Instant>,
    last_telemetry: Option<Instant>,
}

#[derive(Debug, Default)]
struct LinkStats {
    times: std::sync::Mutex<LinkTimes>,
    reconnects: AtomicU32,
}

impl LinkStats {
    fn update(&self, apply: impl FnOnce(&mut LinkTimes)) {
        if let Ok(mut times) = self.times.lock() {
            apply(&mut times);
        }
    }

    fn snapshot(&self) -> LinkTimes {
        self.times.lock().map(|times| *times).unwrap_or_default()
    }
}

/// MQTT transport for the lamp
pub struct MqttClient {
    config: MqttSection,
    client: Arc<Mutex<AsyncClient>>,
    // EventLoop is Send but not Sync; the mutex keeps the client Sync until
    // connect() moves the loop into the supervisor task
    event_loop: Option<Mutex<EventLoop>>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    state_tx: Option<watch::Sender<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reconnect_config: ReconnectConfig,
    subscribed_topics: Vec<String>,
    forwarder: Arc<MessageForwarder>,
    link: Arc<LinkStats>,
}

impl MqttClient {
    pub fn new(config: MqttSection) -> Result<Self, MqttError> {
        let reconnect_config = ReconnectConfig::from_section(&config);
        HealthMonitor::validate_connection_config(&reconnect_config)
            .map_err(MqttError::InvalidReconnectConfig)?;

        let (client, event_loop) = Self::create_connection(&config)?;
        let subscribed_topics = vec![config.status_topic.clone()];

        Ok(MqttClient {
            config,
            client: Arc::new(Mutex::new(client)),
            event_loop: Some(Mutex::new(event_loop)),
            event_loop_handle: Mutex::new(None),
            state_rx: None,
            state_tx: None,
            shutdown_tx: None,
            reconnect_config,
            subscribed_topics,
            forwarder: Arc::new(MessageForwarder::new()),
            link: Arc::new(LinkStats::default()),
        })
    }

    /// Deliver raw telemetry payloads to `sender`
    pub fn set_telemetry_sender(&self, sender: mpsc::Sender<Vec<u8>>) {
        self.forwarder.set_telemetry_sender(sender);
    }

    /// Create a fresh client and event loop; used for the first connection
    /// and for every reconnection attempt
    fn create_connection(config: &MqttSection) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(config)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY))
    }

    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        (
            watch::channel(ConnectionState::Connecting),
            watch::channel(false),
        )
    }

    /// Wait for the first ConnAck, a terminal failure, or the timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
                match *state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason.clone()));
                    }
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Start the supervisor and wait for the broker to accept the session
    ///
    /// On error the supervisor keeps retrying in the background; callers may
    /// carry on and rely on `is_connected`.
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self
            .event_loop
            .take()
            .ok_or_else(|| {
                MqttError::ConnectionFailedStr("Event loop already started".to_string())
            })?
            .into_inner();

        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) = Self::setup_connection_channels();
        self.state_rx = Some(state_rx.clone());
        self.state_tx = Some(state_tx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        let supervisor = Supervisor {
            config: self.config.clone(),
            client: self.client.clone(),
            state_tx,
            shutdown_rx,
            reconnect_config: self.reconnect_config.clone(),
            subscribed_topics: self.subscribed_topics.clone(),
            forwarder: self.forwarder.clone(),
            link: self.link.clone(),
            attempts: 0,
        };

        info!(
            broker = %self.config.broker_url,
            status_topic = %self.config.status_topic,
            command_topic = %self.config.command_topic,
            "Connecting to MQTT broker"
        );
        metrics().mqtt_connection_attempt();
        let span = crate::mqtt_span!(client_id = %self.config.client_id);
        let handle = tokio::spawn(supervisor.run(event_loop).instrument(span));
        *self.event_loop_handle.lock().await = Some(handle);

        let timeout = HealthMonitor::calculate_connection_timeout(&self.reconnect_config);
        Self::wait_for_connection_confirmation(state_rx, timeout).await
    }

    /// Stop the supervisor and close the session
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
            debug!("Sent shutdown signal to reconnection supervisor");
        }

        // Best effort; the event loop may already be gone
        if let Err(e) = self.client.lock().await.disconnect().await {
            debug!("MQTT disconnect request not delivered: {}", e);
        }

        if let Some(state_tx) = &self.state_tx {
            let _ = state_tx.send(ConnectionState::Disconnected(
                "Client disconnected".to_string(),
            ));
        }
        metrics().mqtt_connection_lost();

        if let Some(handle) = self.event_loop_handle.lock().await.take() {
            let abort = handle.abort_handle();
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Err(_) => {
                    warn!("Event loop task didn't shut down in time, aborting");
                    abort.abort();
                }
                _ => {}
            }
        }

        // Closes the telemetry channel once in-flight payloads are delivered
        self.forwarder.clear_telemetry_sender();

        info!("MQTT client disconnected");
        Ok(())
    }

    /// Current connection state; `None` before `connect`
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }

    /// Health of the link to the lamp
    pub fn get_health_metrics(&self) -> HealthMetrics {
        let times = self.link.snapshot();
        HealthMonitor::calculate_health_metrics(
            times.connected_at,
            times.last_telemetry,
            self.link.reconnects.load(Ordering::Relaxed),
        )
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state = self
            .connection_state()
            .unwrap_or_else(|| ConnectionState::Disconnected("Not connected yet".to_string()));
        if !HealthMonitor::can_publish(&state) {
            return Err(MqttError::NotConnected { state });
        }
        Ok(())
    }

    /// Publish a command; fails fast while disconnected, nothing is queued
    ///
    /// A full request channel is a publish failure rather than a wait, so the
    /// client lock is never held across an await on the event loop.
    pub async fn publish_command(&self, command: &DeviceCommand) -> Result<(), MqttError> {
        self.check_connection_state()?;

        let payload = command
            .to_payload()
            .map_err(MqttError::SerializationError)?;

        self.client
            .lock()
            .await
            .try_publish(
                self.config.command_topic.clone(),
                MessageHandler::command_qos(),
                false,
                payload,
            )
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        debug!(
            topic = %self.config.command_topic,
            kind = command.kind(),
            "Published device command"
        );
        Ok(())
    }
}

/// State moved into the background event loop task
struct Supervisor {
    config: MqttSection,
    client: Arc<Mutex<AsyncClient>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_config: ReconnectConfig,
    subscribed_topics: Vec<String>,
    forwarder: Arc<MessageForwarder>,
    link: Arc<LinkStats>,
    attempts: u32,
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop) {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping MQTT supervisor");
                        break;
                    }
                }
                event = event_loop.poll() => {
                    let keep_running = match event {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(route, &mut event_loop).await
                        }
                        Err(e) => self.handle_event_loop_error(e, &mut event_loop).await,
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        info!("MQTT event loop stopped");
    }

    fn transition(&self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(event);
        let previous = self.state_tx.borrow().clone();
        HealthMonitor::log_state_transition(&previous, &next);
        let _ = self.state_tx.send(next);
    }

    /// Returns false when the supervisor should stop
    async fn process_event_route(&mut self, route: EventRoute, event_loop: &mut EventLoop) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.transition(ConnectionEvent::ConnAckReceived);
                self.attempts = 0;
                self.link.update(|times| times.connected_at = Some(Instant::now()));
                metrics().mqtt_connection_established();
                self.resubscribe_to_topics().await;
                true
            }
            EventRoute::MessageReceived { topic, payload, .. } => {
                if MessageHandler::is_telemetry(&topic, &self.config.status_topic) {
                    self.link
                        .update(|times| times.last_telemetry = Some(Instant::now()));
                    if let Err(e) = self.forwarder.forward_telemetry(payload).await {
                        error!("Failed to forward telemetry: {}", e);
                    }
                }
                true
            }
            EventRoute::Disconnected => {
                self.transition(ConnectionEvent::DisconnectedByBroker);
                metrics().mqtt_connection_lost();
                self.attempt_reconnection(event_loop).await
            }
            EventRoute::SubscriptionConfirmed { packet_id, filters } => {
                debug!(target: "mqtt_transport", packet_id, filters, "Subscription confirmed");
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn handle_event_loop_error(
        &mut self,
        error: ConnectionError,
        event_loop: &mut EventLoop,
    ) -> bool {
        warn!("MQTT event loop error: {}", error);
        self.transition(ConnectionEvent::NetworkError(error.to_string()));
        metrics().mqtt_connection_lost();
        self.attempt_reconnection(event_loop).await
    }

    async fn resubscribe_to_topics(&self) {
        let client = self.client.lock().await;
        for topic in &self.subscribed_topics {
            match client
                .subscribe(topic.clone(), MessageHandler::telemetry_qos())
                .await
            {
                Ok(()) => debug!(target: "mqtt_transport", "Subscribed to: {}", topic),
                Err(e) => error!("Failed to subscribe to {}: {}", topic, e),
            }
        }
    }

    /// Returns true if sleep completed, false if shutdown was requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    async fn attempt_reconnection(&mut self, event_loop: &mut EventLoop) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.attempts,
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.attempts = attempt;
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));
                self.link.reconnects.fetch_add(1, Ordering::Relaxed);
                metrics().mqtt_reconnect();

                let max_display = self
                    .reconnect_config
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                info!(attempt, max = %max_display, delay_ms, "Scheduling MQTT reconnection");

                if !Self::interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await {
                    info!("Shutdown signal received during reconnection delay");
                    return false;
                }

                match MqttClient::create_connection(&self.config) {
                    Ok((client, new_event_loop)) => {
                        *event_loop = new_event_loop;
                        *self.client.lock().await = client;
                        metrics().mqtt_connection_attempt();
                    }
                    Err(e) => error!("Failed to create new connection: {}", e),
                }
                true
            }
            ReconnectionDecision::AbortShutdownRequested => false,
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    self.reconnect_config.max_attempts.unwrap_or_default()
                );
                self.transition(ConnectionEvent::PermanentFailure(reason));
                false
            }
        }
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn publish_command(&self, command: &DeviceCommand) -> Result<(), Self::Error> {
        MqttClient::publish_command(self, command).await
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        MqttClient::connection_state(self)
    }

    fn is_permanently_disconnected(&self) -> bool {
        MqttClient::is_permanently_disconnected(self)
    }

    fn set_telemetry_sender(&self, sender: mpsc::Sender<Vec<u8>>) {
        MqttClient::set_telemetry_sender(self, sender);
    }

    fn link_health(&self) -> Option<HealthMetrics> {
        Some(self.get_health_metrics())
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        // No async in Drop; call disconnect() for a graceful shutdown
        if let Some(handle) = self.event_loop_handle.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PowerState;

    fn client() -> MqttClient {
        MqttClient::new(MqttSection::default()).unwrap()
    }

    #[test]
    fn test_setup_connection_channels() {
        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            MqttClient::setup_connection_channels();

        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);
        assert!(!*shutdown_rx.borrow());

        state_tx.send(ConnectionState::Connected).unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);
        shutdown_tx.send(true).unwrap();
        assert!(*shutdown_rx.borrow());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let ((state_tx, state_rx), _) = MqttClient::setup_connection_channels();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Reconnecting(1));
            let _ = state_tx.send(ConnectionState::Connected);
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_timeout() {
        let ((state_tx, state_rx), _) = MqttClient::setup_connection_channels();
        let _keep_open = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(state_tx);
        });

        let err = MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ConnAck"));
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_disconnected() {
        let ((state_tx, state_rx), _) = MqttClient::setup_connection_channels();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Disconnected("refused".to_string()));
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let err =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await
                .unwrap_err();
        assert!(err.to_string().contains("refused"));
    }

    #[tokio::test]
    async fn test_interruptible_sleep() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        assert!(Supervisor::interruptible_sleep(shutdown_rx, 5).await);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = shutdown_tx.send(true);
        });
        assert!(!Supervisor::interruptible_sleep(shutdown_rx, 1000).await);
    }

    #[tokio::test]
    async fn test_state_before_connect() {
        let client = client();
        assert!(client.connection_state().is_none());
        assert!(!client.is_permanently_disconnected());
        assert!(!Transport::is_connected(&client));
        assert_eq!(client.subscribed_topics, vec!["iot/light/status".to_string()]);
    }

    #[tokio::test]
    async fn test_health_metrics_before_connect() {
        let metrics = client().get_health_metrics();
        assert_eq!(metrics.uptime_secs, None);
        assert_eq!(metrics.secs_since_last_telemetry, None);
        assert_eq!(metrics.reconnect_count, 0);
        assert!(!metrics.is_healthy);
    }

    #[tokio::test]
    async fn test_publish_fails_fast_without_connection() {
        let client = client();
        let command = DeviceCommand::Manual {
            state: PowerState::On,
            brightness: 40,
        };
        let result = client.publish_command(&command).await;
        assert!(matches!(result, Err(MqttError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_publish_fails_when_request_channel_is_full() {
        let mut client = client();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        client.state_tx = Some(state_tx);
        client.state_rx = Some(state_rx);
        let command = DeviceCommand::Manual {
            state: PowerState::Off,
            brightness: 10,
        };

        // Nothing polls the event loop, so requests pile up in the channel
        for _ in 0..REQUEST_CHANNEL_CAPACITY {
            client.publish_command(&command).await.unwrap();
        }
        let result = tokio::time::timeout(
            Duration::from_millis(500),
            client.publish_command(&command),
        )
        .await
        .expect("publish must not wait for channel capacity");
        assert!(matches!(result, Err(MqttError::PublishFailed(_))));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let client = client();
        assert!(client.disconnect().await.is_ok());
    }

    #[test]
    fn test_invalid_reconnect_schedule_is_rejected() {
        let config = MqttSection {
            reconnect_sustained_delay_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            MqttClient::new(config),
            Err(MqttError::InvalidReconnectConfig(_))
        ));
    }
}
