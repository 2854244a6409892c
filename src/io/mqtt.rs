//! MQTT access-control protocol client
//!
//! One client owns one broker connection. Routes are registered before
//! connecting; every registered topic is re-subscribed after each ConnAck and
//! publishes are refused until all SubAcks are back. Publishing while not
//! connected fails fast instead of queueing, a late unlock is a hazard.

use crate::domain::payload::{
    parse_access, parse_frame, parse_motion, AccessPayload, FramePayload, MotionPayload, PayloadError,
    StatusPayload,
};
use crate::domain::types::AccessCommand;
use crate::infra::config::Config;
use crate::infra::metrics::{Metrics, MQTT_STATE_CONNECTED, MQTT_STATE_CONNECTING, MQTT_STATE_DISCONNECTED};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, NetworkOptions, Packet, Publish, QoS, SubscribeReasonCode,
};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Inbound queue depth for motion/access routes
const ROUTE_CAPACITY: usize = 16;

/// Requests buffered between client handles and the eventloop
const REQUEST_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("not connected to broker (state: {0})")]
    NotConnected(&'static str),
    #[error("outbound request queue full")]
    QueueFull,
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Input to the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection attempt is starting
    Dial,
    /// Broker accepted the session; `subscriptions` requests were issued
    ConnAck { subscriptions: usize },
    /// One subscription confirmed
    SubAck,
    /// Transport error or broker disconnect
    Lost,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid connection transition: {event:?} while {from}")]
pub struct TransitionError {
    pub from: &'static str,
    pub event: ConnectionEvent,
}

/// Connection lifecycle
///
/// `Connected` is only reachable once every subscription of the session is
/// acknowledged, so a client that can publish is always one that can hear
/// motion wakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting { acked: bool, pending_subacks: usize },
    Connected,
}

impl ConnectionState {
    /// Permitted transitions; anything not listed is rejected
    pub fn apply(self, event: ConnectionEvent) -> Result<ConnectionState, TransitionError> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let next = match (self, event) {
            (_, E::Lost) => S::Disconnected,
            (S::Disconnected, E::Dial) => S::Connecting { acked: false, pending_subacks: 0 },
            (S::Connecting { acked: false, .. }, E::ConnAck { subscriptions: 0 }) => S::Connected,
            (S::Connecting { acked: false, .. }, E::ConnAck { subscriptions }) => {
                S::Connecting { acked: true, pending_subacks: subscriptions }
            }
            (S::Connecting { acked: true, pending_subacks: 1 }, E::SubAck) => S::Connected,
            (S::Connecting { acked: true, pending_subacks }, E::SubAck) if pending_subacks > 1 => {
                S::Connecting { acked: true, pending_subacks: pending_subacks - 1 }
            }
            (from, event) => return Err(TransitionError { from: from.as_str(), event }),
        };
        Ok(next)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting { acked: false, .. } => "connecting",
            ConnectionState::Connecting { acked: true, .. } => "subscribing",
            ConnectionState::Connected => "connected",
        }
    }

    fn metric_code(&self) -> u64 {
        match self {
            ConnectionState::Disconnected => MQTT_STATE_DISCONNECTED,
            ConnectionState::Connecting { .. } => MQTT_STATE_CONNECTING,
            ConnectionState::Connected => MQTT_STATE_CONNECTED,
        }
    }
}

/// Exponential backoff step, capped
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Where an inbound topic is delivered
enum Route {
    Motion(mpsc::Sender<MotionPayload>),
    Access(mpsc::Sender<AccessPayload>),
    Frames { camera_id: String, tx: mpsc::Sender<FramePayload> },
}

#[derive(Debug, Clone)]
struct Topics {
    motion: String,
    access: String,
    status: String,
}

/// Registers inbound routes, then connects
pub struct AccessClientBuilder {
    options: MqttOptions,
    connect_timeout: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    topics: Topics,
    routes: FxHashMap<String, Route>,
    metrics: Arc<Metrics>,
}

impl AccessClientBuilder {
    pub fn new(config: &Config, client_id: &str, metrics: Arc<Metrics>) -> Self {
        let mut options = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        options.set_keep_alive(Duration::from_secs(5));
        // Subscriptions are re-issued on every session
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            options.set_credentials(username, password);
        }

        Self {
            options,
            connect_timeout: config.mqtt_connect_timeout(),
            backoff_initial: config.mqtt_backoff_initial(),
            backoff_max: config.mqtt_backoff_max(),
            topics: Topics {
                motion: config.motion_topic().to_string(),
                access: config.access_topic().to_string(),
                status: config.status_topic().to_string(),
            },
            routes: FxHashMap::default(),
            metrics,
        }
    }

    /// Subscribe to the motion channel
    pub fn on_motion(&mut self) -> mpsc::Receiver<MotionPayload> {
        let (tx, rx) = mpsc::channel(ROUTE_CAPACITY);
        self.routes.insert(self.topics.motion.clone(), Route::Motion(tx));
        rx
    }

    /// Subscribe to the access channel
    pub fn on_access(&mut self) -> mpsc::Receiver<AccessPayload> {
        let (tx, rx) = mpsc::channel(ROUTE_CAPACITY);
        self.routes.insert(self.topics.access.clone(), Route::Access(tx));
        rx
    }

    /// Subscribe to a camera's frame topic; capacity 1, extra frames are dropped
    pub fn on_frames(&mut self, camera_id: &str, topic: &str) -> mpsc::Receiver<FramePayload> {
        let (tx, rx) = mpsc::channel(1);
        self.routes.insert(topic.to_string(), Route::Frames { camera_id: camera_id.to_string(), tx });
        rx
    }

    /// Spawn the connection driver and return a publishing handle
    pub fn connect(self, shutdown: watch::Receiver<bool>) -> (AccessClient, JoinHandle<()>) {
        let (client, mut eventloop) = AsyncClient::new(self.options, REQUEST_CAPACITY);
        let mut network = NetworkOptions::new();
        network.set_connection_timeout(self.connect_timeout.as_secs().max(1));
        eventloop.set_network_options(network);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let mut subscriptions: Vec<String> = self.routes.keys().cloned().collect();
        subscriptions.sort();

        let handle = AccessClient {
            client: client.clone(),
            state: state_rx,
            topics: Arc::new(self.topics),
        };

        let driver = ConnectionDriver {
            client,
            state: ConnectionState::Disconnected,
            state_tx,
            subscriptions,
            dispatcher: Dispatcher::new(self.routes, self.metrics.clone()),
            backoff_initial: self.backoff_initial,
            backoff_max: self.backoff_max,
            metrics: self.metrics,
        };
        let task = tokio::spawn(driver.run(eventloop, shutdown));
        (handle, task)
    }
}

/// Cloneable publishing handle
#[derive(Clone)]
pub struct AccessClient {
    client: AsyncClient,
    state: watch::Receiver<ConnectionState>,
    topics: Arc<Topics>,
}

impl AccessClient {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn publish_access(&self, cmd: &AccessCommand) -> Result<(), PublishError> {
        self.publish_payload(&AccessPayload::from(cmd))
    }

    pub fn publish_payload(&self, payload: &AccessPayload) -> Result<(), PublishError> {
        self.publish_json(&self.topics.access, payload)
    }

    pub fn publish_motion(&self) -> Result<(), PublishError> {
        self.publish_json(&self.topics.motion, &MotionPayload::detected())
    }

    pub fn publish_status(&self, status: &StatusPayload) -> Result<(), PublishError> {
        self.publish_json(&self.topics.status, status)
    }

    fn publish_json<T: Serialize>(&self, topic: &str, payload: &T) -> Result<(), PublishError> {
        let state = self.state();
        if !state.is_connected() {
            return Err(PublishError::NotConnected(state.as_str()));
        }
        let bytes = serde_json::to_vec(payload)?;
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, bytes)
            .map_err(|_| PublishError::QueueFull)?;
        debug!(topic = %topic, "mqtt_published");
        Ok(())
    }
}

/// Owns the eventloop: reconnects, re-subscribes, dispatches inbound messages
struct ConnectionDriver {
    client: AsyncClient,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: Vec<String>,
    dispatcher: Dispatcher,
    backoff_initial: Duration,
    backoff_max: Duration,
    metrics: Arc<Metrics>,
}

impl ConnectionDriver {
    async fn run(mut self, mut eventloop: EventLoop, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.backoff_initial;
        self.transition(ConnectionEvent::Dial);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = self.client.try_disconnect();
                        self.transition(ConnectionEvent::Lost);
                        info!("mqtt_shutdown");
                        return;
                    }
                }
                result = eventloop.poll() => {
                    match result {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            backoff = self.backoff_initial;
                            self.on_connack();
                        }
                        Ok(Event::Incoming(Packet::SubAck(ack))) => {
                            let rejected = ack
                                .return_codes
                                .iter()
                                .any(|c| matches!(c, SubscribeReasonCode::Failure));
                            self.on_suback(rejected);
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            self.dispatcher.dispatch(&publish);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            self.transition(ConnectionEvent::Lost);
                            self.metrics.record_mqtt_reconnect();
                            log_connection_error(&e, backoff);
                            discard_outbound(&mut eventloop);

                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = shutdown.changed() => {
                                    if *shutdown.borrow() {
                                        info!("mqtt_shutdown");
                                        return;
                                    }
                                }
                            }
                            backoff = next_backoff(backoff, self.backoff_max);
                            // Anything that raced the state change during backoff goes too
                            discard_outbound(&mut eventloop);
                            self.transition(ConnectionEvent::Dial);
                        }
                    }
                }
            }
        }
    }

    fn on_connack(&mut self) {
        self.transition(ConnectionEvent::ConnAck { subscriptions: self.subscriptions.len() });
        for topic in &self.subscriptions {
            if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                error!(topic = %topic, error = %e, "mqtt_subscribe_request_failed");
            }
        }
        info!(subscriptions = %self.subscriptions.len(), "mqtt_connected");
        if self.state.is_connected() {
            info!("mqtt_ready");
        }
    }

    fn on_suback(&mut self, rejected: bool) {
        if rejected {
            // Stay out of Connected and force a fresh session
            error!(state = %self.state.as_str(), "mqtt_subscribe_rejected");
            let _ = self.client.try_disconnect();
            return;
        }
        self.transition(ConnectionEvent::SubAck);
        if self.state.is_connected() {
            info!(topics = %self.subscriptions.len(), "mqtt_resubscribed");
        }
    }

    fn transition(&mut self, event: ConnectionEvent) {
        match self.state.apply(event) {
            Ok(next) => {
                if next != self.state {
                    debug!(from = %self.state.as_str(), to = %next.as_str(), "mqtt_state_changed");
                }
                self.state = next;
                self.state_tx.send_replace(next);
                self.metrics.set_mqtt_state(next.metric_code());
            }
            Err(e) => warn!(error = %e, "mqtt_unexpected_transition"),
        }
    }
}

/// Drop every request rumqttc would replay on the next session.
///
/// A publish accepted just before the link died would otherwise be written
/// after reconnect, long after the decision it carried.
fn discard_outbound(eventloop: &mut EventLoop) -> usize {
    eventloop.clean();
    let dropped = eventloop.pending.len();
    eventloop.pending.clear();
    if dropped > 0 {
        warn!(dropped = %dropped, "mqtt_outbound_discarded");
    }
    dropped
}

#[cold]
#[inline(never)]
fn log_connection_error(e: &rumqttc::ConnectionError, backoff: Duration) {
    error!(error = %e, retry_in_ms = %backoff.as_millis(), "mqtt_connection_lost");
}

/// Decodes inbound publishes and forwards them to their route
struct Dispatcher {
    routes: FxHashMap<String, Route>,
    metrics: Arc<Metrics>,
    last_drop_warn: Instant,
}

impl Dispatcher {
    fn new(routes: FxHashMap<String, Route>, metrics: Arc<Metrics>) -> Self {
        Self { routes, metrics, last_drop_warn: Instant::now() - Duration::from_secs(2) }
    }

    fn dispatch(&mut self, publish: &Publish) {
        let topic = publish.topic.as_str();
        let Some(route) = self.routes.get(topic) else {
            debug!(topic = %topic, "mqtt_unrouted_message");
            return;
        };

        let dropped = match route {
            Route::Motion(tx) => match parse_motion(&publish.payload) {
                Ok(motion) => {
                    self.metrics.record_motion_event();
                    forward(tx, motion)
                }
                Err(e) => return self.malformed(topic, &e),
            },
            Route::Access(tx) => {
                // A retained command is by definition stale
                if publish.retain {
                    warn!(topic = %topic, "access_retained_ignored");
                    return;
                }
                match parse_access(&publish.payload) {
                    Ok(access) => forward(tx, access),
                    Err(e) => return self.malformed(topic, &e),
                }
            }
            Route::Frames { camera_id, tx } => {
                self.metrics.record_frame_received();
                match parse_frame(&publish.payload) {
                    Ok(frame) => {
                        if forward(tx, frame) {
                            // One frame in flight per stream; newer ones are dropped
                            self.metrics.record_frame_dropped();
                            debug!(camera_id = %camera_id, "frame_dropped");
                        }
                        false
                    }
                    Err(e) => return self.malformed(topic, &e),
                }
            }
        };

        if dropped {
            self.metrics.record_inbound_dropped();
            if self.last_drop_warn.elapsed() > Duration::from_secs(1) {
                warn!(topic = %topic, "mqtt_inbound_dropped: channel full");
                self.last_drop_warn = Instant::now();
            }
        }
    }

    fn malformed(&self, topic: &str, e: &PayloadError) {
        self.metrics.record_malformed_payload();
        warn!(topic = %topic, error = %e, "mqtt_malformed_payload");
    }
}

/// Non-blocking hand-off; returns true if the message was dropped for lack of room
fn forward<T>(tx: &mpsc::Sender<T>, msg: T) -> bool {
    match tx.try_send(msg) {
        Ok(()) => false,
        Err(TrySendError::Full(_)) => true,
        Err(TrySendError::Closed(_)) => {
            debug!("mqtt_route_closed");
            false
        }
    }
}
