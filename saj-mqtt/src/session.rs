//! Transport session: connection lifecycle and the inbound pump.
//!
//! [`Session::connect`] spawns one long-lived task that owns the MQTT event
//! loop. It subscribes to the device's response topic once the broker
//! acknowledges the connection, flips the session to
//! [`SessionState::Connected`] when the subscription is acknowledged, and
//! feeds every inbound publish to [`dispatch`]. Foreground callers never
//! touch the event loop; they publish through a [`Link`] and wait on the
//! shared [`Correlator`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, SubscribeReasonCode};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use saj_common::{DeviceConfig, MqttConfig, RequestConfig, TopicBuilder};

use crate::correlator::{Correlator, Payload};
use crate::error::{Result, SajError};
use crate::frame::{self, RequestKey, RequestKind};
use crate::link::{Link, MqttLink, qos_from_level};

/// Capacity of the request channel between the client and the event loop.
const CLIENT_CHANNEL_CAPACITY: usize = 32;

/// Extra seconds granted to the event loop's own connection timeout.
const NETWORK_TIMEOUT_MARGIN_SECS: u64 = 1;

/// How long `shutdown` waits for the pump to drain before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
        }
    }
}

/// What the pump did with an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Matched a pending request and decoded cleanly.
    Resolved(RequestKey),
    /// Matched a pending request but failed to decode; the request fails.
    Failed(RequestKey),
    /// No pending request matches; dropped.
    Discarded,
    /// Header could not be decoded; dropped.
    Malformed,
}

/// Decode one inbound frame and resolve the request it answers.
pub fn dispatch(correlator: &Correlator, payload: &[u8]) -> Dispatch {
    let decoded = frame::parse_header(payload).and_then(|header| Ok((header.key()?, header)));
    let key = match decoded {
        Ok((key, header)) => {
            if !correlator.is_pending(&key) {
                trace!(request = %key, "Discarded response for unknown request");
                return Dispatch::Discarded;
            }

            debug!(
                request = %key,
                length = header.length,
                timestamp = header.timestamp,
                frame = %hex::encode(payload),
                "Received response"
            );
            key
        }
        Err(e) => {
            warn!(error = %e, bytes = payload.len(), "Ignored malformed frame");
            return Dispatch::Malformed;
        }
    };

    let resolution = match key.kind {
        RequestKind::Read => frame::parse_read_payload(payload).map(Payload::Registers),
        RequestKind::Write => frame::parse_write_payload(payload).map(Payload::Value),
    };

    let failed = match &resolution {
        Ok(_) => false,
        Err(e) => {
            warn!(request = %key, error = %e, "Response failed to decode");
            true
        }
    };

    // The caller may have timed out since the pending check.
    if !correlator.resolve(key, resolution) {
        trace!(request = %key, "Request purged before it could be resolved");
        return Dispatch::Discarded;
    }

    if failed {
        Dispatch::Failed(key)
    } else {
        Dispatch::Resolved(key)
    }
}

/// A publish/subscribe session with one inverter.
pub struct Session {
    link: Arc<dyn Link>,
    correlator: Arc<Correlator>,
    topics: TopicBuilder,
    state: Arc<watch::Sender<SessionState>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("serial", &self.topics.serial())
            .field("state", &self.state())
            .field("pending", &self.correlator.len())
            .finish()
    }
}

impl Session {
    /// Connect to the broker and wait until the response subscription is
    /// acknowledged.
    ///
    /// On timeout the session is shut down and
    /// [`SajError::ConnectionTimeout`] is returned.
    pub async fn connect(
        mqtt: &MqttConfig,
        device: &DeviceConfig,
        requests: &RequestConfig,
    ) -> Result<Self> {
        let qos = qos_from_level(mqtt.qos)?;
        let client_id = mqtt.client_id.clone().unwrap_or_else(|| {
            format!("saj-mqtt-{}-{:04x}", std::process::id(), rand::random::<u16>())
        });

        let mut options = MqttOptions::new(client_id.clone(), mqtt.host.clone(), mqtt.port);
        options.set_keep_alive(Duration::from_secs(mqtt.keep_alive_secs));
        options.set_credentials(mqtt.username.clone(), mqtt.password.clone());

        let timeout = requests.connect_timeout();
        let (client, mut eventloop) = AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY);
        // The event loop must not give up on the handshake before our own
        // deadline does.
        eventloop
            .network_options
            .set_connection_timeout(requests.connect_timeout_secs + NETWORK_TIMEOUT_MARGIN_SECS);

        let topics = TopicBuilder::new(device.serial.clone());
        let correlator = Arc::new(Correlator::new());
        let (state, mut state_rx) = watch::channel(SessionState::Connecting);
        let state = Arc::new(state);

        info!(
            host = %mqtt.host,
            port = mqtt.port,
            client_id = %client_id,
            serial = %device.serial,
            "Connecting to MQTT broker"
        );

        let pump = tokio::spawn(run_pump(
            eventloop,
            client.clone(),
            topics.response(),
            correlator.clone(),
            state.clone(),
        ));

        let session = Self {
            link: Arc::new(MqttLink::new(client, qos)),
            correlator,
            topics,
            state,
            pump: Mutex::new(Some(pump)),
        };

        let ready = tokio::time::timeout(timeout, async {
            state_rx
                .wait_for(|state| *state != SessionState::Connecting)
                .await
                .map(|state| *state)
        })
        .await;

        match ready {
            Ok(Ok(SessionState::Connected)) => {
                info!(serial = %session.topics.serial(), "MQTT session ready");
                Ok(session)
            }
            Ok(_) => {
                session.shutdown().await;
                Err(SajError::transport(
                    "connection closed before the subscription was acknowledged",
                ))
            }
            Err(_) => {
                warn!(?timeout, "MQTT subscription not acknowledged in time");
                session.shutdown().await;
                Err(SajError::ConnectionTimeout(timeout))
            }
        }
    }

    /// Wrap an already connected [`Link`], with no pump of its own.
    ///
    /// Whoever receives the link's responses feeds them to [`dispatch`]
    /// with [`Session::correlator`].
    pub fn attach(link: Arc<dyn Link>, topics: TopicBuilder) -> Self {
        let (state, _) = watch::channel(SessionState::Connected);
        Self {
            link,
            correlator: Arc::new(Correlator::new()),
            topics,
            state: Arc::new(state),
            pump: Mutex::new(None),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The pending request table shared with the pump.
    pub fn correlator(&self) -> Arc<Correlator> {
        self.correlator.clone()
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    /// Publish a request frame on the device's request topic.
    pub async fn publish(&self, frame: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(SajError::NotConnected);
        }
        self.link.publish(&self.topics.request(), frame).await
    }

    /// Disconnect and join the pump. Safe to call more than once.
    pub async fn shutdown(&self) {
        let previous = self.state.send_replace(SessionState::Disconnected);
        let pump = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take();

        if previous == SessionState::Disconnected && pump.is_none() {
            return;
        }

        debug!(serial = %self.topics.serial(), "Shutting down MQTT session");

        if let Err(e) = self.link.disconnect().await {
            debug!(error = %e, "Disconnect request not delivered");
        }

        if let Some(mut pump) = pump {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut pump).await.is_err() {
                warn!("MQTT pump did not stop in time, aborting it");
                pump.abort();
            }
        }

        info!(serial = %self.topics.serial(), "MQTT session shut down");
    }
}

/// Own the event loop until the connection ends.
async fn run_pump(
    mut eventloop: EventLoop,
    client: AsyncClient,
    response_topic: String,
    correlator: Arc<Correlator>,
    state: Arc<watch::Sender<SessionState>>,
) {
    debug!(topic = %response_topic, "MQTT pump started");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!(code = ?ack.code, "MQTT connected");
                // Never await the client from here: its queue is drained by
                // this very loop.
                let subscribed =
                    client.try_subscribe(response_topic.clone(), rumqttc::QoS::AtMostOnce);
                if let Err(e) = subscribed {
                    warn!(error = %e, topic = %response_topic, "Failed to queue subscription");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    warn!(topic = %response_topic, "Broker refused the response subscription");
                    break;
                }
                debug!(topic = %response_topic, "MQTT topic subscribed");
                state.send_if_modified(|current| {
                    if *current == SessionState::Connecting {
                        *current = SessionState::Connected;
                        true
                    } else {
                        false
                    }
                });
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                trace!(topic = %publish.topic, bytes = publish.payload.len(), "Inbound message");
                dispatch(&correlator, &publish.payload);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("Broker closed the MQTT connection");
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                break;
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                trace!(pkid, "MQTT message published");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT connection lost");
                break;
            }
        }
    }

    state.send_replace(SessionState::Disconnected);
    debug!("MQTT pump stopped");
}
