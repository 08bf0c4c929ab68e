//! The channel protocol engine.
//!
//! One engine serves one data channel. It owns the validation state
//! machine, the pending request table, topic subscriptions and the
//! heartbeat task; nothing here is shared across channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use protocol::error::{ChannelError, FrameError};
use protocol::framing::FrameDecoder;
use protocol::messages::{
    ChannelMessage, HeartbeatData, MessageType, RequestPayload,
    DISABLE_TRAFFIC_SAVING_REQ_TYPE, RTT_PROBE_REQ_TYPE,
};
use protocol::validation::{ValidationMachine, ValidationState};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::pending::{PendingTable, ReplyFuture};
use super::{generate_message_id, ChannelTransport, IssuedIds};

/// Period between outbound heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

const HEARTBEAT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub heartbeat_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

/// Protocol engine for one data channel.
///
/// Cheap to clone; clones share the same channel state.
#[derive(Clone)]
pub struct ChannelEngine {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn ChannelTransport>,
    config: EngineConfig,
    decoder: FrameDecoder,
    pending: PendingTable,
    validation: Mutex<ValidationMachine>,
    validation_tx: watch::Sender<ValidationState>,
    observer: Mutex<Option<mpsc::UnboundedSender<ChannelMessage>>>,
    subscriptions: DashMap<String, mpsc::UnboundedSender<ChannelMessage>>,
    issued_ids: Mutex<IssuedIds>,
    heartbeat_started: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ChannelEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEngine")
            .field("validation", &self.validation_state())
            .field("pending", &self.inner.pending.len())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl ChannelEngine {
    /// Creates an engine over `transport` with default settings.
    pub fn new(transport: Arc<dyn ChannelTransport>, decoder: FrameDecoder) -> Self {
        Self::with_config(transport, decoder, EngineConfig::default())
    }

    pub fn with_config(
        transport: Arc<dyn ChannelTransport>,
        decoder: FrameDecoder,
        config: EngineConfig,
    ) -> Self {
        let (validation_tx, _) = watch::channel(ValidationState::Pending);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                decoder,
                pending: PendingTable::new(),
                validation: Mutex::new(ValidationMachine::new()),
                validation_tx,
                observer: Mutex::new(None),
                subscriptions: DashMap::new(),
                issued_ids: Mutex::new(IssuedIds::new()),
                heartbeat_started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Returns a stream of every inbound message.
    ///
    /// Only one observer exists at a time; calling this again replaces it.
    pub fn observe(&self) -> mpsc::UnboundedReceiver<ChannelMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.inner.observer) = Some(tx);
        rx
    }

    pub fn validation_state(&self) -> ValidationState {
        *self.inner.validation_tx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Sends `{type, topic, data}`.
    ///
    /// When `data` carries a correlation id (`uuid`, else
    /// `header.identity.id`) the returned future resolves with the reply.
    /// Without one the message is fire-and-forget and `None` is returned.
    pub fn publish(
        &self,
        topic: &str,
        data: Value,
        message_type: MessageType,
    ) -> Result<Option<ReplyFuture>, ChannelError> {
        self.inner.ensure_open()?;

        let message = ChannelMessage::new(message_type, topic, data);
        let text = message.to_json()?;
        let key = message.correlation_key();

        let waiter = key.id.is_some().then(|| self.inner.pending.register(key.clone()));
        // close() may have drained the table between ensure_open and register.
        if waiter.is_some() && self.is_closed() {
            self.inner.pending.remove(&key);
            return Err(ChannelError::Closed);
        }
        if let Err(e) = self.inner.transmit(&message, text) {
            if waiter.is_some() {
                self.inner.pending.remove(&key);
            }
            return Err(e);
        }
        Ok(waiter)
    }

    /// Sends a `req` for `api_id` on `topic` and returns the reply future.
    pub fn request(
        &self,
        topic: &str,
        api_id: u32,
        parameter: Option<&Value>,
    ) -> Result<ReplyFuture, ChannelError> {
        let payload = RequestPayload::new(self.next_message_id(), api_id, parameter);
        self.request_with(topic, payload)
    }

    /// Sends a prepared request payload, e.g. one carrying a priority.
    pub fn request_with(
        &self,
        topic: &str,
        payload: RequestPayload,
    ) -> Result<ReplyFuture, ChannelError> {
        let data = serde_json::to_value(payload)?;
        self.publish(topic, data, MessageType::Request)?
            .ok_or_else(|| ChannelError::Serialization("request payload lost its id".to_string()))
    }

    /// Draws an id not yet used on this channel.
    pub fn next_message_id(&self) -> i64 {
        let mut issued = lock(&self.inner.issued_ids);
        loop {
            let id = generate_message_id();
            if issued.insert(id, Instant::now()) {
                return id;
            }
        }
    }

    /// Subscribes to `topic` and returns its message stream.
    pub fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChannelMessage>, ChannelError> {
        self.publish(topic, Value::Null, MessageType::Subscribe)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscriptions.insert(topic.to_string(), tx);
        info!(topic = %topic, "Subscribed");
        Ok(rx)
    }

    /// Unsubscribes from `topic`, ending its stream.
    pub fn unsubscribe(&self, topic: &str) -> Result<(), ChannelError> {
        self.inner.subscriptions.remove(topic);
        self.publish(topic, Value::Null, MessageType::Unsubscribe)?;
        info!(topic = %topic, "Unsubscribed");
        Ok(())
    }

    pub fn switch_video(&self, on: bool) -> Result<(), ChannelError> {
        self.publish("", Value::from(on_off(on)), MessageType::Vid)
            .map(|_| ())
    }

    pub fn switch_audio(&self, on: bool) -> Result<(), ChannelError> {
        self.publish("", Value::from(on_off(on)), MessageType::Aud)
            .map(|_| ())
    }

    pub fn disable_traffic_saving(&self, on: bool) -> Result<(), ChannelError> {
        let data = json!({
            "req_type": DISABLE_TRAFFIC_SAVING_REQ_TYPE,
            "instruction": on_off(on),
        });
        self.publish("", data, MessageType::RtcInnerReq).map(|_| ())
    }

    /// Waits until the device accepts the validation exchange.
    pub async fn wait_validated(&self) -> Result<(), ChannelError> {
        let mut rx = self.inner.validation_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ValidationState::Validated => return Ok(()),
                ValidationState::Failed => return Err(ChannelError::ValidationFailed),
                _ => {}
            }
            if self.inner.cancel.is_cancelled() {
                return Err(ChannelError::Closed);
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(ChannelError::Closed);
                    }
                }
                _ = self.inner.cancel.cancelled() => {}
            }
        }
    }

    /// Called once the transport reports the channel open.
    ///
    /// Starts the heartbeat task; later calls are no-ops.
    pub fn handle_open(&self) {
        if self.is_closed() || self.inner.heartbeat_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Data channel open, starting heartbeat");
        spawn_heartbeat(
            Arc::downgrade(&self.inner),
            self.inner.cancel.clone(),
            self.inner.config.heartbeat_interval,
        );
    }

    /// Handles one inbound text frame.
    pub fn handle_text(&self, text: &str) {
        let message = match ChannelMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed message: {}", e);
                return;
            }
        };
        self.inner.dispatch(message);
    }

    /// Handles one inbound binary frame.
    ///
    /// Frames that fail to decode are dropped; the channel carries on.
    pub fn handle_binary(&self, buf: &[u8]) {
        match self.inner.decoder.decode(buf) {
            Ok(frame) => match frame.to_message() {
                Some(message) => self.inner.dispatch(message),
                None => debug!("Decoded binary frame without a message type"),
            },
            Err(FrameError::DecodeFailed(reason)) => {
                debug!("Dropping binary frame: {}", reason);
            }
            Err(e) => warn!("Dropping binary frame: {}", e),
        }
    }

    /// Closes the engine.
    ///
    /// Fails every pending request with [`ChannelError::Closed`], stops the
    /// heartbeat and ends all subscription and observer streams.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();

        let failed = self.inner.pending.fail_all(ChannelError::Closed);
        self.inner.subscriptions.clear();
        lock(&self.inner.observer).take();

        info!(failed_requests = failed, "Data channel closed");
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) || !self.transport.is_open() {
            return Err(ChannelError::NotOpen);
        }
        Ok(())
    }

    fn transmit(&self, message: &ChannelMessage, text: String) -> Result<(), ChannelError> {
        log_traffic("->", message);
        self.transport.send_text(text)
    }

    fn send(&self, message: &ChannelMessage) -> Result<(), ChannelError> {
        self.ensure_open()?;
        let text = message.to_json()?;
        self.transmit(message, text)
    }

    fn dispatch(&self, message: ChannelMessage) {
        log_traffic("<-", &message);

        match &message.message_type {
            MessageType::Validation => self.on_validation(&message.data),
            MessageType::RtcInnerReq if is_rtt_probe(&message.data) => {
                let echo = ChannelMessage::new(MessageType::RtcInnerReq, "", message.data.clone());
                if let Err(e) = self.send(&echo) {
                    debug!("Failed to echo RTT probe: {}", e);
                }
            }
            ty if ty.is_error_report() => {
                warn!(topic = %message.topic, kind = %ty, "Device reported: {}", message.data);
            }
            _ => {}
        }

        self.pending.resolve(&message);

        let delivered = self
            .subscriptions
            .get(&message.topic)
            .map(|tx| tx.send(message.clone()).is_ok());
        if delivered == Some(false) {
            debug!(topic = %message.topic, "Subscription stream dropped, forgetting topic");
            self.subscriptions.remove(&message.topic);
        }

        let mut observer = lock(&self.observer);
        if let Some(tx) = observer.as_ref() {
            if tx.send(message).is_err() {
                observer.take();
            }
        }
    }

    fn on_validation(&self, data: &Value) {
        let mut machine = lock(&self.validation);
        let before = machine.state();

        if let Some(response) = machine.on_message(data) {
            if let Err(e) = self.send(&response) {
                warn!("Could not answer validation challenge: {}", e);
                machine.advance(ValidationState::Failed);
            }
        }

        let after = machine.state();
        if after != before {
            info!("Validation {:?} -> {:?}", before, after);
            self.validation_tx.send_replace(after);
        }
    }

    fn send_heartbeat(&self) {
        if !self.transport.is_open() || self.closed.load(Ordering::SeqCst) {
            trace!("Channel not open, skipping heartbeat");
            return;
        }
        let now = chrono::Local::now();
        let heartbeat = ChannelMessage::heartbeat(HeartbeatData {
            time_in_str: now.format(HEARTBEAT_TIME_FORMAT).to_string(),
            time_in_num: now.timestamp(),
        });
        if let Err(e) = self.send(&heartbeat) {
            trace!("Heartbeat not sent: {}", e);
        }
    }
}

fn spawn_heartbeat(inner: Weak<Inner>, cancel: CancellationToken, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match inner.upgrade() {
                        Some(inner) => inner.send_heartbeat(),
                        None => break,
                    }
                }
            }
        }
        debug!("Heartbeat task stopped");
    });
}

fn log_traffic(direction: &str, message: &ChannelMessage) {
    if message.message_type == MessageType::Heartbeat {
        trace!("{} heartbeat", direction);
    } else {
        debug!(
            topic = %message.topic,
            kind = %message.message_type,
            "{} {}",
            direction,
            message.data
        );
    }
}

fn is_rtt_probe(data: &Value) -> bool {
    data.get("req_type").and_then(Value::as_str) == Some(RTT_PROBE_REQ_TYPE)
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

/// Locks a std mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
