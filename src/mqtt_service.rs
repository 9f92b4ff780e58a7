use crate::cache::WeightCache;
use crate::config::Config;
use crate::connection_test::refusal_reason;
use crate::db::DatabaseService;
use crate::models::{BrokerConfig, SensorReading, StartOutcome};
use crate::status::StatusReader;
use crate::weight::decode_weight_payload;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, MissedTickBehavior};
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

struct ActiveSession {
    config: BrokerConfig,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the broker session of this process. Only the worker that won the
/// owner election calls `start`; every worker may call the read side.
pub struct MqttService {
    client_id: String,
    client_state: Arc<Mutex<ClientState>>,
    session: Mutex<Option<ActiveSession>>,
    cache: Arc<WeightCache>,
    db: Arc<DatabaseService>,
    status: StatusReader,
    pub(crate) config: Config,
}

impl MqttService {
    pub fn new(db: Arc<DatabaseService>, config: Config) -> Arc<Self> {
        let client_id = format!("brewscale_{}", &Uuid::new_v4().simple().to_string()[..8]);
        info!("MQTT service initialized with client ID: {}", client_id);

        Arc::new(Self {
            client_id,
            client_state: Arc::new(Mutex::new(ClientState::Disconnected)),
            session: Mutex::new(None),
            cache: Arc::new(WeightCache::new(db.clone())),
            status: StatusReader::new(db.clone(), config.freshness_window()),
            db,
            config,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Spawns the session task and returns without waiting for the broker.
    pub async fn start(&self, broker: BrokerConfig) -> StartOutcome {
        if !broker.enabled {
            info!("MQTT is disabled in configuration");
            return StartOutcome::Disabled;
        }
        if !broker.has_host() {
            error!("No broker host configured");
            return StartOutcome::MissingHost;
        }

        let mut session = self.session.lock().await;
        if let Some(active) = session.as_ref() {
            if !active.handle.is_finished() {
                info!("MQTT client already running");
                return StartOutcome::AlreadyRunning;
            }
            warn!("MQTT session task ended unexpectedly, restarting it");
            *session = None;
        }

        let (client, eventloop) = AsyncClient::new(self.mqtt_options(&broker), 10);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        *self.client_state.lock().await = ClientState::Connecting;

        let worker = SessionWorker {
            client,
            topic: broker.weight_topic(),
            cache: self.cache.clone(),
            db: self.db.clone(),
            client_state: self.client_state.clone(),
        };

        info!(
            "Connecting to MQTT broker {}:{} (ID: {})",
            broker.host, broker.port, self.client_id
        );
        let handle = tokio::spawn(worker.run(
            eventloop,
            shutdown_rx,
            self.config.heartbeat_interval(),
            (self.config.reconnect_min_ms, self.config.reconnect_max_ms),
        ));

        *session = Some(ActiveSession {
            config: broker,
            shutdown: shutdown_tx,
            handle,
        });
        StartOutcome::Started
    }

    fn mqtt_options(&self, broker: &BrokerConfig) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(&self.client_id, broker.host.trim(), broker.port);
        mqtt_options.set_keep_alive(Duration::from_secs(60));
        mqtt_options.set_clean_session(true);

        if let Some((username, password)) = broker.credentials() {
            mqtt_options.set_credentials(username, password);
        }
        if broker.use_tls {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }
        mqtt_options
    }

    /// Stops the session if there is one and clears both cache tiers. Safe to
    /// call at any time.
    pub async fn stop(&self) {
        info!("Stopping MQTT client...");
        let active = self.session.lock().await.take();

        if let Some(mut active) = active {
            let _ = active.shutdown.send(true);
            match tokio::time::timeout(self.config.stop_timeout(), &mut active.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("MQTT session task failed: {}", e),
                Err(_) => {
                    warn!(
                        "MQTT session did not stop within {:?}, aborting it",
                        self.config.stop_timeout()
                    );
                    active.handle.abort();
                }
            }
        }

        *self.client_state.lock().await = ClientState::Disconnected;
        self.cache.clear();
        info!("MQTT client stopped");
    }

    /// Tear down and rebuild rather than mutate a live session.
    pub async fn reconfigure(&self, broker: BrokerConfig) -> StartOutcome {
        let running = self.is_running().await;

        if running {
            info!("Config updated, reconnecting...");
            self.stop().await;
        } else if !broker.enabled {
            // nothing to stop, but stale weights must still go
            self.stop().await;
        }

        if broker.enabled {
            if !running {
                info!("MQTT enabled, starting...");
            }
            self.start(broker).await
        } else {
            info!("MQTT disabled");
            StartOutcome::Disabled
        }
    }

    pub async fn is_running(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|active| !active.handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn active_config(&self) -> Option<BrokerConfig> {
        self.session.lock().await.as_ref().map(|active| active.config.clone())
    }

    pub async fn client_state(&self) -> ClientState {
        self.client_state.lock().await.clone()
    }

    pub fn latest_weight(&self) -> Option<SensorReading> {
        self.cache.latest()
    }

    /// Shared-row freshness; local knowledge only if the database is down.
    pub async fn is_connected(&self) -> bool {
        match self.status.is_connected() {
            Ok(connected) => connected,
            Err(e) => {
                debug!("is_connected DB check failed: {}", e);
                self.is_running().await && *self.client_state.lock().await == ClientState::Connected
            }
        }
    }
}

/// Bounded exponential backoff: min, 2*min, 4*min ... capped at max.
fn reconnect_backoff(min_ms: u64, max_ms: u64) -> ExponentialBackoff {
    ExponentialBackoff::from_millis(2)
        .factor((min_ms / 2).max(1))
        .max_delay(Duration::from_millis(max_ms))
}

struct SessionWorker {
    client: AsyncClient,
    topic: String,
    cache: Arc<WeightCache>,
    db: Arc<DatabaseService>,
    client_state: Arc<Mutex<ClientState>>,
}

impl SessionWorker {
    async fn run(
        self,
        mut eventloop: EventLoop,
        mut shutdown: watch::Receiver<bool>,
        heartbeat: Duration,
        (reconnect_min_ms, reconnect_max_ms): (u64, u64),
    ) {
        let heartbeat_task = tokio::spawn(heartbeat_loop(
            self.db.clone(),
            self.client_state.clone(),
            heartbeat,
            shutdown.clone(),
        ));
        let mut backoff = reconnect_backoff(reconnect_min_ms, reconnect_max_ms);

        loop {
            let polled = tokio::select! {
                _ = shutdown.changed() => break,
                polled = eventloop.poll() => polled,
            };

            match polled {
                Ok(event) => {
                    if self.handle_event(event).await {
                        backoff = reconnect_backoff(reconnect_min_ms, reconnect_max_ms);
                    }
                }
                Err(e) => {
                    self.handle_connection_error(&e).await;
                    let delay = backoff.next().unwrap_or(Duration::from_millis(reconnect_max_ms));
                    warn!("Lost connection to MQTT broker. Retrying in {:?}...", delay);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        // joined, not aborted: a touch in flight must land before stop clears
        if let Err(e) = heartbeat_task.await {
            warn!("MQTT heartbeat task failed: {}", e);
        }
        info!("MQTT loop ending, disconnecting...");
        self.disconnect(&mut eventloop).await;
    }

    /// Returns true when the event completed a connection.
    async fn handle_event(&self, event: Event) -> bool {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Success {
                    self.set_state(ClientState::Error(refusal_reason(ack.code).to_string()))
                        .await;
                    error!("Connection failed: {}", refusal_reason(ack.code));
                    return false;
                }

                self.set_state(ClientState::Connected).await;
                info!("Connected to MQTT broker");
                let db = self.db.clone();
                if let Some(Err(e)) = off_runtime(move || db.touch_liveness()).await {
                    debug!("Connection status update failed (non-critical): {}", e);
                }

                // clean sessions forget subscriptions, so subscribe on every connect
                match self.client.try_subscribe(&self.topic, QoS::AtLeastOnce) {
                    Ok(_) => info!("Subscribed to topic: {}", self.topic),
                    Err(e) => error!("Failed to subscribe to topic '{}': {}", self.topic, e),
                }
                true
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                if ack.return_codes.iter().any(|code| matches!(code, SubscribeReasonCode::Failure)) {
                    error!("Broker rejected subscription to '{}'", self.topic);
                }
                false
            }
            Event::Incoming(Packet::Publish(publish)) => {
                if publish.topic == self.topic {
                    self.handle_payload(&publish.payload).await;
                } else {
                    warn!("Unknown topic received: {}", publish.topic);
                }
                false
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Broker closed the MQTT session");
                false
            }
            Event::Outgoing(_) => false,
            other => {
                debug!("Unhandled event: {:?}", other);
                false
            }
        }
    }

    async fn handle_payload(&self, payload: &[u8]) {
        match decode_weight_payload(payload) {
            Ok(weight_kg) => {
                info!("Weight received: {} kg", weight_kg);
                let cache = self.cache.clone();
                off_runtime(move || cache.record(SensorReading::now(weight_kg))).await;
            }
            Err(e) => warn!("Invalid payload on {}: {}", self.topic, e),
        }
    }

    async fn handle_connection_error(&self, e: &ConnectionError) {
        match e {
            ConnectionError::ConnectionRefused(code) => {
                error!("Connection failed: {}", refusal_reason(*code));
                self.set_state(ClientState::Error(refusal_reason(*code).to_string())).await;
            }
            other => {
                warn!("Error in MQTT event loop: {}", other);
                self.set_state(ClientState::Disconnected).await;
            }
        }

        let db = self.db.clone();
        if let Some(Err(e)) = off_runtime(move || db.clear_live_weight()).await {
            debug!("Connection status update failed (non-critical): {}", e);
        }
    }

    async fn disconnect(&self, eventloop: &mut EventLoop) {
        let was_connected = *self.client_state.lock().await == ClientState::Connected;
        self.set_state(ClientState::Disconnected).await;
        if !was_connected || self.client.try_disconnect().is_err() {
            return;
        }

        let flushed = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            debug!("Timed out flushing MQTT disconnect");
        }
    }

    async fn set_state(&self, state: ClientState) {
        *self.client_state.lock().await = state;
    }
}

/// Refreshes the shared liveness stamp while the link is up.
async fn heartbeat_loop(
    db: Arc<DatabaseService>,
    client_state: Arc<Mutex<ClientState>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if *client_state.lock().await == ClientState::Connected {
                    // a stop that raced the tick must not recreate the row
                    if *shutdown.borrow() {
                        break;
                    }
                    let db = db.clone();
                    if let Some(Err(e)) = off_runtime(move || db.touch_liveness()).await {
                        debug!("Heartbeat update failed (non-critical): {}", e);
                    }
                }
            }
        }
    }
}

/// Runs a store call on the blocking pool. SQLite may wait out its busy
/// timeout, which must not stall the session or request tasks.
async fn off_runtime<T, F>(call: F) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Blocking store call failed: {}", e);
            None
        }
    }
}
