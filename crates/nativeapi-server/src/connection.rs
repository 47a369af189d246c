//! One API client: protocol state, dispatch, backpressure and keepalive.
//!
//! [`ApiConnection::tick`] is called once per main loop iteration and never
//! blocks. Each tick it drives the frame helper, handles at most one inbound
//! packet, retries deferred sends, advances the entity iterators by one step
//! and runs the keepalive check, in that order.
//!
//! Any hard transport error closes the helper and flags the connection for
//! removal; the server drops it on its next pass.

use std::io;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use nativeapi_net::{ApiError, FrameHelper, NOISE_PSK_LEN};
use nativeapi_proto::{
    API_VERSION_MAJOR, API_VERSION_MINOR, BinarySensorStateResponse, ConnectRequest,
    ConnectResponse, DeviceInfoRequest, DeviceInfoResponse, DisconnectRequest,
    DisconnectResponse, HelloRequest, HelloResponse, LightCommandRequest, LightStateResponse,
    ListEntitiesBinarySensorResponse, ListEntitiesDoneResponse, ListEntitiesLightResponse,
    ListEntitiesRequest, ListEntitiesSensorResponse, ListEntitiesSwitchResponse,
    ListEntitiesTextSensorResponse, LogLevel, NoiseEncryptionSetKeyRequest,
    NoiseEncryptionSetKeyResponse, PingRequest, PingResponse, ProtoMessage, SensorStateResponse,
    SubscribeLogsRequest, SubscribeLogsResponse, SubscribeStatesRequest, SwitchCommandRequest,
    SwitchStateResponse, TextSensorStateResponse,
};

use crate::context::ApiContext;
use crate::deferred::{DeferredMessageQueue, Sendable};
use crate::entity::EntityRef;
use crate::iterator::{EntityIterator, IteratorStep};

/// Delay between keepalive pings that could not be sent.
const PING_RETRY_INTERVAL_MS: u32 = 1000;
/// Failed ping sends tolerated before the client is dropped.
const MAX_PING_RETRIES: u8 = 60;
const PING_RETRY_WARN_THRESHOLD: u8 = 10;

/// Handshake progress of a connection. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    WaitingForHello,
    Connected,
    Authenticated,
}

/// Whether `deadline` lies strictly in the past of `now` on a wrapping clock.
fn deadline_passed(now: u32, deadline: u32) -> bool {
    (now.wrapping_sub(deadline) as i32) > 0
}

pub struct ApiConnection {
    helper: Box<dyn FrameHelper>,
    ctx: Arc<ApiContext>,
    state: ConnectionState,
    remove: bool,
    next_close: bool,

    client_info: String,
    client_peername: String,
    client_combined_info: String,
    client_api_version: (u32, u32),

    /// Reused for every outgoing message.
    proto_write_buffer: Vec<u8>,
    deferred: DeferredMessageQueue,
    list_entities_iterator: EntityIterator,
    initial_state_iterator: EntityIterator,

    state_subscription: bool,
    log_subscription: LogLevel,

    last_traffic: u32,
    next_ping_retry: u32,
    ping_retries: u8,
    sent_ping: bool,
}

impl std::fmt::Debug for ApiConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConnection")
            .field("client", &self.client_combined_info)
            .field("state", &self.state)
            .field("remove", &self.remove)
            .field("deferred", &self.deferred.len())
            .finish_non_exhaustive()
    }
}

impl ApiConnection {
    /// Wrap `helper`. Nothing touches the socket until [`start`](Self::start).
    pub fn new(helper: Box<dyn FrameHelper>, ctx: Arc<ApiContext>) -> Self {
        Self {
            helper,
            ctx,
            state: ConnectionState::WaitingForHello,
            remove: false,
            next_close: false,
            client_info: String::new(),
            client_peername: String::new(),
            client_combined_info: String::new(),
            client_api_version: (0, 0),
            proto_write_buffer: Vec::with_capacity(64),
            deferred: DeferredMessageQueue::new(),
            list_entities_iterator: EntityIterator::new(),
            initial_state_iterator: EntityIterator::new(),
            state_subscription: false,
            log_subscription: LogLevel::None,
            last_traffic: 0,
            next_ping_retry: 0,
            ping_retries: 0,
            sent_ping: false,
        }
    }

    /// Initialise the frame helper and arm the keepalive timer.
    pub fn start(&mut self) {
        self.last_traffic = self.ctx.now();
        // First ping no earlier than one keepalive period from now.
        self.next_ping_retry = self.last_traffic.wrapping_add(self.ctx.keepalive_ms);

        self.client_peername = self.helper.peer_name();
        self.client_info = self.client_peername.clone();
        self.client_combined_info = self.client_peername.clone();

        if let Err(err) = self.helper.init() {
            self.on_fatal_error();
            tracing::warn!("{}: Helper init failed: {err}", self.client_combined_info);
            return;
        }
        self.helper.set_log_info(self.client_info.clone());
    }

    // --- Accessors ---

    /// Current protocol state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Set once the connection is dead and may be dropped.
    pub fn is_removed(&self) -> bool {
        self.remove
    }

    /// Client name from Hello, or the peer address before it arrives.
    pub fn client_info(&self) -> &str {
        &self.client_info
    }

    /// Remote socket address.
    pub fn peer_name(&self) -> &str {
        &self.client_peername
    }

    /// `"<client_info> (<peer>)"`, the prefix of every log line.
    pub fn client_combined_info(&self) -> &str {
        &self.client_combined_info
    }

    /// `(major, minor)` API version the client announced in Hello.
    pub fn client_api_version(&self) -> (u32, u32) {
        self.client_api_version
    }

    pub fn is_state_subscribed(&self) -> bool {
        self.state_subscription
    }

    pub fn log_subscription(&self) -> LogLevel {
        self.log_subscription
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    fn is_connection_setup(&self) -> bool {
        self.state >= ConnectionState::Connected
    }

    fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    pub fn tick(&mut self) {
        if self.remove {
            return;
        }

        if !self.ctx.is_network_connected() {
            self.on_fatal_error();
            tracing::warn!("{}: Network unavailable, disconnecting", self.client_combined_info);
            return;
        }
        if self.next_close {
            // Requested disconnect; the response went out last tick.
            let _ = self.helper.close();
            self.remove = true;
            return;
        }

        if let Err(err) = self.helper.poll() {
            self.on_fatal_error();
            tracing::warn!("{}: Socket operation failed: {err}", self.client_combined_info);
            return;
        }

        match self.helper.read_packet() {
            Err(ApiError::WouldBlock) => {}
            Err(err) => {
                self.on_fatal_error();
                match err {
                    ApiError::SocketReadFailed(io::ErrorKind::ConnectionReset) => {
                        tracing::warn!("{}: Connection reset", self.client_combined_info);
                    }
                    ApiError::ConnectionClosed => {
                        tracing::warn!("{}: Connection closed", self.client_combined_info);
                    }
                    _ => tracing::warn!("{}: Reading failed: {err}", self.client_combined_info),
                }
                return;
            }
            Ok(packet) => {
                self.last_traffic = self.ctx.now();
                self.read_message(packet.message_type, packet.payload());
                if self.remove {
                    return;
                }
            }
        }

        if !self.deferred.is_empty() && self.helper.can_write_without_blocking() {
            let mut deferred = std::mem::take(&mut self.deferred);
            deferred.process(|item| self.try_send(&item.entity, item.sendable));
            self.deferred = deferred;
        }

        let registry = Arc::clone(&self.ctx.registry);
        if !self.list_entities_iterator.completed() {
            let mut it = self.list_entities_iterator;
            it.advance(&*registry, |step| self.on_list_entities_step(step));
            self.list_entities_iterator = it;
        }
        if !self.initial_state_iterator.completed() && self.list_entities_iterator.completed() {
            let mut it = self.initial_state_iterator;
            it.advance(&*registry, |step| self.on_initial_state_step(step));
            self.initial_state_iterator = it;
        }

        self.check_keepalive(self.ctx.now());
    }

    fn check_keepalive(&mut self, now: u32) {
        let keepalive = self.ctx.keepalive_ms;
        let idle = now.wrapping_sub(self.last_traffic);

        if self.sent_ping {
            if idle > keepalive.saturating_mul(5) / 2 {
                self.on_fatal_error();
                tracing::warn!(
                    "{} didn't respond to ping request in time. Disconnecting...",
                    self.client_combined_info
                );
            }
        } else if idle > keepalive && deadline_passed(now, self.next_ping_retry) {
            tracing::trace!("Sending keepalive PING...");
            self.sent_ping = self.send_message(&PingRequest);
            if !self.sent_ping {
                self.next_ping_retry = now.wrapping_add(PING_RETRY_INTERVAL_MS);
                self.ping_retries = self.ping_retries.saturating_add(1);
                if self.ping_retries >= MAX_PING_RETRIES {
                    self.on_fatal_error();
                    tracing::error!(
                        "{}: Sending keepalive failed {} time(s). Disconnecting...",
                        self.client_combined_info,
                        self.ping_retries
                    );
                } else if self.ping_retries >= PING_RETRY_WARN_THRESHOLD {
                    tracing::warn!(
                        "{}: Sending keepalive failed {} time(s), will retry in {} ms",
                        self.client_combined_info,
                        self.ping_retries,
                        PING_RETRY_INTERVAL_MS
                    );
                } else {
                    tracing::debug!(
                        "{}: Sending keepalive failed {} time(s), will retry in {} ms",
                        self.client_combined_info,
                        self.ping_retries,
                        PING_RETRY_INTERVAL_MS
                    );
                }
            }
        }
    }

    fn on_list_entities_step(&mut self, step: IteratorStep<'_>) -> bool {
        match step {
            IteratorStep::Begin => true,
            IteratorStep::Entity(entity) => {
                self.send_info(entity);
                true
            }
            IteratorStep::End => self.send_message(&ListEntitiesDoneResponse),
        }
    }

    fn on_initial_state_step(&mut self, step: IteratorStep<'_>) -> bool {
        match step {
            IteratorStep::Entity(entity) => self.send_state(entity),
            IteratorStep::Begin | IteratorStep::End => true,
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    fn decode<M: ProtoMessage>(&mut self, payload: &[u8]) -> Option<M> {
        match M::decode(payload) {
            Ok(msg) => {
                tracing::trace!("{}: Received {}", self.client_combined_info, M::NAME);
                Some(msg)
            }
            Err(err) => {
                self.on_fatal_error();
                tracing::warn!(
                    "{}: Malformed {}: {err}",
                    self.client_combined_info,
                    M::NAME
                );
                None
            }
        }
    }

    fn require_setup(&mut self) -> bool {
        if !self.is_connection_setup() {
            self.on_no_setup_connection();
            return false;
        }
        true
    }

    fn require_auth(&mut self) -> bool {
        if !self.require_setup() {
            return false;
        }
        if !self.is_authenticated() {
            self.on_unauthenticated_access();
            return false;
        }
        true
    }

    /// Send a response to a request; failing to do so is fatal.
    fn respond<M: ProtoMessage>(&mut self, msg: &M) {
        if !self.send_message(msg) {
            self.on_fatal_error();
        }
    }

    fn read_message(&mut self, message_type: u16, payload: &[u8]) {
        match message_type {
            HelloRequest::MESSAGE_TYPE => {
                if let Some(msg) = self.decode::<HelloRequest>(payload) {
                    let resp = self.hello(&msg);
                    self.respond(&resp);
                }
            }
            ConnectRequest::MESSAGE_TYPE => {
                if self.require_setup()
                    && let Some(msg) = self.decode::<ConnectRequest>(payload)
                {
                    let resp = self.connect(&msg);
                    self.respond(&resp);
                }
            }
            DisconnectRequest::MESSAGE_TYPE => {
                tracing::debug!("{} requested disconnected", self.client_combined_info);
                // Close on the next tick, after the response is out.
                self.next_close = true;
                self.respond(&DisconnectResponse);
            }
            DisconnectResponse::MESSAGE_TYPE => {
                // We asked; the client agreed.
                let _ = self.helper.close();
                self.remove = true;
            }
            PingRequest::MESSAGE_TYPE => self.respond(&PingResponse),
            PingResponse::MESSAGE_TYPE => {
                self.ping_retries = 0;
                self.sent_ping = false;
            }
            DeviceInfoRequest::MESSAGE_TYPE => {
                if self.require_setup() {
                    let resp = self.device_info();
                    self.respond(&resp);
                }
            }
            ListEntitiesRequest::MESSAGE_TYPE => {
                if self.require_auth() {
                    self.list_entities_iterator.begin();
                }
            }
            SubscribeStatesRequest::MESSAGE_TYPE => {
                if self.require_auth() {
                    self.state_subscription = true;
                    self.initial_state_iterator.begin();
                }
            }
            SubscribeLogsRequest::MESSAGE_TYPE => {
                if self.require_auth()
                    && let Some(msg) = self.decode::<SubscribeLogsRequest>(payload)
                {
                    self.log_subscription = msg.level;
                    if msg.dump_config {
                        self.dump_config();
                    }
                }
            }
            LightCommandRequest::MESSAGE_TYPE => {
                if self.require_auth()
                    && let Some(msg) = self.decode::<LightCommandRequest>(payload)
                {
                    self.light_command(&msg);
                }
            }
            SwitchCommandRequest::MESSAGE_TYPE => {
                if self.require_auth()
                    && let Some(msg) = self.decode::<SwitchCommandRequest>(payload)
                {
                    self.switch_command(&msg);
                }
            }
            NoiseEncryptionSetKeyRequest::MESSAGE_TYPE => {
                if self.require_auth()
                    && let Some(msg) = self.decode::<NoiseEncryptionSetKeyRequest>(payload)
                {
                    let resp = self.noise_encryption_set_key(&msg);
                    self.respond(&resp);
                }
            }
            other => {
                tracing::debug!(
                    "{}: Ignoring message type {other}",
                    self.client_combined_info
                );
            }
        }
    }

    fn hello(&mut self, msg: &HelloRequest) -> HelloResponse {
        self.client_info = msg.client_info.clone();
        self.client_peername = self.helper.peer_name();
        self.client_combined_info = format!("{} ({})", self.client_info, self.client_peername);
        self.helper.set_log_info(self.client_combined_info.clone());
        self.client_api_version = (msg.api_version_major, msg.api_version_minor);
        tracing::debug!(
            "Hello from client: '{}' | {} | API Version {}.{}",
            self.client_info,
            self.client_peername,
            msg.api_version_major,
            msg.api_version_minor
        );

        // Hello may be repeated, but never moves an authenticated client back.
        self.state = self.state.max(ConnectionState::Connected);

        let device = &self.ctx.device;
        HelloResponse {
            api_version_major: API_VERSION_MAJOR,
            api_version_minor: API_VERSION_MINOR,
            server_info: format!("{} (esphome v{})", device.name, device.version),
            name: device.name.clone(),
        }
    }

    fn connect(&mut self, msg: &ConnectRequest) -> ConnectResponse {
        let correct = self.ctx.check_password(&msg.password);
        if correct {
            tracing::info!("{}: Connected successfully", self.client_combined_info);
            self.state = ConnectionState::Authenticated;
        } else {
            tracing::warn!("{}: Invalid password", self.client_combined_info);
        }
        ConnectResponse {
            invalid_password: !correct,
        }
    }

    fn device_info(&self) -> DeviceInfoResponse {
        let device = &self.ctx.device;
        DeviceInfoResponse {
            uses_password: self.ctx.uses_password(),
            name: device.name.clone(),
            mac_address: device.mac_address.clone(),
            esphome_version: device.version.clone(),
            compilation_time: device.compilation_time.clone(),
            model: device.model.clone(),
            has_deep_sleep: false,
            project_name: device.project_name.clone(),
            project_version: device.project_version.clone(),
            webserver_port: 0,
            manufacturer: device.manufacturer.clone(),
            friendly_name: if device.friendly_name.is_empty() {
                device.name.clone()
            } else {
                device.friendly_name.clone()
            },
            suggested_area: device.suggested_area.clone(),
            api_encryption_supported: self.ctx.psk.has_psk(),
        }
    }

    fn noise_encryption_set_key(
        &mut self,
        msg: &NoiseEncryptionSetKeyRequest,
    ) -> NoiseEncryptionSetKeyResponse {
        let mut resp = NoiseEncryptionSetKeyResponse::default();
        let psk = BASE64
            .decode(&msg.key)
            .ok()
            .and_then(|bytes| <[u8; NOISE_PSK_LEN]>::try_from(bytes).ok());
        let Some(psk) = psk else {
            tracing::warn!("Invalid encryption key length");
            return resp;
        };
        if !self.ctx.psk.save(psk, true) {
            tracing::warn!("Failed to save encryption key");
            return resp;
        }
        resp.success = true;
        resp
    }

    fn switch_command(&self, msg: &SwitchCommandRequest) {
        let Some(EntityRef::Switch(switch)) = self.ctx.registry.get(msg.key) else {
            tracing::trace!("No switch with key {:#010x}", msg.key);
            return;
        };
        if msg.state {
            switch.turn_on();
        } else {
            switch.turn_off();
        }
    }

    fn light_command(&self, msg: &LightCommandRequest) {
        let Some(EntityRef::Light(light)) = self.ctx.registry.get(msg.key) else {
            tracing::trace!("No light with key {:#010x}", msg.key);
            return;
        };
        let mut call = light.make_call();
        if msg.has_state {
            call.state = Some(msg.state);
        }
        if msg.has_brightness {
            call.brightness = Some(msg.brightness);
        }
        if msg.has_color_mode {
            call.color_mode = Some(msg.color_mode);
        }
        if msg.has_color_brightness {
            call.color_brightness = Some(msg.color_brightness);
        }
        if msg.has_rgb {
            call.red = Some(msg.red);
            call.green = Some(msg.green);
            call.blue = Some(msg.blue);
        }
        if msg.has_white {
            call.white = Some(msg.white);
        }
        if msg.has_color_temperature {
            call.color_temperature = Some(msg.color_temperature);
        }
        if msg.has_cold_white {
            call.cold_white = Some(msg.cold_white);
        }
        if msg.has_warm_white {
            call.warm_white = Some(msg.warm_white);
        }
        if msg.has_transition_length {
            call.transition_length = Some(msg.transition_length);
        }
        if msg.has_flash_length {
            call.flash_length = Some(msg.flash_length);
        }
        if msg.has_effect {
            call.effect = Some(msg.effect.clone());
        }
        call.perform();
    }

    fn dump_config(&self) {
        let device = &self.ctx.device;
        tracing::info!(
            "Device '{}' ({} {}), version {}",
            device.name,
            device.manufacturer,
            device.model,
            device.version
        );
        tracing::info!(
            "API: password {}, encryption {}",
            if self.ctx.uses_password() { "set" } else { "not set" },
            if self.ctx.psk.has_psk() { "enabled" } else { "disabled" }
        );
        for entity in self.ctx.registry.entities() {
            let info = entity.info();
            tracing::info!("{} '{}' key={:#010x}", entity.kind(), info.name, info.key);
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Send the entity's current state. Returns `false` only when the client
    /// has not subscribed; a send that cannot go out now is deferred.
    pub fn send_state(&mut self, entity: &EntityRef) -> bool {
        if !self.state_subscription {
            return false;
        }
        if self.try_to_clear_buffer(true) && self.try_send_state(entity) {
            return true;
        }
        self.deferred.defer(entity.clone(), Sendable::State);
        true
    }

    /// Send the entity's description now, or defer it.
    pub fn send_info(&mut self, entity: &EntityRef) {
        if self.try_to_clear_buffer(true) && self.try_send_info(entity) {
            return;
        }
        self.deferred.defer(entity.clone(), Sendable::Info);
    }

    /// Forward a log line if the client subscribed at `level` or noisier.
    pub fn try_send_log_message(&mut self, level: LogLevel, line: &str) -> bool {
        if !self.log_subscription.admits(level) {
            return false;
        }
        let msg = SubscribeLogsResponse {
            level,
            message: line.as_bytes().to_vec(),
            send_failed: false,
        };
        self.send_message(&msg)
    }

    /// Ask the client to disconnect.
    pub fn send_disconnect_request(&mut self) -> bool {
        self.send_message(&DisconnectRequest)
    }

    fn try_send(&mut self, entity: &EntityRef, sendable: Sendable) -> bool {
        match sendable {
            Sendable::Info => self.try_send_info(entity),
            Sendable::State => self.try_send_state(entity),
        }
    }

    fn try_send_state(&mut self, entity: &EntityRef) -> bool {
        let key = entity.key();
        match entity {
            EntityRef::BinarySensor(e) => {
                let state = e.state();
                self.send_message(&BinarySensorStateResponse {
                    key,
                    state: state.unwrap_or(false),
                    missing_state: state.is_none(),
                })
            }
            EntityRef::Sensor(e) => self.send_message(&SensorStateResponse {
                key,
                state: e.state(),
                missing_state: !e.has_state(),
            }),
            EntityRef::Switch(e) => self.send_message(&SwitchStateResponse {
                key,
                state: e.state(),
            }),
            EntityRef::TextSensor(e) => self.send_message(&TextSensorStateResponse {
                key,
                state: e.state(),
                missing_state: !e.has_state(),
            }),
            EntityRef::Light(e) => {
                let values = e.values();
                let effect = if e.traits().effects.is_empty() {
                    String::new()
                } else if values.effect.is_empty() {
                    "None".to_string()
                } else {
                    values.effect.clone()
                };
                self.send_message(&LightStateResponse {
                    key,
                    state: values.state,
                    brightness: values.brightness,
                    color_mode: values.color_mode,
                    color_brightness: values.color_brightness,
                    red: values.red,
                    green: values.green,
                    blue: values.blue,
                    white: values.white,
                    color_temperature: values.color_temperature,
                    cold_white: values.cold_white,
                    warm_white: values.warm_white,
                    effect,
                })
            }
        }
    }

    fn try_send_info(&mut self, entity: &EntityRef) -> bool {
        let info = entity.info();
        let unique_id = format!("{}{}{}", self.ctx.device.name, entity.kind(), info.object_id);
        match entity {
            EntityRef::BinarySensor(e) => self.send_message(&ListEntitiesBinarySensorResponse {
                object_id: info.object_id.clone(),
                key: info.key,
                name: info.name.clone(),
                unique_id,
                device_class: info.device_class.clone(),
                is_status_binary_sensor: e.is_status_binary_sensor(),
                disabled_by_default: info.disabled_by_default,
                icon: info.icon.clone(),
                entity_category: info.entity_category,
            }),
            EntityRef::Sensor(e) => {
                let traits = e.traits();
                self.send_message(&ListEntitiesSensorResponse {
                    object_id: info.object_id.clone(),
                    key: info.key,
                    name: info.name.clone(),
                    unique_id,
                    icon: info.icon.clone(),
                    unit_of_measurement: traits.unit_of_measurement.clone(),
                    accuracy_decimals: traits.accuracy_decimals,
                    force_update: traits.force_update,
                    device_class: info.device_class.clone(),
                    state_class: traits.state_class,
                    disabled_by_default: info.disabled_by_default,
                    entity_category: info.entity_category,
                })
            }
            EntityRef::Switch(e) => self.send_message(&ListEntitiesSwitchResponse {
                object_id: info.object_id.clone(),
                key: info.key,
                name: info.name.clone(),
                unique_id,
                icon: info.icon.clone(),
                assumed_state: e.assumed_state(),
                disabled_by_default: info.disabled_by_default,
                entity_category: info.entity_category,
                device_class: info.device_class.clone(),
            }),
            EntityRef::TextSensor(_) => self.send_message(&ListEntitiesTextSensorResponse {
                object_id: info.object_id.clone(),
                key: info.key,
                name: info.name.clone(),
                unique_id,
                icon: info.icon.clone(),
                disabled_by_default: info.disabled_by_default,
                entity_category: info.entity_category,
                device_class: info.device_class.clone(),
            }),
            EntityRef::Light(e) => {
                let traits = e.traits();
                let (min_mireds, max_mireds) = if traits.supports_color_temperature() {
                    (traits.min_mireds, traits.max_mireds)
                } else {
                    (0.0, 0.0)
                };
                let effects = if traits.effects.is_empty() {
                    Vec::new()
                } else {
                    std::iter::once("None".to_string())
                        .chain(traits.effects.iter().cloned())
                        .collect()
                };
                self.send_message(&ListEntitiesLightResponse {
                    object_id: info.object_id.clone(),
                    key: info.key,
                    name: info.name.clone(),
                    unique_id,
                    supported_color_modes: traits.supported_color_modes.clone(),
                    min_mireds,
                    max_mireds,
                    effects,
                    disabled_by_default: info.disabled_by_default,
                    icon: info.icon.clone(),
                    entity_category: info.entity_category,
                })
            }
        }
    }

    /// Make room in the transmit path. Log lines never report a full
    /// buffer, otherwise forwarding would log about itself.
    fn try_to_clear_buffer(&mut self, log_out_of_space: bool) -> bool {
        if self.remove {
            return false;
        }
        if self.helper.can_write_without_blocking() {
            return true;
        }
        if let Err(err) = self.helper.poll() {
            self.on_fatal_error();
            tracing::warn!("{}: Socket operation failed: {err}", self.client_combined_info);
            return false;
        }
        if self.helper.can_write_without_blocking() {
            return true;
        }
        if log_out_of_space {
            tracing::trace!(
                "{}: Cannot send message because of TCP buffer space",
                self.client_combined_info
            );
        }
        false
    }

    /// Encode `msg` behind the helper's header padding and send it.
    fn send_message<M: ProtoMessage>(&mut self, msg: &M) -> bool {
        let is_log = M::MESSAGE_TYPE == SubscribeLogsResponse::MESSAGE_TYPE;
        if !self.try_to_clear_buffer(!is_log) {
            return false;
        }

        let padding = self.helper.frame_header_padding();
        let footer = self.helper.frame_footer_size();
        self.proto_write_buffer.clear();
        self.proto_write_buffer
            .reserve(padding + msg.encoded_len() + footer);
        self.proto_write_buffer.resize(padding, 0);
        msg.encode_to(&mut self.proto_write_buffer);
        if !is_log {
            tracing::trace!("{}: Sending {}", self.client_combined_info, M::NAME);
        }
        self.send_buffer(M::MESSAGE_TYPE)
    }

    fn send_buffer(&mut self, message_type: u16) -> bool {
        match self
            .helper
            .write_protobuf_packet(message_type, &mut self.proto_write_buffer)
        {
            Ok(()) => true,
            Err(ApiError::WouldBlock) => false,
            Err(err) => {
                self.on_fatal_error();
                if err == ApiError::SocketWriteFailed(io::ErrorKind::ConnectionReset) {
                    tracing::warn!("{}: Connection reset", self.client_combined_info);
                } else {
                    tracing::warn!("{}: Packet write failed {err}", self.client_combined_info);
                }
                false
            }
        }
    }

    // --- Failure ---

    fn on_unauthenticated_access(&mut self) {
        self.on_fatal_error();
        tracing::debug!(
            "{}: tried to access without authentication.",
            self.client_combined_info
        );
    }

    fn on_no_setup_connection(&mut self) {
        self.on_fatal_error();
        tracing::debug!(
            "{}: tried to access without full connection.",
            self.client_combined_info
        );
    }

    /// Close the transport and flag the connection for removal.
    pub fn on_fatal_error(&mut self) {
        let _ = self.helper.close();
        self.remove = true;
    }
}
