//! Entities exposed over the API and the registry that indexes them.
//!
//! Every entity carries a static [`EntityInfo`] and a thread-safe state
//! cell. Publishing a new state records the entity's key on the shared
//! [`StateBus`]; the server drains the bus once per tick and forwards the
//! entity's *current* state to every subscribed connection.

use std::collections::HashMap;
use std::sync::Arc;

use nativeapi_proto::{ColorMode, EntityCategory, SensorStateClass};
use parking_lot::Mutex;

/// 32-bit FNV-1 hash of an object id. This is the entity key on the wire.
pub fn object_id_hash(object_id: &str) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for byte in object_id.bytes() {
        hash = hash.wrapping_mul(16_777_619);
        hash ^= u32::from(byte);
    }
    hash
}

/// Derive an object id from a display name: lowercase snake case with
/// anything outside `[a-z0-9_-]` replaced by `_`.
pub fn object_id_from_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            match c {
                ' ' => '_',
                'a'..='z' | '0'..='9' | '_' | '-' => c,
                _ => '_',
            }
        })
        .collect()
}

/// Description shared by all entity kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityInfo {
    pub object_id: String,
    pub name: String,
    pub key: u32,
    pub icon: String,
    pub device_class: String,
    pub disabled_by_default: bool,
    pub entity_category: EntityCategory,
    /// Internal entities are never listed nor streamed to clients.
    pub internal: bool,
}

impl EntityInfo {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let object_id = object_id_from_name(&name);
        Self {
            key: object_id_hash(&object_id),
            object_id,
            name,
            icon: String::new(),
            device_class: String::new(),
            disabled_by_default: false,
            entity_category: EntityCategory::None,
            internal: false,
        }
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = icon.into();
        self
    }

    pub fn with_device_class(mut self, device_class: impl Into<String>) -> Self {
        self.device_class = device_class.into();
        self
    }

    pub fn with_category(mut self, category: EntityCategory) -> Self {
        self.entity_category = category;
        self
    }

    pub fn disabled_by_default(mut self, disabled: bool) -> Self {
        self.disabled_by_default = disabled;
        self
    }

    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }
}

// ---------------------------------------------------------------------------
// State bus
// ---------------------------------------------------------------------------

/// Keys of entities whose state changed since the last drain.
///
/// A key is queued at most once; the consumer reads the latest state anyway.
#[derive(Debug, Clone, Default)]
pub struct StateBus {
    pending: Arc<Mutex<Vec<u32>>>,
}

impl StateBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, key: u32) {
        let mut pending = self.pending.lock();
        if !pending.contains(&key) {
            pending.push(key);
        }
    }

    /// Take every queued key in publish order.
    pub fn drain(&self) -> Vec<u32> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Entity kinds
// ---------------------------------------------------------------------------

/// On/off sensor.
#[derive(Debug)]
pub struct BinarySensor {
    info: EntityInfo,
    is_status: bool,
    state: Mutex<Option<bool>>,
    bus: StateBus,
}

impl BinarySensor {
    pub fn info(&self) -> &EntityInfo {
        &self.info
    }

    /// Whether this sensor reports device connectivity.
    pub fn is_status_binary_sensor(&self) -> bool {
        self.is_status
    }

    pub fn state(&self) -> Option<bool> {
        *self.state.lock()
    }

    pub fn publish_state(&self, state: bool) {
        *self.state.lock() = Some(state);
        tracing::debug!("'{}': Sending state {}", self.info.name, if state { "ON" } else { "OFF" });
        self.bus.publish(self.info.key);
    }
}

/// Numeric sensor settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorTraits {
    pub unit_of_measurement: String,
    pub accuracy_decimals: i32,
    pub force_update: bool,
    pub state_class: SensorStateClass,
}

/// Numeric sensor. A missing state reads as NaN.
#[derive(Debug)]
pub struct Sensor {
    info: EntityInfo,
    traits: SensorTraits,
    state: Mutex<Option<f32>>,
    bus: StateBus,
}

impl Sensor {
    pub fn info(&self) -> &EntityInfo {
        &self.info
    }

    pub fn traits(&self) -> &SensorTraits {
        &self.traits
    }

    pub fn has_state(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn state(&self) -> f32 {
        self.state.lock().unwrap_or(f32::NAN)
    }

    pub fn publish_state(&self, state: f32) {
        *self.state.lock() = Some(state);
        tracing::debug!(
            "'{}': Sending state {:.*} {}",
            self.info.name,
            self.traits.accuracy_decimals.max(0) as usize,
            state,
            self.traits.unit_of_measurement
        );
        self.bus.publish(self.info.key);
    }
}

/// Called with the requested switch state; returns the state actually reached.
pub type SwitchWriter = Box<dyn Fn(bool) -> bool + Send + Sync>;

/// Controllable on/off output.
pub struct Switch {
    info: EntityInfo,
    assumed_state: bool,
    state: Mutex<bool>,
    writer: Option<SwitchWriter>,
    bus: StateBus,
}

impl std::fmt::Debug for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switch")
            .field("info", &self.info)
            .field("assumed_state", &self.assumed_state)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Switch {
    pub fn info(&self) -> &EntityInfo {
        &self.info
    }

    pub fn assumed_state(&self) -> bool {
        self.assumed_state
    }

    pub fn state(&self) -> bool {
        *self.state.lock()
    }

    pub fn turn_on(&self) {
        self.write_state(true);
    }

    pub fn turn_off(&self) {
        self.write_state(false);
    }

    /// Drive the output. Without a writer the new state is published as-is.
    pub fn write_state(&self, state: bool) {
        tracing::debug!("'{}' Turning {}.", self.info.name, if state { "ON" } else { "OFF" });
        let reached = match &self.writer {
            Some(writer) => writer(state),
            None => state,
        };
        self.publish_state(reached);
    }

    pub fn publish_state(&self, state: bool) {
        *self.state.lock() = state;
        self.bus.publish(self.info.key);
    }
}

/// Free-form text sensor.
#[derive(Debug)]
pub struct TextSensor {
    info: EntityInfo,
    state: Mutex<Option<String>>,
    bus: StateBus,
}

impl TextSensor {
    pub fn info(&self) -> &EntityInfo {
        &self.info
    }

    pub fn has_state(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn state(&self) -> String {
        self.state.lock().clone().unwrap_or_default()
    }

    pub fn publish_state(&self, state: impl Into<String>) {
        let state = state.into();
        tracing::debug!("'{}': Sending state '{}'", self.info.name, state);
        *self.state.lock() = Some(state);
        self.bus.publish(self.info.key);
    }
}

// --- Light ---

const CAPABILITY_BRIGHTNESS: u32 = 1 << 1;
const CAPABILITY_COLOR_TEMPERATURE: u32 = 1 << 3;
const CAPABILITY_COLD_WARM_WHITE: u32 = 1 << 4;

/// Static capabilities of a light.
#[derive(Debug, Clone, PartialEq)]
pub struct LightTraits {
    pub supported_color_modes: Vec<ColorMode>,
    pub min_mireds: f32,
    pub max_mireds: f32,
    /// Effect names, not counting the implicit "None".
    pub effects: Vec<String>,
}

impl Default for LightTraits {
    fn default() -> Self {
        Self {
            supported_color_modes: vec![ColorMode::OnOff],
            min_mireds: 0.0,
            max_mireds: 0.0,
            effects: Vec::new(),
        }
    }
}

impl LightTraits {
    fn supports_capability(&self, capability: u32) -> bool {
        self.supported_color_modes
            .iter()
            .any(|mode| u32::from(*mode) & capability != 0)
    }

    pub fn supports_color_temperature(&self) -> bool {
        self.supports_capability(CAPABILITY_COLOR_TEMPERATURE)
            || self.supports_capability(CAPABILITY_COLD_WARM_WHITE)
    }

    pub fn supports_brightness(&self) -> bool {
        self.supports_capability(CAPABILITY_BRIGHTNESS)
    }
}

/// Current output values of a light. Channels are in `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct LightValues {
    pub state: bool,
    pub brightness: f32,
    pub color_mode: ColorMode,
    pub color_brightness: f32,
    pub red: f32,
    pub green: f32,
    pub blue: f32,
    pub white: f32,
    pub color_temperature: f32,
    pub cold_white: f32,
    pub warm_white: f32,
    /// Active effect, empty when none.
    pub effect: String,
}

impl Default for LightValues {
    fn default() -> Self {
        Self {
            state: false,
            brightness: 1.0,
            color_mode: ColorMode::Unknown,
            color_brightness: 1.0,
            red: 1.0,
            green: 1.0,
            blue: 1.0,
            white: 1.0,
            color_temperature: 0.0,
            cold_white: 1.0,
            warm_white: 1.0,
            effect: String::new(),
        }
    }
}

/// Dimmable, possibly colored light.
#[derive(Debug)]
pub struct Light {
    info: EntityInfo,
    traits: LightTraits,
    values: Mutex<LightValues>,
    bus: StateBus,
}

impl Light {
    pub fn info(&self) -> &EntityInfo {
        &self.info
    }

    pub fn traits(&self) -> &LightTraits {
        &self.traits
    }

    pub fn values(&self) -> LightValues {
        self.values.lock().clone()
    }

    /// Start a state change. Nothing happens until [`LightCall::perform`].
    pub fn make_call(&self) -> LightCall<'_> {
        LightCall::empty(self)
    }
}

/// Pending light state change. Unset fields keep their current value.
#[derive(Debug)]
pub struct LightCall<'a> {
    light: &'a Light,
    pub state: Option<bool>,
    pub brightness: Option<f32>,
    pub color_mode: Option<ColorMode>,
    pub color_brightness: Option<f32>,
    pub red: Option<f32>,
    pub green: Option<f32>,
    pub blue: Option<f32>,
    pub white: Option<f32>,
    pub color_temperature: Option<f32>,
    pub cold_white: Option<f32>,
    pub warm_white: Option<f32>,
    pub transition_length: Option<u32>,
    pub flash_length: Option<u32>,
    pub effect: Option<String>,
}

impl<'a> LightCall<'a> {
    fn empty(light: &'a Light) -> Self {
        Self {
            light,
            state: None,
            brightness: None,
            color_mode: None,
            color_brightness: None,
            red: None,
            green: None,
            blue: None,
            white: None,
            color_temperature: None,
            cold_white: None,
            warm_white: None,
            transition_length: None,
            flash_length: None,
            effect: None,
        }
    }

    /// Apply the call and publish the resulting values.
    pub fn perform(self) {
        let light = self.light;
        let name = &light.info.name;
        let mut values = light.values.lock();

        if let Some(mode) = self.color_mode {
            if light.traits.supported_color_modes.contains(&mode) {
                values.color_mode = mode;
            } else {
                tracing::warn!("'{name}': Color mode {mode:?} is not supported");
            }
        }
        if let Some(state) = self.state {
            values.state = state;
        }
        let unit = |v: f32| v.clamp(0.0, 1.0);
        if let Some(v) = self.brightness {
            values.brightness = unit(v);
        }
        if let Some(v) = self.color_brightness {
            values.color_brightness = unit(v);
        }
        if let Some(v) = self.red {
            values.red = unit(v);
        }
        if let Some(v) = self.green {
            values.green = unit(v);
        }
        if let Some(v) = self.blue {
            values.blue = unit(v);
        }
        if let Some(v) = self.white {
            values.white = unit(v);
        }
        if let Some(v) = self.color_temperature {
            values.color_temperature = if light.traits.supports_color_temperature() {
                v.clamp(light.traits.min_mireds, light.traits.max_mireds)
            } else {
                v
            };
        }
        if let Some(v) = self.cold_white {
            values.cold_white = unit(v);
        }
        if let Some(v) = self.warm_white {
            values.warm_white = unit(v);
        }
        if let Some(effect) = self.effect {
            if effect.eq_ignore_ascii_case("none") {
                values.effect.clear();
            } else if let Some(known) = light
                .traits
                .effects
                .iter()
                .find(|e| e.eq_ignore_ascii_case(&effect))
            {
                values.effect = known.clone();
            } else {
                tracing::warn!("'{name}': Unknown effect '{effect}'");
            }
        }
        if let Some(ms) = self.transition_length {
            tracing::debug!("'{name}': Transition length {ms} ms");
        }
        if let Some(ms) = self.flash_length {
            tracing::debug!("'{name}': Flash length {ms} ms");
        }
        tracing::debug!("'{name}': Setting state {}", if values.state { "ON" } else { "OFF" });
        drop(values);
        light.bus.publish(light.info.key);
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Shared handle to any entity kind.
#[derive(Debug, Clone)]
pub enum EntityRef {
    BinarySensor(Arc<BinarySensor>),
    Sensor(Arc<Sensor>),
    Switch(Arc<Switch>),
    TextSensor(Arc<TextSensor>),
    Light(Arc<Light>),
}

impl EntityRef {
    pub fn info(&self) -> &EntityInfo {
        match self {
            Self::BinarySensor(e) => e.info(),
            Self::Sensor(e) => e.info(),
            Self::Switch(e) => e.info(),
            Self::TextSensor(e) => e.info(),
            Self::Light(e) => e.info(),
        }
    }

    pub fn key(&self) -> u32 {
        self.info().key
    }

    /// Component type used to build default unique ids.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BinarySensor(_) => "binary_sensor",
            Self::Sensor(_) => "sensor",
            Self::Switch(_) => "switch",
            Self::TextSensor(_) => "text_sensor",
            Self::Light(_) => "light",
        }
    }

    /// Identity comparison: both handles point at the same entity.
    pub fn same(&self, other: &EntityRef) -> bool {
        match (self, other) {
            (Self::BinarySensor(a), Self::BinarySensor(b)) => Arc::ptr_eq(a, b),
            (Self::Sensor(a), Self::Sensor(b)) => Arc::ptr_eq(a, b),
            (Self::Switch(a), Self::Switch(b)) => Arc::ptr_eq(a, b),
            (Self::TextSensor(a), Self::TextSensor(b)) => Arc::ptr_eq(a, b),
            (Self::Light(a), Self::Light(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Lookup surface the connection needs from the device's entity set.
pub trait EntityRegistry: Send + Sync {
    /// All entities in listing order.
    fn entities(&self) -> &[EntityRef];

    /// Find an entity by its key.
    fn get(&self, key: u32) -> Option<&EntityRef>;
}

/// Ordered entity list with a key index.
#[derive(Debug, Default)]
pub struct Entities {
    list: Vec<EntityRef>,
    by_key: HashMap<u32, usize>,
    bus: StateBus,
}

impl Entities {
    pub fn new(bus: StateBus) -> Self {
        Self {
            list: Vec::new(),
            by_key: HashMap::new(),
            bus,
        }
    }

    pub fn bus(&self) -> &StateBus {
        &self.bus
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    fn register(&mut self, entity: EntityRef) {
        let key = entity.key();
        if self.by_key.contains_key(&key) {
            tracing::warn!(
                "Entity '{}' has the same key as an existing entity, commands will reach the first one",
                entity.info().object_id
            );
        } else {
            self.by_key.insert(key, self.list.len());
        }
        self.list.push(entity);
    }

    pub fn add_binary_sensor(&mut self, info: EntityInfo, is_status: bool) -> Arc<BinarySensor> {
        let entity = Arc::new(BinarySensor {
            info,
            is_status,
            state: Mutex::new(None),
            bus: self.bus.clone(),
        });
        self.register(EntityRef::BinarySensor(Arc::clone(&entity)));
        entity
    }

    pub fn add_sensor(&mut self, info: EntityInfo, traits: SensorTraits) -> Arc<Sensor> {
        let entity = Arc::new(Sensor {
            info,
            traits,
            state: Mutex::new(None),
            bus: self.bus.clone(),
        });
        self.register(EntityRef::Sensor(Arc::clone(&entity)));
        entity
    }

    pub fn add_switch(
        &mut self,
        info: EntityInfo,
        assumed_state: bool,
        writer: Option<SwitchWriter>,
    ) -> Arc<Switch> {
        let entity = Arc::new(Switch {
            info,
            assumed_state,
            state: Mutex::new(false),
            writer,
            bus: self.bus.clone(),
        });
        self.register(EntityRef::Switch(Arc::clone(&entity)));
        entity
    }

    pub fn add_text_sensor(&mut self, info: EntityInfo) -> Arc<TextSensor> {
        let entity = Arc::new(TextSensor {
            info,
            state: Mutex::new(None),
            bus: self.bus.clone(),
        });
        self.register(EntityRef::TextSensor(Arc::clone(&entity)));
        entity
    }

    pub fn add_light(&mut self, info: EntityInfo, traits: LightTraits) -> Arc<Light> {
        let entity = Arc::new(Light {
            info,
            traits,
            values: Mutex::new(LightValues::default()),
            bus: self.bus.clone(),
        });
        self.register(EntityRef::Light(Arc::clone(&entity)));
        entity
    }
}

impl EntityRegistry for Entities {
    fn entities(&self) -> &[EntityRef] {
        &self.list
    }

    fn get(&self, key: u32) -> Option<&EntityRef> {
        self.by_key.get(&key).and_then(|&idx| self.list.get(idx))
    }
}
