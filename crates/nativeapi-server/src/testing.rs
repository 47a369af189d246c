//! In-memory client used by the unit tests.

use std::sync::Arc;

use nativeapi_net::{MemoryPeer, MemorySocket, PlaintextFrameHelper};
use nativeapi_proto::codec::{encode_varint, parse_varint};
use nativeapi_proto::{
    ColorMode, ConnectRequest, HelloRequest, ProtoMessage, SensorStateClass,
};
use nativeapi_scheduler::ManualClock;

use crate::connection::ApiConnection;
use crate::context::{ApiContext, DeviceIdentity};
use crate::entity::{
    BinarySensor, Entities, EntityInfo, Light, LightTraits, Sensor, SensorTraits, StateBus,
    Switch,
};

pub(crate) const PEER: &str = "192.168.1.50:40000";
pub(crate) const DEVICE_NAME: &str = "test-device";

/// Plaintext-frame a message the way a client would.
pub(crate) fn frame<M: ProtoMessage>(msg: &M) -> Vec<u8> {
    let mut body = Vec::new();
    msg.encode_to(&mut body);
    let mut out = vec![0x00];
    encode_varint(body.len() as u64, &mut out);
    encode_varint(u64::from(M::MESSAGE_TYPE), &mut out);
    out.extend_from_slice(&body);
    out
}

/// Split a plaintext byte stream into `(type, payload)` frames.
pub(crate) fn parse_frames(mut bytes: &[u8]) -> Vec<(u16, Vec<u8>)> {
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        assert_eq!(bytes[0], 0x00, "plaintext indicator");
        let (len, used) = parse_varint(&bytes[1..]).expect("length varint");
        let mut at = 1 + used;
        let (ty, used) = parse_varint(&bytes[at..]).expect("type varint");
        at += used;
        let end = at + len as usize;
        frames.push((ty as u16, bytes[at..end].to_vec()));
        bytes = &bytes[end..];
    }
    frames
}

/// Entities every test device carries.
pub(crate) struct TestEntities {
    pub sensor: Arc<Sensor>,
    pub status: Arc<BinarySensor>,
    pub relay: Arc<Switch>,
    pub light: Arc<Light>,
}

pub(crate) fn test_entities(states: &StateBus) -> (Entities, TestEntities) {
    let mut entities = Entities::new(states.clone());
    let sensor = entities.add_sensor(
        EntityInfo::new("Temperature").with_device_class("temperature"),
        SensorTraits {
            unit_of_measurement: "°C".into(),
            accuracy_decimals: 1,
            force_update: false,
            state_class: SensorStateClass::Measurement,
        },
    );
    entities.add_text_sensor(EntityInfo::new("Hidden").internal(true));
    let status = entities.add_binary_sensor(EntityInfo::new("Status"), true);
    let relay = entities.add_switch(EntityInfo::new("Relay"), false, None);
    let light = entities.add_light(
        EntityInfo::new("Lamp"),
        LightTraits {
            supported_color_modes: vec![ColorMode::Rgb, ColorMode::ColorTemperature],
            min_mireds: 153.0,
            max_mireds: 500.0,
            effects: vec!["Rainbow".into()],
        },
    );
    (
        entities,
        TestEntities {
            sensor,
            status,
            relay,
            light,
        },
    )
}

pub(crate) fn test_context(password: &str) -> (Arc<ApiContext>, Arc<ManualClock>, TestEntities) {
    build_context(password, |ctx| ctx)
}

/// [`test_context`] with a hook for extra builder calls.
pub(crate) fn build_context(
    password: &str,
    customize: impl FnOnce(ApiContext) -> ApiContext,
) -> (Arc<ApiContext>, Arc<ManualClock>, TestEntities) {
    let states = StateBus::new();
    let (entities, handles) = test_entities(&states);
    let clock = Arc::new(ManualClock::new(1_000));
    let device = DeviceIdentity {
        name: DEVICE_NAME.to_string(),
        ..Default::default()
    };
    let ctx = ApiContext::new(device, Arc::new(entities), states, clock.clone())
        .with_password(password);
    (Arc::new(customize(ctx)), clock, handles)
}

/// A started plaintext connection plus the client end of its socket.
pub(crate) struct Harness {
    pub conn: ApiConnection,
    pub peer: MemoryPeer,
    pub clock: Arc<ManualClock>,
    pub ctx: Arc<ApiContext>,
    pub entities: TestEntities,
}

impl Harness {
    pub fn new(password: &str) -> Self {
        let (ctx, clock, entities) = test_context(password);
        let (socket, peer) = MemorySocket::new(PEER);
        let mut conn = ApiConnection::new(
            Box::new(PlaintextFrameHelper::new(Box::new(socket))),
            Arc::clone(&ctx),
        );
        conn.start();
        Self {
            conn,
            peer,
            clock,
            ctx,
            entities,
        }
    }

    pub fn send<M: ProtoMessage>(&self, msg: &M) {
        self.peer.send(&frame(msg));
    }

    /// Deliver `msg` and run one tick, which reads exactly one packet.
    pub fn request<M: ProtoMessage>(&mut self, msg: &M) {
        self.send(msg);
        self.conn.tick();
    }

    pub fn received(&self) -> Vec<(u16, Vec<u8>)> {
        parse_frames(&self.peer.take_written())
    }

    pub fn ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.conn.tick();
        }
    }

    /// Hello plus a successful connect. Discards the responses.
    pub fn authenticate(&mut self, password: &str) {
        self.request(&HelloRequest {
            client_info: "test".into(),
            api_version_major: 1,
            api_version_minor: 10,
        });
        self.request(&ConnectRequest {
            password: password.into(),
        });
        self.received();
    }
}

/// Decode the single frame of type `M` in `frames`.
pub(crate) fn only<M: ProtoMessage>(frames: &[(u16, Vec<u8>)]) -> M {
    let matching: Vec<&(u16, Vec<u8>)> = frames
        .iter()
        .filter(|(ty, _)| *ty == M::MESSAGE_TYPE)
        .collect();
    assert_eq!(matching.len(), 1, "expected exactly one {}", M::NAME);
    M::decode(&matching[0].1).expect("decodable")
}
