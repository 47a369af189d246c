//! Device side of the native API.
//!
//! An [`ApiServer`] accepts clients and owns one [`ApiConnection`] per
//! client. Every connection is advanced by [`ApiServer::tick`] on a single
//! main loop: no connection ever blocks and no per-client task exists.
//! Entities live in an [`EntityRegistry`]; state changes travel over the
//! [`StateBus`] and reach subscribed clients on the next tick.

pub mod connection;
pub mod context;
pub mod deferred;
pub mod entity;
pub mod iterator;
pub mod server;

#[cfg(test)]
mod testing;

pub use connection::{ApiConnection, ConnectionState};
pub use context::{ApiContext, DeviceIdentity, KEEPALIVE_TIMEOUT_MS, PskSaver, PskStore};
pub use deferred::{DeferredMessage, DeferredMessageQueue, Sendable};
pub use entity::{
    BinarySensor, Entities, EntityInfo, EntityRef, EntityRegistry, Light, LightCall, LightTraits,
    LightValues, Sensor, SensorTraits, StateBus, Switch, SwitchWriter, TextSensor,
    object_id_from_name, object_id_hash,
};
pub use iterator::{EntityIterator, IteratorStep};
pub use server::{ApiServer, ServerConfig};
