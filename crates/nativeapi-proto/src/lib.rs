//! Wire schema for the native API: field-tagged encoding and the fixed message catalog.

pub mod codec;
pub mod enums;
pub mod messages;

pub use codec::{DecodeError, Field, FieldSink, FieldValue, ProtoReader, ProtoWriter, SizeCounter};
pub use enums::{ColorMode, EntityCategory, LogLevel, SensorStateClass};
pub use messages::*;

/// API version reported in the hello response.
pub const API_VERSION_MAJOR: u32 = 1;
/// API version reported in the hello response.
pub const API_VERSION_MINOR: u32 = 10;
