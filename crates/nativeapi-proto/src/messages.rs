//! Message catalog.
//!
//! Each message is declared once with its numeric type tag and field layout;
//! the [`proto_message!`] macro expands that into the struct plus its
//! [`ProtoMessage`] impl.

use crate::codec::{DecodeError, Field, FieldSink, ProtoReader, ProtoWriter, SizeCounter};
use crate::enums::{ColorMode, EntityCategory, LogLevel, SensorStateClass};

/// A message with a fixed type tag in the catalog.
pub trait ProtoMessage: Default {
    /// Numeric tag carried in the frame header.
    const MESSAGE_TYPE: u16;
    /// Message name for log lines.
    const NAME: &'static str;

    /// Write every non-default field to `sink`.
    fn encode<S: FieldSink>(&self, _sink: &mut S) {}

    /// Merge one decoded field into `self`. Unknown field numbers are ignored.
    fn decode_field(&mut self, _field: Field<'_>) -> Result<(), DecodeError> {
        Ok(())
    }

    /// Decode a whole message body.
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut msg = Self::default();
        let mut reader = ProtoReader::new(bytes);
        while let Some(field) = reader.next_field()? {
            msg.decode_field(field)?;
        }
        Ok(msg)
    }

    /// Size of the encoded body in bytes.
    fn encoded_len(&self) -> usize {
        let mut counter = SizeCounter::default();
        self.encode(&mut counter);
        counter.total
    }

    /// Append the encoded body to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.encode(&mut ProtoWriter::new(buf));
    }
}

macro_rules! encode_field {
    ($sink:ident, $num:literal, $v:expr, uint32) => {
        $sink.encode_uint32($num, $v, false)
    };
    ($sink:ident, $num:literal, $v:expr, int32) => {
        $sink.encode_int32($num, $v, false)
    };
    ($sink:ident, $num:literal, $v:expr, bool) => {
        $sink.encode_bool($num, $v, false)
    };
    ($sink:ident, $num:literal, $v:expr, fixed32) => {
        $sink.encode_fixed32($num, $v, false)
    };
    ($sink:ident, $num:literal, $v:expr, float) => {
        $sink.encode_float($num, $v, false)
    };
    ($sink:ident, $num:literal, $v:expr, string) => {
        $sink.encode_string($num, &$v, false)
    };
    ($sink:ident, $num:literal, $v:expr, bytes) => {
        $sink.encode_bytes($num, &$v, false)
    };
    ($sink:ident, $num:literal, $v:expr, enumeration) => {
        $sink.encode_uint32($num, u32::from($v), false)
    };
    ($sink:ident, $num:literal, $v:expr, repeated_string) => {
        for item in &$v {
            $sink.encode_string($num, item, true);
        }
    };
    ($sink:ident, $num:literal, $v:expr, repeated_enumeration) => {
        for item in &$v {
            $sink.encode_uint32($num, u32::from(*item), true);
        }
    };
}

macro_rules! decode_field {
    ($f:ident, $target:expr, uint32) => {
        $target = $f.as_u32()
    };
    ($f:ident, $target:expr, int32) => {
        $target = $f.as_i32()
    };
    ($f:ident, $target:expr, bool) => {
        $target = $f.as_bool()
    };
    ($f:ident, $target:expr, fixed32) => {
        $target = $f.as_fixed32()
    };
    ($f:ident, $target:expr, float) => {
        $target = $f.as_float()
    };
    ($f:ident, $target:expr, string) => {
        $target = $f.as_string()?
    };
    ($f:ident, $target:expr, bytes) => {
        $target = $f.as_bytes().to_vec()
    };
    ($f:ident, $target:expr, enumeration) => {
        $target = $f.as_u32().into()
    };
    ($f:ident, $target:expr, repeated_string) => {
        $target.push($f.as_string()?)
    };
    ($f:ident, $target:expr, repeated_enumeration) => {
        $target.push($f.as_u32().into())
    };
}

macro_rules! proto_message {
    (
        $(#[$meta:meta])*
        $name:ident = $id:literal {}
    ) => {
        $(#[$meta])*
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct $name;

        impl ProtoMessage for $name {
            const MESSAGE_TYPE: u16 = $id;
            const NAME: &'static str = stringify!($name);
        }
    };
    (
        $(#[$meta:meta])*
        $name:ident = $id:literal {
            $( $(#[$fmeta:meta])* $num:literal => $field:ident : $ty:ty as $kind:ident, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Default, Clone, PartialEq)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty, )+
        }

        impl ProtoMessage for $name {
            const MESSAGE_TYPE: u16 = $id;
            const NAME: &'static str = stringify!($name);

            fn encode<S: FieldSink>(&self, sink: &mut S) {
                $( encode_field!(sink, $num, self.$field, $kind); )+
            }

            fn decode_field(&mut self, field: Field<'_>) -> Result<(), DecodeError> {
                match field.number {
                    $( $num => decode_field!(field, self.$field, $kind), )+
                    _ => {}
                }
                Ok(())
            }
        }
    };
}

// --- Connection setup ---

proto_message! {
    /// First message of every session, sent by the client.
    HelloRequest = 1 {
        1 => client_info: String as string,
        2 => api_version_major: u32 as uint32,
        3 => api_version_minor: u32 as uint32,
    }
}

proto_message! {
    /// Server's answer to [`HelloRequest`].
    HelloResponse = 2 {
        1 => api_version_major: u32 as uint32,
        2 => api_version_minor: u32 as uint32,
        3 => server_info: String as string,
        4 => name: String as string,
    }
}

proto_message! {
    /// Password login.
    ConnectRequest = 3 {
        1 => password: String as string,
    }
}

proto_message! {
    ConnectResponse = 4 {
        1 => invalid_password: bool as bool,
    }
}

proto_message! {
    /// Either side asks the other to close.
    DisconnectRequest = 5 {}
}

proto_message! {
    DisconnectResponse = 6 {}
}

proto_message! {
    /// Keepalive probe, sent by either side.
    PingRequest = 7 {}
}

proto_message! {
    PingResponse = 8 {}
}

proto_message! {
    DeviceInfoRequest = 9 {}
}

proto_message! {
    /// Static identity of the device.
    DeviceInfoResponse = 10 {
        1 => uses_password: bool as bool,
        2 => name: String as string,
        3 => mac_address: String as string,
        4 => esphome_version: String as string,
        5 => compilation_time: String as string,
        6 => model: String as string,
        7 => has_deep_sleep: bool as bool,
        8 => project_name: String as string,
        9 => project_version: String as string,
        10 => webserver_port: u32 as uint32,
        12 => manufacturer: String as string,
        13 => friendly_name: String as string,
        16 => suggested_area: String as string,
        19 => api_encryption_supported: bool as bool,
    }
}

// --- Entity listing ---

proto_message! {
    /// Starts the list-entities iterator.
    ListEntitiesRequest = 11 {}
}

proto_message! {
    ListEntitiesBinarySensorResponse = 12 {
        1 => object_id: String as string,
        2 => key: u32 as fixed32,
        3 => name: String as string,
        4 => unique_id: String as string,
        5 => device_class: String as string,
        6 => is_status_binary_sensor: bool as bool,
        7 => disabled_by_default: bool as bool,
        8 => icon: String as string,
        9 => entity_category: EntityCategory as enumeration,
    }
}

proto_message! {
    ListEntitiesLightResponse = 15 {
        1 => object_id: String as string,
        2 => key: u32 as fixed32,
        3 => name: String as string,
        4 => unique_id: String as string,
        12 => supported_color_modes: Vec<ColorMode> as repeated_enumeration,
        9 => min_mireds: f32 as float,
        10 => max_mireds: f32 as float,
        11 => effects: Vec<String> as repeated_string,
        13 => disabled_by_default: bool as bool,
        14 => icon: String as string,
        15 => entity_category: EntityCategory as enumeration,
    }
}

proto_message! {
    ListEntitiesSensorResponse = 16 {
        1 => object_id: String as string,
        2 => key: u32 as fixed32,
        3 => name: String as string,
        4 => unique_id: String as string,
        5 => icon: String as string,
        6 => unit_of_measurement: String as string,
        7 => accuracy_decimals: i32 as int32,
        8 => force_update: bool as bool,
        9 => device_class: String as string,
        10 => state_class: SensorStateClass as enumeration,
        12 => disabled_by_default: bool as bool,
        13 => entity_category: EntityCategory as enumeration,
    }
}

proto_message! {
    ListEntitiesSwitchResponse = 17 {
        1 => object_id: String as string,
        2 => key: u32 as fixed32,
        3 => name: String as string,
        4 => unique_id: String as string,
        5 => icon: String as string,
        6 => assumed_state: bool as bool,
        7 => disabled_by_default: bool as bool,
        8 => entity_category: EntityCategory as enumeration,
        9 => device_class: String as string,
    }
}

proto_message! {
    ListEntitiesTextSensorResponse = 18 {
        1 => object_id: String as string,
        2 => key: u32 as fixed32,
        3 => name: String as string,
        4 => unique_id: String as string,
        5 => icon: String as string,
        6 => disabled_by_default: bool as bool,
        7 => entity_category: EntityCategory as enumeration,
        8 => device_class: String as string,
    }
}

proto_message! {
    /// Marks the end of the entity list.
    ListEntitiesDoneResponse = 19 {}
}

// --- State ---

proto_message! {
    /// Starts the initial-state iterator and live state forwarding.
    SubscribeStatesRequest = 20 {}
}

proto_message! {
    BinarySensorStateResponse = 21 {
        1 => key: u32 as fixed32,
        2 => state: bool as bool,
        3 => missing_state: bool as bool,
    }
}

proto_message! {
    LightStateResponse = 24 {
        1 => key: u32 as fixed32,
        2 => state: bool as bool,
        3 => brightness: f32 as float,
        11 => color_mode: ColorMode as enumeration,
        10 => color_brightness: f32 as float,
        4 => red: f32 as float,
        5 => green: f32 as float,
        6 => blue: f32 as float,
        7 => white: f32 as float,
        8 => color_temperature: f32 as float,
        12 => cold_white: f32 as float,
        13 => warm_white: f32 as float,
        9 => effect: String as string,
    }
}

proto_message! {
    SensorStateResponse = 25 {
        1 => key: u32 as fixed32,
        2 => state: f32 as float,
        3 => missing_state: bool as bool,
    }
}

proto_message! {
    SwitchStateResponse = 26 {
        1 => key: u32 as fixed32,
        2 => state: bool as bool,
    }
}

proto_message! {
    TextSensorStateResponse = 27 {
        1 => key: u32 as fixed32,
        2 => state: String as string,
        3 => missing_state: bool as bool,
    }
}

// --- Logs ---

proto_message! {
    SubscribeLogsRequest = 28 {
        1 => level: LogLevel as enumeration,
        2 => dump_config: bool as bool,
    }
}

proto_message! {
    /// One forwarded log line.
    SubscribeLogsResponse = 29 {
        1 => level: LogLevel as enumeration,
        3 => message: Vec<u8> as bytes,
        4 => send_failed: bool as bool,
    }
}

// --- Commands ---

proto_message! {
    /// Each value is only applied when its `has_*` flag is set.
    LightCommandRequest = 32 {
        1 => key: u32 as fixed32,
        2 => has_state: bool as bool,
        3 => state: bool as bool,
        4 => has_brightness: bool as bool,
        5 => brightness: f32 as float,
        22 => has_color_mode: bool as bool,
        23 => color_mode: ColorMode as enumeration,
        20 => has_color_brightness: bool as bool,
        21 => color_brightness: f32 as float,
        6 => has_rgb: bool as bool,
        7 => red: f32 as float,
        8 => green: f32 as float,
        9 => blue: f32 as float,
        10 => has_white: bool as bool,
        11 => white: f32 as float,
        12 => has_color_temperature: bool as bool,
        13 => color_temperature: f32 as float,
        24 => has_cold_white: bool as bool,
        25 => cold_white: f32 as float,
        26 => has_warm_white: bool as bool,
        27 => warm_white: f32 as float,
        14 => has_transition_length: bool as bool,
        15 => transition_length: u32 as uint32,
        16 => has_flash_length: bool as bool,
        17 => flash_length: u32 as uint32,
        18 => has_effect: bool as bool,
        19 => effect: String as string,
    }
}

proto_message! {
    SwitchCommandRequest = 33 {
        1 => key: u32 as fixed32,
        2 => state: bool as bool,
    }
}

// --- Encryption ---

proto_message! {
    /// Replaces the Noise pre-shared key. `key` is base64 text.
    NoiseEncryptionSetKeyRequest = 124 {
        1 => key: Vec<u8> as bytes,
    }
}

proto_message! {
    NoiseEncryptionSetKeyResponse = 125 {
        1 => success: bool as bool,
    }
}
