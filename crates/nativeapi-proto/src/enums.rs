//! Enumerations shared by several messages.
//!
//! Values outside the known set decode to the enum's default rather than
//! failing, matching proto3's open-enum behaviour closely enough for a
//! server that only ever reads a handful of them.

macro_rules! proto_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value, )*
        }

        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                match value {
                    $( $value => Self::$variant, )*
                    _ => Self::default(),
                }
            }
        }

        impl From<$name> for u32 {
            fn from(value: $name) -> u32 {
                value as u32
            }
        }
    };
}

proto_enum! {
    /// Verbosity of a log line, ordered from quietest to noisiest.
    LogLevel {
        #[default]
        None = 0,
        Error = 1,
        Warn = 2,
        Info = 3,
        Config = 4,
        Debug = 5,
        Verbose = 6,
        VeryVerbose = 7,
    }
}

impl LogLevel {
    /// Whether a subscriber at `self` wants a line logged at `line`.
    pub fn admits(self, line: LogLevel) -> bool {
        line != LogLevel::None && u32::from(line) <= u32::from(self)
    }
}

proto_enum! {
    /// Where a client should surface an entity.
    EntityCategory {
        #[default]
        None = 0,
        Config = 1,
        Diagnostic = 2,
    }
}

proto_enum! {
    /// Color capability bitmask of a light, flattened into named modes.
    ColorMode {
        #[default]
        Unknown = 0,
        OnOff = 1,
        LegacyBrightness = 2,
        Brightness = 3,
        White = 7,
        ColorTemperature = 11,
        ColdWarmWhite = 19,
        Rgb = 35,
        RgbWhite = 39,
        RgbColorTemperature = 47,
        RgbColdWarmWhite = 51,
    }
}

proto_enum! {
    /// How a sensor's readings should be aggregated by the client.
    SensorStateClass {
        #[default]
        None = 0,
        Measurement = 1,
        TotalIncreasing = 2,
        Total = 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_value_falls_back_to_default() {
        assert_eq!(ColorMode::from(35), ColorMode::Rgb);
        assert_eq!(ColorMode::from(36), ColorMode::Unknown);
        assert_eq!(u32::from(ColorMode::RgbColdWarmWhite), 51);
    }

    #[test]
    fn test_log_level_admits() {
        assert!(LogLevel::Debug.admits(LogLevel::Info));
        assert!(LogLevel::Debug.admits(LogLevel::Debug));
        assert!(!LogLevel::Info.admits(LogLevel::Verbose));
        assert!(!LogLevel::VeryVerbose.admits(LogLevel::None));
    }
}
