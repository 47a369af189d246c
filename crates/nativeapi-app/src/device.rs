//! The demo device: entity set, identity and PSK persistence built from config.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nativeapi_config::{Config, ConfigError};
use nativeapi_log::LogTap;
use nativeapi_proto::{ColorMode, EntityCategory, SensorStateClass};
use nativeapi_scheduler::{Clock, MillisExtender, Scheduler};
use nativeapi_server::{
    ApiContext, BinarySensor, DeviceIdentity, Entities, EntityInfo, Light, LightTraits, PskSaver,
    PskStore, Sensor, SensorTraits, ServerConfig, StateBus, Switch, TextSensor,
};

use crate::AppError;

/// How often the uptime sensor reports.
pub const UPTIME_INTERVAL_MS: u32 = 60_000;

/// Handles to the entities the demo device exposes.
pub struct DemoEntities {
    pub uptime: Arc<Sensor>,
    pub status: Arc<BinarySensor>,
    pub relay: Arc<Switch>,
    pub light: Arc<Light>,
    pub version: Arc<TextSensor>,
}

pub fn demo_entities(states: &StateBus) -> (Entities, DemoEntities) {
    let mut entities = Entities::new(states.clone());
    let uptime = entities.add_sensor(
        EntityInfo::new("Uptime")
            .with_icon("mdi:timer-outline")
            .with_device_class("duration")
            .with_category(EntityCategory::Diagnostic),
        SensorTraits {
            unit_of_measurement: "s".into(),
            accuracy_decimals: 0,
            force_update: false,
            state_class: SensorStateClass::TotalIncreasing,
        },
    );
    let status = entities.add_binary_sensor(
        EntityInfo::new("Status")
            .with_device_class("connectivity")
            .with_category(EntityCategory::Diagnostic),
        true,
    );
    let relay = entities.add_switch(EntityInfo::new("Relay").with_icon("mdi:power"), false, None);
    let light = entities.add_light(
        EntityInfo::new("Desk Lamp"),
        LightTraits {
            supported_color_modes: vec![ColorMode::Rgb, ColorMode::ColorTemperature],
            min_mireds: 153.0,
            max_mireds: 500.0,
            effects: vec!["Rainbow".into(), "Strobe".into()],
        },
    );
    let version = entities.add_text_sensor(
        EntityInfo::new("Version")
            .with_icon("mdi:new-box")
            .with_category(EntityCategory::Diagnostic),
    );
    (
        entities,
        DemoEntities {
            uptime,
            status,
            relay,
            light,
            version,
        },
    )
}

pub fn device_identity(config: &Config) -> DeviceIdentity {
    let device = &config.device;
    DeviceIdentity {
        name: device.name.clone(),
        friendly_name: config.friendly_name().to_string(),
        mac_address: device.mac_address.clone(),
        model: device.model.clone(),
        manufacturer: device.manufacturer.clone(),
        suggested_area: device.suggested_area.clone(),
        project_name: device.project_name.clone(),
        project_version: device.project_version.clone(),
        ..Default::default()
    }
}

/// The configured key, plus a saver that writes new keys into `config.ron`.
///
/// The saver re-reads the file first so CLI overrides are never persisted.
pub fn psk_store(config: &Config, config_dir: &Path) -> Result<PskStore, ConfigError> {
    let active = config.api.decode_psk()?;
    let dir: PathBuf = config_dir.to_path_buf();
    let saver: PskSaver = Box::new(move |psk| {
        let result = Config::load_or_create(&dir).and_then(|mut on_disk| {
            on_disk.api.set_psk(psk);
            on_disk.save(&dir)
        });
        match result {
            Ok(()) => {
                tracing::info!("Encryption key written to {}", dir.join("config.ron").display());
                true
            }
            Err(e) => {
                tracing::warn!("Could not persist encryption key: {e}");
                false
            }
        }
    });
    Ok(PskStore::new(active).with_saver(saver))
}

/// Everything the server needs, built from the loaded config.
pub fn build_context(
    config: &Config,
    config_dir: &Path,
    clock: Arc<dyn Clock>,
    tap: Option<LogTap>,
) -> Result<(ApiContext, DemoEntities), ConfigError> {
    let states = StateBus::new();
    let (entities, demo) = demo_entities(&states);
    let mut ctx = ApiContext::new(device_identity(config), Arc::new(entities), states, clock)
        .with_password(config.api.password.clone())
        .with_psk(psk_store(config, config_dir)?)
        .with_keepalive_ms(config.api.keepalive_ms);
    if let Some(tap) = tap {
        ctx = ctx.with_log_tap(tap);
    }
    Ok((ctx, demo))
}

/// Publish the static states and start the periodic uptime report.
pub fn start_demo(scheduler: &Scheduler, demo: &DemoEntities, clock: Arc<dyn Clock>) {
    demo.status.publish_state(true);
    demo.version.publish_state(env!("CARGO_PKG_VERSION"));

    let uptime = Arc::clone(&demo.uptime);
    let mut millis = MillisExtender::default();
    scheduler.set_interval(None, "uptime", UPTIME_INTERVAL_MS, move || {
        let seconds = millis.extend(clock.millis()) / 1000;
        uptime.publish_state(seconds as f32);
    });
}

pub fn server_config(config: &Config) -> ServerConfig {
    ServerConfig {
        max_connections: config.api.max_connections,
        loop_interval: Duration::from_millis(config.api.loop_interval_ms.max(1)),
        ..Default::default()
    }
}

/// The listen address from `bind_address` and `port`.
pub fn listen_addr(config: &Config) -> Result<SocketAddr, AppError> {
    let ip: IpAddr = config
        .api
        .bind_address
        .parse()
        .map_err(|_| AppError::InvalidBindAddress(config.api.bind_address.clone()))?;
    Ok(SocketAddr::new(ip, config.api.port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nativeapi_scheduler::ManualClock;
    use nativeapi_server::EntityRegistry;

    const TEST_KEY: &str = "px7tsbK3C7bpXHr2OevEV2ZMg/FrNBw2+O2pNPbedtA=";

    #[test]
    fn test_demo_entities_have_distinct_keys() {
        let (entities, demo) = demo_entities(&StateBus::new());
        assert_eq!(entities.entities().len(), 5);
        let mut keys: Vec<u32> = entities.entities().iter().map(|e| e.key()).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), 5);
        assert!(entities.get(demo.relay.info().key).is_some());
        assert_eq!(demo.light.info().object_id, "desk_lamp");
    }

    #[test]
    fn test_context_follows_config() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.device.name = "porch".into();
        config.api.password = "pw".into();
        config.api.encryption_key = Some(TEST_KEY.into());
        config.api.keepalive_ms = 5_000;

        let clock = Arc::new(ManualClock::new(0));
        let (ctx, _) = build_context(&config, tmp.path(), clock, None).unwrap();
        assert_eq!(ctx.device.name, "porch");
        assert_eq!(ctx.device.friendly_name, "porch");
        assert!(ctx.uses_password());
        assert_eq!(ctx.keepalive_ms, 5_000);
        assert_eq!(ctx.psk.get().map(|k| k[0]), Some(0xa7));
        assert!(ctx.log_tap.is_none());
    }

    #[test]
    fn test_bad_key_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.api.encryption_key = Some("not base64!".into());
        let clock = Arc::new(ManualClock::new(0));
        let result = build_context(&config, tmp.path(), clock, None);
        assert!(matches!(result, Err(ConfigError::InvalidEncryptionKey(_))));
    }

    #[test]
    fn test_saved_key_lands_in_config_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut on_disk = Config::default();
        on_disk.device.name = "from-file".into();
        on_disk.save(tmp.path()).unwrap();

        // CLI-style override that must not be written back.
        let mut running = on_disk.clone();
        running.device.name = "from-cli".into();
        let store = psk_store(&running, tmp.path()).unwrap();
        assert!(store.save([3; 32], true));

        let reloaded = Config::load_or_create(tmp.path()).unwrap();
        assert_eq!(reloaded.api.decode_psk().unwrap(), Some([3; 32]));
        assert_eq!(reloaded.device.name, "from-file");
    }

    #[test]
    fn test_uptime_reported_by_scheduler() {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = Scheduler::new(clock.clone());
        let states = StateBus::new();
        let (_, demo) = demo_entities(&states);

        start_demo(&scheduler, &demo, clock.clone());
        assert_eq!(demo.status.state(), Some(true));
        assert_eq!(demo.version.state(), env!("CARGO_PKG_VERSION"));
        assert!(!demo.uptime.has_state());

        clock.advance(UPTIME_INTERVAL_MS * 2);
        scheduler.call();
        assert!(demo.uptime.has_state());
        assert_eq!(demo.uptime.state(), (UPTIME_INTERVAL_MS * 2 / 1000) as f32);
    }

    #[test]
    fn test_listen_addr() {
        let mut config = Config::default();
        assert_eq!(listen_addr(&config).unwrap().to_string(), "0.0.0.0:6053");
        config.api.bind_address = "::".into();
        assert_eq!(listen_addr(&config).unwrap().to_string(), "[::]:6053");
        config.api.bind_address = "localhost".into();
        assert!(listen_addr(&config).is_err());
    }

    #[test]
    fn test_server_config() {
        let mut config = Config::default();
        config.api.max_connections = 3;
        config.api.loop_interval_ms = 0;
        let server = server_config(&config);
        assert_eq!(server.max_connections, 3);
        assert_eq!(server.loop_interval, Duration::from_millis(1));
    }
}
