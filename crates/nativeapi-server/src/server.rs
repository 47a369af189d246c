//! The API server: accepts clients and drives every connection from one loop.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use nativeapi_net::{
    FrameHelper, NoiseContext, NoiseFrameHelper, PlaintextFrameHelper, Socket, SocketConfig,
    TcpSocket, configure_stream,
};
use nativeapi_proto::LogLevel;
use nativeapi_scheduler::Scheduler;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Level;

use crate::connection::ApiConnection;
use crate::context::ApiContext;

/// Configuration for [`ApiServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Clients beyond this are closed right after accept. Default: 8.
    pub max_connections: usize,
    /// Period of the main loop. Default: 16 ms.
    pub loop_interval: Duration,
    /// How long shutdown waits for clients to acknowledge. Default: 2 s.
    pub shutdown_timeout: Duration,
    /// Options applied to accepted sockets.
    pub socket: SocketConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            loop_interval: Duration::from_millis(16),
            shutdown_timeout: Duration::from_secs(2),
            socket: SocketConfig::default(),
        }
    }
}

/// Owns every client connection and runs the cooperative main loop.
pub struct ApiServer {
    ctx: Arc<ApiContext>,
    config: ServerConfig,
    connections: Vec<ApiConnection>,
    scheduler: Option<Scheduler>,
}

impl ApiServer {
    pub fn new(ctx: Arc<ApiContext>, config: ServerConfig) -> Self {
        Self {
            ctx,
            config,
            connections: Vec::new(),
            scheduler: None,
        }
    }

    /// Run `scheduler` once per loop iteration, after the connections.
    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn context(&self) -> &Arc<ApiContext> {
        &self.ctx
    }

    pub fn connections(&self) -> &[ApiConnection] {
        &self.connections
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Take ownership of a freshly accepted socket.
    ///
    /// The framing is chosen now: Noise when a key is active, plaintext
    /// otherwise. Returns `false` if the client was refused.
    pub fn accept(&mut self, mut socket: Box<dyn Socket>) -> bool {
        let peer = socket.peer_name();
        if self.connections.len() >= self.config.max_connections {
            tracing::warn!("Max connections reached, refusing {peer}");
            let _ = socket.close();
            return false;
        }

        let helper: Box<dyn FrameHelper> = match self.ctx.psk.get() {
            Some(psk) => {
                let device = &self.ctx.device;
                let noise = NoiseContext::new(psk, device.name.clone(), device.mac_address.clone());
                Box::new(NoiseFrameHelper::new(socket, noise))
            }
            None => Box::new(PlaintextFrameHelper::new(socket)),
        };

        let mut conn = ApiConnection::new(helper, Arc::clone(&self.ctx));
        conn.start();
        if conn.is_removed() {
            return false;
        }
        tracing::debug!("Accepted {peer}");
        self.connections.push(conn);
        true
    }

    /// One main loop iteration.
    pub fn tick(&mut self) {
        for conn in &mut self.connections {
            conn.tick();
        }
        self.connections.retain(|conn| {
            if conn.is_removed() {
                tracing::info!("Disconnecting {}", conn.client_combined_info());
                false
            } else {
                true
            }
        });

        if self.ctx.psk.activate_pending().is_some() {
            tracing::warn!("Disconnecting all clients to reset connections");
            for conn in &mut self.connections {
                conn.send_disconnect_request();
            }
        }

        self.broadcast_states();
        self.forward_logs();

        if let Some(scheduler) = &self.scheduler {
            scheduler.call();
        }
    }

    fn broadcast_states(&mut self) {
        if self.ctx.states.is_empty() {
            return;
        }
        let registry = Arc::clone(&self.ctx.registry);
        for key in self.ctx.states.drain() {
            let Some(entity) = registry.get(key) else {
                continue;
            };
            if entity.info().internal {
                continue;
            }
            for conn in &mut self.connections {
                conn.send_state(entity);
            }
        }
    }

    fn forward_logs(&mut self) {
        let Some(tap) = &self.ctx.log_tap else {
            return;
        };
        if tap.is_empty() {
            return;
        }
        let lines = tap.drain();
        if self.connections.is_empty() {
            return;
        }
        for line in lines {
            let level = log_level(line.level);
            let text = line.format();
            for conn in &mut self.connections {
                conn.try_send_log_message(level, &text);
            }
        }
    }

    /// Configure an accepted tokio stream and hand it to [`accept`](Self::accept).
    pub fn accept_stream(&mut self, stream: TcpStream) -> io::Result<bool> {
        configure_stream(&stream, &self.config.socket)?;
        let stream = stream.into_std()?;
        Ok(self.accept(Box::new(TcpSocket::new(stream))))
    }

    /// Serve `listener` until `shutdown` turns true, then disconnect clients.
    pub async fn run(
        &mut self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        tracing::info!("API server listening on {}", listener.local_addr()?);

        let mut ticker = tokio::time::interval(self.config.loop_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        if let Err(e) = self.accept_stream(stream) {
                            tracing::warn!("Failed to set up connection from {addr}: {e}");
                        }
                    }
                    Err(e) => tracing::warn!("Accept failed: {e}"),
                },
                _ = ticker.tick() => self.tick(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        self.disconnect_all().await;
        Ok(())
    }

    /// Ask every client to leave, wait for them up to the shutdown timeout,
    /// then drop whoever is left.
    pub async fn disconnect_all(&mut self) {
        for conn in &mut self.connections {
            conn.send_disconnect_request();
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while !self.connections.is_empty() && Instant::now() < deadline {
            self.tick();
            tokio::time::sleep(self.config.loop_interval).await;
        }

        for conn in &mut self.connections {
            conn.on_fatal_error();
        }
        self.connections.clear();
    }
}

/// Map a tracing level onto the wire log level.
fn log_level(level: Level) -> LogLevel {
    match level {
        Level::ERROR => LogLevel::Error,
        Level::WARN => LogLevel::Warn,
        Level::INFO => LogLevel::Info,
        Level::DEBUG => LogLevel::Debug,
        _ => LogLevel::Verbose,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PEER, build_context, frame, only, parse_frames, test_context};
    use nativeapi_log::{LogTap, TapLine};
    use nativeapi_net::{MemoryPeer, MemorySocket};
    use nativeapi_proto::{
        ConnectRequest, DisconnectRequest, HelloRequest, HelloResponse, ProtoMessage,
        SensorStateResponse, SubscribeLogsRequest, SubscribeLogsResponse, SubscribeStatesRequest,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn server(ctx: Arc<ApiContext>, max_connections: usize) -> ApiServer {
        ApiServer::new(
            ctx,
            ServerConfig {
                max_connections,
                ..Default::default()
            },
        )
    }

    fn connect(server: &mut ApiServer) -> MemoryPeer {
        let (socket, peer) = MemorySocket::new(PEER);
        assert!(server.accept(Box::new(socket)));
        peer
    }

    /// Hello + connect + subscribe states, one packet per tick.
    fn login(server: &mut ApiServer, peer: &MemoryPeer) {
        peer.send(&frame(&HelloRequest {
            client_info: "test".into(),
            api_version_major: 1,
            api_version_minor: 10,
        }));
        peer.send(&frame(&ConnectRequest::default()));
        peer.send(&frame(&SubscribeStatesRequest));
        for _ in 0..20 {
            server.tick();
        }
        peer.take_written();
    }

    #[test]
    fn test_accepted_client_gets_hello_response() {
        let (ctx, _, _) = test_context("");
        let mut server = server(ctx, 4);
        let peer = connect(&mut server);

        peer.send(&frame(&HelloRequest::default()));
        server.tick();
        let resp: HelloResponse = only(&parse_frames(&peer.take_written()));
        assert_eq!(resp.api_version_major, 1);
        assert_eq!(server.connection_count(), 1);
    }

    #[test]
    fn test_connection_limit() {
        let (ctx, _, _) = test_context("");
        let mut server = server(ctx, 1);
        let _first = connect(&mut server);

        let (socket, second) = MemorySocket::new("192.168.1.51:40000");
        assert!(!server.accept(Box::new(socket)));
        assert!(second.is_closed());
        assert_eq!(server.connection_count(), 1);
    }

    #[test]
    fn test_removed_connections_are_dropped() {
        let (ctx, _, _) = test_context("");
        let mut server = server(ctx, 4);
        let peer = connect(&mut server);

        peer.send(&frame(&DisconnectRequest));
        server.tick();
        assert_eq!(server.connection_count(), 1);
        server.tick();
        assert_eq!(server.connection_count(), 0);
        assert!(peer.is_closed());
    }

    #[test]
    fn test_state_changes_reach_subscribers() {
        let (ctx, _, entities) = test_context("");
        let mut server = server(ctx, 4);
        let subscribed = connect(&mut server);
        login(&mut server, &subscribed);
        let idle = connect(&mut server);

        entities.sensor.publish_state(42.0);
        entities.sensor.publish_state(43.0);
        server.tick();

        let frames = parse_frames(&subscribed.take_written());
        let state: SensorStateResponse = only(&frames);
        assert_eq!(state.state, 43.0);
        assert!(idle.take_written().is_empty());
        assert!(server.context().states.is_empty());
    }

    #[test]
    fn test_psk_activation_disconnects_clients() {
        let (ctx, _, _) = test_context("");
        let mut server = server(Arc::clone(&ctx), 4);
        let peer = connect(&mut server);

        assert!(ctx.psk.save([5; 32], true));
        server.tick();

        let frames = parse_frames(&peer.take_written());
        assert!(frames.iter().any(|(ty, _)| *ty == DisconnectRequest::MESSAGE_TYPE));
        assert!(ctx.psk.has_psk());
    }

    #[test]
    fn test_log_lines_forwarded_by_level() {
        let tap = LogTap::new(16);
        let (ctx, _, _) = build_context("", |ctx| ctx.with_log_tap(tap.clone()));
        let mut server = server(ctx, 4);
        let peer = connect(&mut server);
        login(&mut server, &peer);
        peer.send(&frame(&SubscribeLogsRequest {
            level: LogLevel::Info,
            dump_config: false,
        }));
        server.tick();
        tap.drain();

        tap.push(TapLine {
            level: Level::WARN,
            target: "demo".into(),
            message: "low battery".into(),
        });
        tap.push(TapLine {
            level: Level::DEBUG,
            target: "demo".into(),
            message: "too chatty".into(),
        });
        server.tick();

        let line: SubscribeLogsResponse = only(&parse_frames(&peer.take_written()));
        assert_eq!(line.level, LogLevel::Warn);
        assert_eq!(line.message, b"[W][demo]: low battery");
        assert!(tap.is_empty());
    }

    #[test]
    fn test_scheduler_runs_each_tick() {
        let (ctx, clock, _) = test_context("");
        let scheduler = Scheduler::new(clock);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        scheduler.set_timeout(None, "once", 0, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut server = server(ctx, 4).with_scheduler(scheduler);
        server.tick();
        server.tick();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_noise_framing_when_key_active() {
        let (ctx, _, _) = build_context("", |ctx| {
            ctx.with_psk(crate::context::PskStore::new(Some([7; 32])))
        });
        let mut server = server(ctx, 4);
        let peer = connect(&mut server);

        // A plaintext hello is rejected by the Noise framing.
        peer.send(&frame(&HelloRequest::default()));
        server.tick();
        assert_eq!(server.connection_count(), 0);
        assert!(peer.is_closed());
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(log_level(Level::ERROR), LogLevel::Error);
        assert_eq!(log_level(Level::INFO), LogLevel::Info);
        assert_eq!(log_level(Level::TRACE), LogLevel::Verbose);
    }
}
