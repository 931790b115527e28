//! Dispatch loop: single-threaded cooperative pump over the transport
//!
//! One `MessageLoop` is constructed by the process entry point and ticked
//! once per host frame. All host-state mutation and message routing happens
//! on that tick - the only cross-thread resources are the transport's
//! inbound queue and the internal completion channels, so nothing here
//! needs a lock.
//!
//! The loop is built to survive the host's periodic full-state
//! teardown/reload cycles: the durable half (session registry) round-trips
//! through [`DispatchSnapshot`], while the ephemeral half (socket, receive
//! thread) is rebuilt lazily on the first tick after [`MessageLoop::restore`].

use crate::config::AppConfig;
use crate::host::{HostControl, LogLevel, TestAdapter, TestEventSink, TestFilter, split_mode_payload};
use crate::protocol::{Message, MessageKind};
use crate::registry::{ClientRegistry, ClientSession};
use crate::transport::UdpTransport;
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Timeout for the last-gasp Offline broadcast during teardown.
const OFFLINE_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Durable dispatch state carried across host reload cycles. Sockets and
/// threads are deliberately absent - they are rebuilt lazily after restore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchSnapshot {
    pub sessions: Vec<ClientSession>,
}

/// The single-threaded dispatch loop.
pub struct MessageLoop {
    config: AppConfig,
    host: Box<dyn HostControl>,
    tests: Box<dyn TestAdapter>,

    transport: Option<UdpTransport>,
    /// Latched after one failed bind; messaging stays disabled for the
    /// process lifetime while everything else keeps working.
    bind_failed: bool,

    registry: ClientRegistry,
    pending_refresh: HashSet<SocketAddr>,
    announced: bool,
    last_tick: Option<Instant>,

    /// Addressed completions (async test-list replies).
    replies_tx: Sender<(SocketAddr, MessageKind, String)>,
    replies_rx: Receiver<(SocketAddr, MessageKind, String)>,
    /// Broadcast test lifecycle events from the adapter.
    events_rx: Receiver<(MessageKind, String)>,
}

impl MessageLoop {
    /// Create a fresh loop with an empty session registry.
    pub fn new(config: AppConfig, host: Box<dyn HostControl>, tests: Box<dyn TestAdapter>) -> Self {
        Self::build(config, host, tests, Vec::new())
    }

    /// Rebuild the loop from a durable snapshot after a host reload. The
    /// client list survives; the transport is rebound on the next tick and
    /// the Online broadcast re-announces to every restored client.
    pub fn restore(
        config: AppConfig,
        host: Box<dyn HostControl>,
        tests: Box<dyn TestAdapter>,
        snapshot: DispatchSnapshot,
    ) -> Self {
        Self::build(config, host, tests, snapshot.sessions)
    }

    fn build(
        config: AppConfig,
        host: Box<dyn HostControl>,
        mut tests: Box<dyn TestAdapter>,
        sessions: Vec<ClientSession>,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        tests.set_event_sink(TestEventSink::new(events_tx));
        let (replies_tx, replies_rx) = unbounded();
        let registry = ClientRegistry::restore(sessions, config.session.timeout());

        Self {
            config,
            host,
            tests,
            transport: None,
            bind_failed: false,
            registry,
            pending_refresh: HashSet::new(),
            announced: false,
            last_tick: None,
            replies_tx,
            replies_rx,
            events_rx,
        }
    }

    /// Durable view of the loop for the next reload cycle.
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            sessions: self.registry.sessions().to_vec(),
        }
    }

    /// Port the transport is bound to, if messaging is up.
    pub fn local_port(&self) -> Option<u16> {
        self.transport.as_ref().map(|t| t.local_port())
    }

    /// Currently registered client endpoints.
    pub fn clients(&self) -> Vec<SocketAddr> {
        self.registry.endpoints()
    }

    /// Transport counters for periodic statistics logging.
    pub fn stats_summary(&self) -> Option<String> {
        self.transport.as_ref().map(|t| t.stats().summary())
    }

    /// One cooperative pump iteration, driven by the host's update cycle.
    pub fn tick(&mut self) {
        self.ensure_transport();

        // First tick after (re)initialization: re-announce to every client
        // that survived the reload in the registry snapshot.
        if self.transport.is_some() && !self.announced {
            self.announced = true;
            let playing = self.host.is_playing();
            self.broadcast(MessageKind::Online, "");
            self.broadcast(MessageKind::PlayStateChanged, bool_payload(playing));
        }

        // Drain everything currently queued.
        loop {
            let Some(msg) = self.transport.as_ref().and_then(UdpTransport::try_dequeue) else {
                break;
            };
            let Some(origin) = msg.origin else {
                log::warn!("Dropping message without origin (kind {:?})", msg.kind);
                continue;
            };
            if self.registry.touch(origin) {
                // A late-joining client never has to poll for state.
                let playing = self.host.is_playing();
                self.reply(origin, MessageKind::PlayStateChanged, bool_payload(playing));
            }
            self.route(origin, msg);
        }

        // Async completions from the test adapter.
        while let Ok((endpoint, kind, payload)) = self.replies_rx.try_recv() {
            self.reply(endpoint, kind, &payload);
        }
        while let Ok((kind, payload)) = self.events_rx.try_recv() {
            self.broadcast(kind, &payload);
        }

        // Age sessions with a clamped delta: a multi-second host stall
        // (compile, GC) must not evict every client at once.
        let now = Instant::now();
        let delta = self
            .last_tick
            .map_or(Duration::ZERO, |last| now.duration_since(last));
        self.last_tick = Some(now);
        self.registry
            .tick(delta.min(self.config.session.max_tick_delta()));

        // Coalesced refresh: snapshot and clear the set before executing so
        // re-entrant requests queue for the next cycle instead of doubling
        // this one.
        if !self.pending_refresh.is_empty() {
            let requesters: Vec<SocketAddr> = self.pending_refresh.drain().collect();
            let outcome = match self.host.refresh() {
                Ok(()) => String::new(),
                Err(reason) => {
                    log::info!("Refresh refused: {reason}");
                    reason
                }
            };
            for endpoint in requesters {
                self.reply(endpoint, MessageKind::Refresh, &outcome);
            }
        }
    }

    /// Broadcast a compilation-started notification to all clients.
    pub fn notify_compilation_started(&self) {
        self.broadcast(MessageKind::CompilationStarted, "");
    }

    /// Broadcast a compilation-finished notification to all clients.
    pub fn notify_compilation_finished(&self) {
        self.broadcast(MessageKind::CompilationFinished, "");
    }

    /// Broadcast a play-state change to all clients.
    pub fn notify_play_state(&self, playing: bool) {
        self.broadcast(MessageKind::PlayStateChanged, bool_payload(playing));
    }

    /// Forward a promoted host log line to all clients.
    pub fn forward_log(&self, level: LogLevel, text: &str) {
        self.broadcast(level.kind(), text);
    }

    /// Best-effort teardown: tell every client we are going away, then
    /// dispose the transport. Uses the blocking send path because the async
    /// loop lifetime is not guaranteed this late.
    pub fn shutdown(&mut self) {
        if let Some(transport) = &self.transport {
            for endpoint in self.registry.endpoints() {
                transport.send_blocking(endpoint, MessageKind::Offline, "", OFFLINE_SEND_TIMEOUT);
            }
            transport.dispose();
        }
        self.transport = None;
        self.announced = false;
    }

    fn ensure_transport(&mut self) {
        if self.transport.is_some() || self.bind_failed || !self.config.network.enabled {
            return;
        }
        let port = self.config.network.effective_port();
        match UdpTransport::bind(
            port,
            self.config.network.max_datagram,
            self.config.fallback.clone(),
        ) {
            Ok(transport) => self.transport = Some(transport),
            Err(e) => {
                // Non-fatal: the host keeps running with messaging absent.
                log::warn!("Messaging disabled: {e}");
                self.bind_failed = true;
            }
        }
    }

    fn route(&mut self, origin: SocketAddr, msg: Message) {
        match msg.kind {
            MessageKind::Ping => self.reply(origin, MessageKind::Pong, ""),
            MessageKind::Play => self.host.start_play(),
            MessageKind::Stop => self.host.stop_play(),
            MessageKind::Pause => self.host.pause(),
            MessageKind::Unpause => self.host.resume(),
            MessageKind::Refresh => {
                // Deduplicated; every requester gets its own reply once the
                // coalesced refresh resolves at the end of the tick.
                self.pending_refresh.insert(origin);
            }
            MessageKind::Version => {
                let version = self.host.version();
                self.reply(origin, MessageKind::Version, &version);
            }
            MessageKind::ProjectPath => {
                let path = self.host.project_path();
                self.reply(origin, MessageKind::ProjectPath, &path);
            }
            MessageKind::PackageName => {
                let name = self.host.package_name();
                self.reply(origin, MessageKind::PackageName, &name);
            }
            MessageKind::RetrieveTestList => self.handle_retrieve_test_list(origin, &msg.payload),
            MessageKind::ExecuteTests => self.handle_execute_tests(origin, &msg.payload),
            MessageKind::Tcp => {
                // The transport resolves fallback control frames itself.
                log::debug!("Fallback control frame reached dispatch; ignoring");
            }
            MessageKind::Unknown(raw) => {
                log::debug!("Ignoring message of unknown kind {raw} from {origin}");
            }
            other => {
                // Reply/broadcast kinds are never valid requests.
                log::debug!("Ignoring unsolicited {other:?} from {origin}");
            }
        }
    }

    fn handle_retrieve_test_list(&mut self, origin: SocketAddr, payload: &str) {
        let Some(mode) = crate::host::TestMode::parse(payload) else {
            log::warn!("RetrieveTestList with bad mode {payload:?} from {origin}");
            return;
        };
        let tx = self.replies_tx.clone();
        self.tests.retrieve_test_list(
            mode,
            Box::new(move |json| {
                let _ = tx.send((
                    origin,
                    MessageKind::TestListRetrieved,
                    format!("{mode}:{json}"),
                ));
            }),
        );
    }

    fn handle_execute_tests(&mut self, origin: SocketAddr, payload: &str) {
        let Some((mode, filter_expr)) = split_mode_payload(payload) else {
            log::warn!("ExecuteTests with bad payload {payload:?} from {origin}");
            return;
        };
        let filter = TestFilter::parse(filter_expr);
        log::info!("Executing tests in {mode}: {filter:?}");
        self.tests.execute_tests(mode, filter);
        // Immediate acknowledgment; results stream back as lifecycle events.
        self.reply(origin, MessageKind::ExecuteTests, payload);
    }

    fn reply(&self, endpoint: SocketAddr, kind: MessageKind, payload: &str) {
        if let Some(transport) = &self.transport {
            transport.send(endpoint, kind, payload);
        }
    }

    fn broadcast(&self, kind: MessageKind, payload: &str) {
        if let Some(transport) = &self.transport {
            for endpoint in self.registry.endpoints() {
                transport.send(endpoint, kind, payload);
            }
        }
    }
}

fn bool_payload(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}
