//! SetuLink - standalone editor messaging daemon
//!
//! Runs the messaging endpoint against a simulated host so editor tooling
//! can be developed and exercised without a real creative-tool process.
//! The simulated host honors play-state commands, refresh requests, and
//! test execution against a small built-in test tree.

use setu_link::config::AppConfig;
use setu_link::dispatch::MessageLoop;
use setu_link::error::Result;
use setu_link::host::{HostControl, TestAdapter, TestEventSink, TestFilter, TestListReply, TestMode};
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Host update cadence the dispatch loop is ticked at.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Cadence of the periodic statistics log line.
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Config file consulted when no path is given on the command line.
const DEFAULT_CONFIG_PATH: &str = "setu-link.toml";

/// Resolve the config path from the arguments after the program name.
/// `--config <path>` / `-c <path>` wins over a positional path.
fn config_path_from(args: &[String]) -> String {
    if let Some(i) = args.iter().position(|a| a == "--config" || a == "-c") {
        if let Some(path) = args.get(i + 1) {
            return path.clone();
        }
    }
    args.first()
        .filter(|a| !a.starts_with('-'))
        .cloned()
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

/// Simulated host: in-memory play state, always-available refresh.
struct SimHost {
    playing: bool,
    paused: bool,
    refreshes: u64,
}

impl SimHost {
    fn new() -> Self {
        Self {
            playing: false,
            paused: false,
            refreshes: 0,
        }
    }
}

impl HostControl for SimHost {
    fn start_play(&mut self) {
        if !self.playing {
            log::info!("Sim host entering play mode");
            self.playing = true;
            self.paused = false;
        }
    }

    fn stop_play(&mut self) {
        if self.playing {
            log::info!("Sim host leaving play mode");
            self.playing = false;
            self.paused = false;
        }
    }

    fn pause(&mut self) {
        if self.playing && !self.paused {
            log::info!("Sim host paused");
            self.paused = true;
        }
    }

    fn resume(&mut self) {
        if self.paused {
            log::info!("Sim host resumed");
            self.paused = false;
        }
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn version(&self) -> String {
        format!("sim-{}", env!("CARGO_PKG_VERSION"))
    }

    fn project_path(&self) -> String {
        env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| ".".to_string())
    }

    fn package_name(&self) -> String {
        "com.setulink.sim".to_string()
    }

    fn refresh(&mut self) -> std::result::Result<(), String> {
        self.refreshes += 1;
        log::info!("Sim host refresh #{}", self.refreshes);
        Ok(())
    }
}

/// One entry in the simulated test tree.
struct SimTest {
    full_name: &'static str,
    assembly: &'static str,
    passes: bool,
}

const SIM_TESTS: &[SimTest] = &[
    SimTest {
        full_name: "Sim.Core.StartupTest",
        assembly: "Sim.Core.dll",
        passes: true,
    },
    SimTest {
        full_name: "Sim.Core.ShutdownTest",
        assembly: "Sim.Core.dll",
        passes: true,
    },
    SimTest {
        full_name: "Sim.Physics.GravityTest",
        assembly: "Sim.Physics.dll",
        passes: false,
    },
];

/// Simulated test adapter: synchronous discovery and execution over the
/// built-in tree, streaming lifecycle events through the sink.
struct SimTestAdapter {
    sink: Option<TestEventSink>,
}

impl SimTestAdapter {
    fn new() -> Self {
        Self { sink: None }
    }

    fn test_list_json() -> String {
        let entries: Vec<String> = SIM_TESTS
            .iter()
            .map(|t| format!(r#"{{"name":"{}","assembly":"{}"}}"#, t.full_name, t.assembly))
            .collect();
        format!(r#"{{"tests":[{}]}}"#, entries.join(","))
    }
}

impl TestAdapter for SimTestAdapter {
    fn set_event_sink(&mut self, sink: TestEventSink) {
        self.sink = Some(sink);
    }

    fn retrieve_test_list(&mut self, mode: TestMode, reply: TestListReply) {
        log::info!("Sim test list requested for {mode}");
        reply(Self::test_list_json());
    }

    fn execute_tests(&mut self, mode: TestMode, filter: TestFilter) {
        let Some(sink) = &self.sink else {
            log::warn!("Test execution requested before sink registration");
            return;
        };

        sink.run_started(mode.to_string());
        let mut passed = 0u32;
        let mut failed = 0u32;
        for test in SIM_TESTS {
            if !filter.matches(test.full_name, test.assembly) {
                continue;
            }
            sink.test_started(test.full_name);
            if test.passes {
                passed += 1;
                sink.test_finished(format!("{}:Passed", test.full_name));
            } else {
                failed += 1;
                sink.test_finished(format!("{}:Failed", test.full_name));
            }
        }
        sink.run_finished(format!("passed:{passed},failed:{failed}"));
        log::info!("Sim test run finished: {passed} passed, {failed} failed");
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let config_path = config_path_from(&args);
    let config = if Path::new(&config_path).exists() {
        AppConfig::from_file(&config_path)?
    } else {
        AppConfig::default()
    };

    // Initialize logger with the configured level as the default filter
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.logging.level),
    )
    .init();

    log::info!("SetuLink v{} starting...", env!("CARGO_PKG_VERSION"));
    log::info!("Using config: {config_path}");

    // Set up shutdown signal handler
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);

    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| {
        setu_link::Error::Config(format!("Error setting Ctrl-C handler: {e}"))
    })?;

    let mut message_loop = MessageLoop::new(
        config,
        Box::new(SimHost::new()),
        Box::new(SimTestAdapter::new()),
    );

    log::info!("SetuLink running. Press Ctrl-C to stop.");

    let mut last_stats = Instant::now();
    let mut reported_port = None;
    while running.load(Ordering::Relaxed) {
        message_loop.tick();

        if reported_port != message_loop.local_port() {
            reported_port = message_loop.local_port();
            if let Some(port) = reported_port {
                log::info!("Messaging endpoint listening on UDP port {port}");
            }
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            if let Some(summary) = message_loop.stats_summary() {
                log::info!(
                    "Endpoint statistics: {} clients, {summary}",
                    message_loop.clients().len()
                );
            }
        }

        thread::sleep(TICK_INTERVAL);
    }

    // Shutdown
    log::info!("Shutting down...");
    message_loop.shutdown();
    log::info!("SetuLink stopped");
    Ok(())
}
