//! Collaborator interfaces consumed by the dispatch loop
//!
//! The host itself (play state, compile/refresh policy) and the test-runner
//! adapter live behind these traits. The dispatch loop routes protocol
//! messages into them and never knows which concrete host it is driving;
//! integration glue (application discovery, project-file generation,
//! settings patching) stays outside this crate entirely.

use crate::protocol::MessageKind;
use std::fmt;
use std::path::Path;

/// Control surface of the running creative-tool host.
///
/// `refresh` is the only fallible operation: policy checks (user code mid
/// execution, degraded host state) surface as human-readable failure
/// strings, not errors - the requester receives the string as the reply
/// payload, empty meaning success.
pub trait HostControl: Send {
    fn start_play(&mut self);
    fn stop_play(&mut self);
    fn pause(&mut self);
    fn resume(&mut self);
    fn is_playing(&self) -> bool;

    fn version(&self) -> String;
    fn project_path(&self) -> String;
    fn package_name(&self) -> String;

    /// Perform one asset refresh. `Err` carries the reason shown to every
    /// coalesced requester.
    fn refresh(&mut self) -> std::result::Result<(), String>;
}

/// Test execution mode, the first half of the compound test payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    EditMode,
    PlayMode,
}

impl TestMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EditMode" => Some(TestMode::EditMode),
            "PlayMode" => Some(TestMode::PlayMode),
            _ => None,
        }
    }
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestMode::EditMode => write!(f, "EditMode"),
            TestMode::PlayMode => write!(f, "PlayMode"),
        }
    }
}

/// Which tests an `ExecuteTests` request selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestFilter {
    /// Empty filter expression - run everything.
    All,
    /// Filter names an assembly (has a file extension).
    Assembly(String),
    /// Trailing `?` - fuzzy suffix match on the full test name.
    Fuzzy(String),
    /// Exact full test name.
    Exact(String),
}

impl TestFilter {
    /// Classify a raw filter expression.
    pub fn parse(expr: &str) -> Self {
        if expr.is_empty() {
            return TestFilter::All;
        }
        if let Some(stripped) = expr.strip_suffix('?') {
            return TestFilter::Fuzzy(stripped.to_string());
        }
        if Path::new(expr).extension().is_some() {
            return TestFilter::Assembly(expr.to_string());
        }
        TestFilter::Exact(expr.to_string())
    }

    /// Whether a test (full name + containing assembly) is selected.
    pub fn matches(&self, full_name: &str, assembly: &str) -> bool {
        match self {
            TestFilter::All => true,
            TestFilter::Assembly(name) => assembly == name,
            TestFilter::Fuzzy(suffix) => full_name.ends_with(suffix),
            TestFilter::Exact(name) => full_name == name,
        }
    }
}

/// Split a `"<mode>:<rest>"` compound payload. The rest may itself contain
/// colons (JSON, nested names), so only the first delimiter counts.
pub fn split_mode_payload(payload: &str) -> Option<(TestMode, &str)> {
    let (mode_str, rest) = payload.split_once(':')?;
    Some((TestMode::parse(mode_str)?, rest))
}

/// Sink handed to the test adapter for lifecycle broadcasts
/// (RunStarted / TestStarted / TestFinished / RunFinished). Events are
/// delivered to every registered client on the next dispatch tick.
#[derive(Clone)]
pub struct TestEventSink {
    tx: crossbeam_channel::Sender<(MessageKind, String)>,
}

impl TestEventSink {
    pub(crate) fn new(tx: crossbeam_channel::Sender<(MessageKind, String)>) -> Self {
        Self { tx }
    }

    pub fn run_started(&self, payload: impl Into<String>) {
        let _ = self.tx.send((MessageKind::RunStarted, payload.into()));
    }

    pub fn test_started(&self, payload: impl Into<String>) {
        let _ = self.tx.send((MessageKind::TestStarted, payload.into()));
    }

    pub fn test_finished(&self, payload: impl Into<String>) {
        let _ = self.tx.send((MessageKind::TestFinished, payload.into()));
    }

    pub fn run_finished(&self, payload: impl Into<String>) {
        let _ = self.tx.send((MessageKind::RunFinished, payload.into()));
    }
}

/// Completion callback for an asynchronous test-list retrieval. Invoked at
/// most once with the JSON test tree for the requested mode.
pub type TestListReply = Box<dyn FnOnce(String) + Send>;

/// Adapter over the host-specific test runner.
pub trait TestAdapter: Send {
    /// Register the sink used for lifecycle broadcasts. Called once when
    /// the dispatch loop takes ownership of the adapter.
    fn set_event_sink(&mut self, sink: TestEventSink);

    /// Fetch the test tree for `mode`; `reply` fires when the runner has
    /// produced it (possibly several host frames later).
    fn retrieve_test_list(&mut self, mode: TestMode, reply: TestListReply);

    /// Start executing the selected tests. Fire-and-forget; results arrive
    /// through the event sink.
    fn execute_tests(&mut self, mode: TestMode, filter: TestFilter);
}

/// Log levels a host can promote to connected clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub(crate) fn kind(self) -> MessageKind {
        match self {
            LogLevel::Info => MessageKind::Info,
            LogLevel::Warning => MessageKind::Warning,
            LogLevel::Error => MessageKind::Error,
        }
    }
}
