//! Shared fixtures for the integration tests.
//!
//! [`FakeServer`] is an in-memory HTTP origin implementing the engine's
//! connection contract. It serves byte ranges with `206`, honours
//! `If-Match`, follows configured redirects and can hold or break
//! response bodies. [`Recorder`] is a listener that keeps every event
//! and lets tests wait for terminal ones.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rangefetch::breakpoint::{
    BreakpointInfo, BreakpointPersistence, BreakpointRecord, MemoryPersistence, PersistOp,
    PersistedState,
};
use rangefetch::connection::{Connected, Connection, ConnectionFactory, Headers};
use rangefetch::error::{DownloadError, DownloadResult, PersistenceError};
use rangefetch::task::{DownloadTask, EndCause, ResumeFailedCause};
use rangefetch::{DownloadListener, Engine, EngineBuilder, EngineConfig, RetryPolicy};

pub const HOST: &str = "http://fake.test";

/// How long a test waits for a terminal event before failing.
pub const WAIT: Duration = Duration::from_secs(20);

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * KIB;

// ============================================================================
// Helper Functions
// ============================================================================

/// Deterministic pseudo-random payload.
pub fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes[..]);
    bytes
}

pub fn url(path: &str) -> String {
    format!("{HOST}{path}")
}

/// Engine talking to `server` with fast retries.
pub fn engine(server: &FakeServer) -> Engine {
    engine_with(
        server,
        EngineConfig::default().with_retry(RetryPolicy::fixed(3, Duration::from_millis(5))),
        None,
    )
}

pub fn engine_with(
    server: &FakeServer,
    config: EngineConfig,
    persistence: Option<Arc<dyn BreakpointPersistence>>,
) -> Engine {
    let mut builder = EngineBuilder::new(config).connections(Arc::new(server.clone()));
    if let Some(persistence) = persistence {
        builder = builder.persistence(persistence);
    }
    builder.build().unwrap()
}

pub fn read_file(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

// ============================================================================
// Journal
// ============================================================================

/// Persistence backend that remembers every operation applied to it.
#[derive(Default)]
pub struct Journal {
    inner: MemoryPersistence,
    ops: Mutex<Vec<PersistOp>>,
}

impl Journal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, id: i32) -> Option<BreakpointRecord> {
        self.inner.record(id)
    }

    /// Full writes of the record `id`.
    pub fn upserts_of(&self, id: i32) -> usize {
        self.ops
            .lock()
            .iter()
            .filter(|op| matches!(op, PersistOp::Upsert(record) if record.id == id))
            .count()
    }

    pub fn removals_of(&self, id: i32) -> usize {
        self.ops
            .lock()
            .iter()
            .filter(|op| matches!(op, PersistOp::Remove(removed) if *removed == id))
            .count()
    }
}

impl BreakpointPersistence for Journal {
    fn load_all(&self) -> Result<PersistedState, PersistenceError> {
        self.inner.load_all()
    }

    fn apply(&self, ops: Vec<PersistOp>) -> Result<(), PersistenceError> {
        self.ops.lock().extend(ops.iter().cloned());
        self.inner.apply(ops)
    }
}

// ============================================================================
// Gate
// ============================================================================

#[derive(Default)]
struct GateState {
    open: bool,
    waiting: usize,
}

/// Holds response bodies until opened.
#[derive(Default)]
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        self.state.lock().open = true;
        self.changed.notify_all();
    }

    /// Blocks until `count` readers are held at the gate.
    pub fn wait_for_held(&self, count: usize) {
        let deadline = Instant::now() + WAIT;
        let mut state = self.state.lock();
        while state.waiting < count {
            assert!(Instant::now() < deadline, "readers did not reach the gate");
            self.changed.wait_for(&mut state, Duration::from_millis(50));
        }
    }

    fn wait(&self) {
        let deadline = Instant::now() + WAIT;
        let mut state = self.state.lock();
        if state.open {
            return;
        }
        state.waiting += 1;
        self.changed.notify_all();
        while !state.open && Instant::now() < deadline {
            self.changed.wait_for(&mut state, Duration::from_millis(50));
        }
        state.waiting -= 1;
    }
}

// ============================================================================
// Fake Server
// ============================================================================

/// A resource served by [`FakeServer`].
#[derive(Clone)]
pub struct Resource {
    body: Arc<Vec<u8>>,
    etag: Option<String>,
    ranges: bool,
    chunked: bool,
    disposition: Option<String>,
    fail_after: Option<u64>,
    failures: u32,
    gate: Option<Arc<Gate>>,
    hold_after: u64,
}

impl Resource {
    /// Range-capable resource with etag `"v1"`.
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            etag: Some("\"v1\"".to_string()),
            ranges: true,
            chunked: false,
            disposition: None,
            fail_after: None,
            failures: 0,
            gate: None,
            hold_after: 0,
        }
    }

    pub fn etag(mut self, etag: Option<&str>) -> Self {
        self.etag = etag.map(str::to_string);
        self
    }

    /// Ignores `Range` and always answers 200 with the whole body.
    pub fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    /// No `Content-Length`; implies no range support.
    pub fn chunked(mut self) -> Self {
        self.chunked = true;
        self.ranges = false;
        self
    }

    pub fn disposition(mut self, value: &str) -> Self {
        self.disposition = Some(value.to_string());
        self
    }

    /// The next `times` responses break after `bytes` body bytes.
    pub fn fail_after(mut self, bytes: u64, times: u32) -> Self {
        self.fail_after = Some(bytes);
        self.failures = times;
        self
    }

    pub fn gated(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Sends `bytes` of every response body, then holds the rest at `gate`.
    pub fn gated_after(mut self, bytes: u64, gate: Arc<Gate>) -> Self {
        self.hold_after = bytes;
        self.gate = Some(gate);
        self
    }
}

/// A request as the server saw it.
#[derive(Clone, Debug)]
pub struct Request {
    pub url: String,
    pub headers: Headers,
}

impl Request {
    pub fn range(&self) -> Option<&str> {
        self.headers.get("Range")
    }

    pub fn range_start(&self) -> Option<u64> {
        self.range().and_then(parse_range).map(|(start, _)| start)
    }
}

#[derive(Default)]
struct ServerState {
    resources: Mutex<HashMap<String, Resource>>,
    redirects: Mutex<HashMap<String, String>>,
    requests: Mutex<Vec<Request>>,
}

/// In-memory origin. Clones share state.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<ServerState>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `resource` at `path`; returns its absolute url.
    pub fn serve(&self, path: &str, resource: Resource) -> String {
        let url = url(path);
        self.state.resources.lock().insert(url.clone(), resource);
        url
    }

    /// Answers requests for `path` with a 302 to `location`.
    pub fn redirect(&self, path: &str, location: &str) -> String {
        let url = url(path);
        self.state
            .redirects
            .lock()
            .insert(url.clone(), location.to_string());
        url
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state.requests.lock().clone()
    }

    pub fn requests_to(&self, url: &str) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|request| request.url == url)
            .collect()
    }

    fn respond(&self, url: &str, headers: &Headers) -> Box<dyn Connected> {
        self.state.requests.lock().push(Request {
            url: url.to_string(),
            headers: headers.clone(),
        });

        if let Some(location) = self.state.redirects.lock().get(url).cloned() {
            let mut out = Headers::new();
            out.add("Location", location);
            return FakeResponse::empty(302, out);
        }

        let mut resources = self.state.resources.lock();
        let Some(resource) = resources.get_mut(url) else {
            return FakeResponse::empty(404, Headers::new());
        };

        if let (Some(expected), Some(etag)) = (headers.get("If-Match"), &resource.etag) {
            if expected != etag {
                return FakeResponse::empty(412, Headers::new());
            }
        }

        let total = resource.body.len() as u64;
        let mut out = Headers::new();
        if let Some(etag) = &resource.etag {
            out.add("ETag", etag.clone());
        }
        if let Some(disposition) = &resource.disposition {
            out.add("Content-Disposition", disposition.clone());
        }

        let range = headers.get("Range").and_then(parse_range);
        let (status, start, end) = match range {
            Some((start, _)) if resource.ranges && start >= total => {
                return FakeResponse::empty(416, out);
            }
            Some((start, end)) if resource.ranges => {
                let last = end.unwrap_or(total - 1).min(total - 1);
                out.add("Accept-Ranges", "bytes");
                out.add("Content-Range", format!("bytes {start}-{last}/{total}"));
                (206, start, last + 1)
            }
            _ => (200, 0, total),
        };
        if !resource.chunked {
            out.add("Content-Length", (end - start).to_string());
        }

        let fail_at = if resource.failures > 0 {
            resource.failures -= 1;
            resource.fail_after.map(|bytes| start + bytes)
        } else {
            None
        };

        Box::new(FakeResponse {
            status,
            headers: out,
            body: Arc::clone(&resource.body),
            pos: start,
            end,
            fail_at,
            gate: resource.gate.clone(),
            hold_at: start + resource.hold_after,
        })
    }
}

impl ConnectionFactory for FakeServer {
    fn create(&self, url: &str) -> DownloadResult<Box<dyn Connection>> {
        if !url.starts_with(HOST) {
            return Err(DownloadError::InvalidTask(format!("unknown host in {url}")));
        }
        Ok(Box::new(FakeConnection {
            server: self.clone(),
            url: url.to_string(),
            headers: Headers::new(),
        }))
    }
}

struct FakeConnection {
    server: FakeServer,
    url: String,
    headers: Headers,
}

impl Connection for FakeConnection {
    fn add_header(&mut self, name: &str, value: &str) {
        self.headers.add(name, value);
    }

    fn request_headers(&self) -> &Headers {
        &self.headers
    }

    fn execute(&mut self) -> DownloadResult<Box<dyn Connected>> {
        Ok(self.server.respond(&self.url, &self.headers))
    }
}

struct FakeResponse {
    status: u16,
    headers: Headers,
    body: Arc<Vec<u8>>,
    pos: u64,
    end: u64,
    fail_at: Option<u64>,
    gate: Option<Arc<Gate>>,
    hold_at: u64,
}

impl FakeResponse {
    fn empty(status: u16, headers: Headers) -> Box<dyn Connected> {
        Box::new(FakeResponse {
            status,
            headers,
            body: Arc::new(Vec::new()),
            pos: 0,
            end: 0,
            fail_at: None,
            gate: None,
            hold_at: 0,
        })
    }
}

impl Connected for FakeResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(gate) = &self.gate {
            if self.pos >= self.hold_at {
                gate.wait();
            }
        }
        let mut limit = match self.fail_at {
            Some(fail_at) if self.pos >= fail_at => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by fake server",
                ));
            }
            Some(fail_at) => fail_at.min(self.end),
            None => self.end,
        };
        if self.gate.is_some() && self.pos < self.hold_at {
            limit = limit.min(self.hold_at);
        }
        let n = buf.len().min((limit - self.pos) as usize);
        let from = self.pos as usize;
        buf[..n].copy_from_slice(&self.body[from..from + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

/// Parses `bytes=start-` or `bytes=start-end`.
fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let ranges = value.strip_prefix("bytes=")?;
    let (start, end) = ranges.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse().ok()?),
    };
    Some((start, end))
}

// ============================================================================
// Recorder
// ============================================================================

/// A listener event, reduced to what tests assert on.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    TaskStart,
    TrialStart,
    TrialEnd { status: u16 },
    FromBeginning(ResumeFailedCause),
    FromBreakpoint { offset: u64 },
    SplitEnd { blocks: usize, total: u64 },
    ConnectStart { block: usize, range: Option<String> },
    ConnectEnd { block: usize, status: u16 },
    FetchStart { block: usize },
    Progress { block: usize, bytes: u64 },
    FetchEnd { block: usize },
    TaskEnd { cause: EndCause, error: Option<String> },
}

/// Listener keeping every event of every task it is attached to.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<(i32, Event)>>,
    changed: Condvar,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, task: &DownloadTask, event: Event) {
        self.events.lock().push((task.id(), event));
        self.changed.notify_all();
    }

    pub fn all(&self) -> Vec<(i32, Event)> {
        self.events.lock().clone()
    }

    pub fn events_for(&self, id: i32) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|(task, _)| *task == id)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn ends_for(&self, id: i32) -> Vec<(EndCause, Option<String>)> {
        self.events_for(id)
            .into_iter()
            .filter_map(|event| match event {
                Event::TaskEnd { cause, error } => Some((cause, error)),
                _ => None,
            })
            .collect()
    }

    /// Ids in the order their tasks started.
    pub fn start_order(&self) -> Vec<i32> {
        self.events
            .lock()
            .iter()
            .filter(|(_, event)| *event == Event::TaskStart)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn progress_for(&self, id: i32) -> u64 {
        self.events_for(id)
            .iter()
            .map(|event| match event {
                Event::Progress { bytes, .. } => *bytes,
                _ => 0,
            })
            .sum()
    }

    /// Waits for the first terminal event of `id`.
    pub fn wait_for_end(&self, id: i32) -> (EndCause, Option<String>) {
        let deadline = Instant::now() + WAIT;
        let mut events = self.events.lock();
        loop {
            let end = events.iter().find_map(|(task, event)| match event {
                Event::TaskEnd { cause, error } if *task == id => Some((*cause, error.clone())),
                _ => None,
            });
            if let Some(end) = end {
                return end;
            }
            assert!(Instant::now() < deadline, "task {id} did not end in time");
            self.changed.wait_for(&mut events, Duration::from_millis(50));
        }
    }

    /// Waits until `id` has ended `count` times and returns every end.
    pub fn wait_for_ends(&self, id: i32, count: usize) -> Vec<(EndCause, Option<String>)> {
        let deadline = Instant::now() + WAIT;
        loop {
            let ends = self.ends_for(id);
            if ends.len() >= count {
                return ends;
            }
            assert!(Instant::now() < deadline, "task {id} did not end {count} times");
            let mut events = self.events.lock();
            self.changed.wait_for(&mut events, Duration::from_millis(50));
        }
    }
}

impl DownloadListener for Recorder {
    fn task_start(&self, task: &DownloadTask) {
        self.push(task, Event::TaskStart);
    }

    fn connect_trial_start(&self, task: &DownloadTask) {
        self.push(task, Event::TrialStart);
    }

    fn connect_trial_end(&self, task: &DownloadTask, status: u16, _headers: &Headers) {
        self.push(task, Event::TrialEnd { status });
    }

    fn download_from_beginning(
        &self,
        task: &DownloadTask,
        _info: &BreakpointInfo,
        cause: ResumeFailedCause,
    ) {
        self.push(task, Event::FromBeginning(cause));
    }

    fn download_from_breakpoint(&self, task: &DownloadTask, info: &BreakpointInfo) {
        self.push(
            task,
            Event::FromBreakpoint {
                offset: info.total_offset(),
            },
        );
    }

    fn split_block_end(&self, task: &DownloadTask, info: &BreakpointInfo) {
        self.push(
            task,
            Event::SplitEnd {
                blocks: info.block_count(),
                total: info.total_length(),
            },
        );
    }

    fn connect_start(&self, task: &DownloadTask, block: usize, request_headers: &Headers) {
        let range = request_headers.get("Range").map(str::to_string);
        self.push(task, Event::ConnectStart { block, range });
    }

    fn connect_end(&self, task: &DownloadTask, block: usize, status: u16, _headers: &Headers) {
        self.push(task, Event::ConnectEnd { block, status });
    }

    fn fetch_start(&self, task: &DownloadTask, block: usize, _content_length: u64) {
        self.push(task, Event::FetchStart { block });
    }

    fn fetch_progress(&self, task: &DownloadTask, block: usize, increase: u64) {
        self.push(
            task,
            Event::Progress {
                block,
                bytes: increase,
            },
        );
    }

    fn fetch_end(&self, task: &DownloadTask, block: usize, _content_length: u64) {
        self.push(task, Event::FetchEnd { block });
    }

    fn task_end(&self, task: &DownloadTask, cause: EndCause, error: Option<&DownloadError>) {
        self.push(
            task,
            Event::TaskEnd {
                cause,
                error: error.map(|e| e.to_string()),
            },
        );
    }
}
