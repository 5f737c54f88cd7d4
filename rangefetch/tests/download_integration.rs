//! Integration tests for complete downloads.
//!
//! These tests drive the engine end to end against the in-memory origin:
//! - single and multi-block downloads
//! - redirects and server-assigned filenames
//! - transient failures, resume after a restart and resume failures
//! - cancellation of a call run without a dispatcher
//!
//! Run with: `cargo test --test download_integration`

mod common;

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use tempfile::TempDir;

use common::{
    engine, engine_with, payload, read_file, url, Event, FakeServer, Gate, Recorder, Resource, KIB,
    MIB,
};
use rangefetch::breakpoint::{BreakpointPersistence, MemoryPersistence};
use rangefetch::download::DownloadCall;
use rangefetch::output::{FileOutputBackend, OutputBackend, OutputHandle};
use rangefetch::task::{EndCause, ResumeFailedCause};
use rangefetch::{EngineBuilder, EngineConfig, RetryPolicy};

// ============================================================================
// Helper Functions
// ============================================================================

/// Runs a two-block download of `body` that breaks after 512 KiB and is not
/// retried, leaving a breakpoint in `persistence`. Returns the task id.
fn interrupted_download(dir: &Path, persistence: &Arc<MemoryPersistence>, body: &[u8]) -> i32 {
    let server = FakeServer::new();
    let url = server.serve(
        "/files/big.bin",
        Resource::new(body.to_vec()).fail_after(512 * KIB as u64, 1),
    );
    let engine = engine_with(
        &server,
        EngineConfig::default().with_retry(RetryPolicy::None),
        Some(Arc::clone(persistence) as Arc<dyn BreakpointPersistence>),
    );
    let task = engine.task(url, dir).filename("big.bin").build(engine.store());

    assert_eq!(engine.dispatcher().execute(Arc::clone(&task)), EndCause::Error);

    let record = persistence
        .record(task.id())
        .expect("breakpoint kept after a failed download");
    assert_eq!(record.blocks.len(), 2);
    let durable: u64 = record.blocks.iter().map(|block| block.current_offset).sum();
    assert!(durable >= 512 * KIB as u64, "durable progress {durable}");
    task.id()
}

fn resumed_engine(server: &FakeServer, persistence: &Arc<MemoryPersistence>) -> rangefetch::Engine {
    engine_with(
        server,
        EngineConfig::default().with_retry(RetryPolicy::None),
        Some(Arc::clone(persistence) as Arc<dyn BreakpointPersistence>),
    )
}

// ============================================================================
// Integration Tests
// ============================================================================

#[test]
fn test_single_block_download() {
    let dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    let body = payload(100 * KIB, 1);
    let url = server.serve("/files/small.bin", Resource::new(body.clone()));
    let engine = engine(&server);
    let recorder = Recorder::new();

    let task = engine
        .task(url.clone(), dir.path())
        .listener(recorder.clone())
        .build(engine.store());
    let cause = engine.dispatcher().execute(Arc::clone(&task));

    assert_eq!(cause, EndCause::Completed);
    assert_eq!(task.filename().as_deref(), Some("small.bin"));
    assert_eq!(read_file(&dir.path().join("small.bin")), body);

    let events = recorder.events_for(task.id());
    assert_eq!(events.first(), Some(&Event::TaskStart));
    assert!(events.contains(&Event::TrialStart));
    assert!(events.contains(&Event::SplitEnd {
        blocks: 1,
        total: body.len() as u64
    }));
    assert_eq!(recorder.progress_for(task.id()), body.len() as u64);
    assert_eq!(recorder.ends_for(task.id()), vec![(EndCause::Completed, None)]);

    let requests = server.requests_to(&url);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].range(), Some("bytes=0-"));
    assert!(engine.store().get(task.id()).is_none());
}

#[test]
fn test_multi_block_download() {
    let dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    let body = payload(3 * MIB, 2);
    let url = server.serve("/files/medium.bin", Resource::new(body.clone()));
    let engine = engine(&server);
    let recorder = Recorder::new();

    let task = engine
        .task(url.clone(), dir.path())
        .filename("medium.bin")
        .listener(recorder.clone())
        .build(engine.store());
    let cause = engine.dispatcher().execute(Arc::clone(&task));

    assert_eq!(cause, EndCause::Completed);
    assert_eq!(read_file(&dir.path().join("medium.bin")), body);

    let events = recorder.events_for(task.id());
    assert!(events.contains(&Event::SplitEnd {
        blocks: 2,
        total: body.len() as u64
    }));
    let fetch_ends = events
        .iter()
        .filter(|event| matches!(event, Event::FetchEnd { .. }))
        .count();
    assert_eq!(fetch_ends, 2);
    assert_eq!(recorder.progress_for(task.id()), body.len() as u64);

    let mut ranges: Vec<_> = server
        .requests_to(&url)
        .iter()
        .filter_map(|request| request.range().map(str::to_string))
        .collect();
    ranges.sort();
    let half = body.len() / 2;
    assert_eq!(ranges, vec!["bytes=0-".to_string(), format!("bytes={half}-")]);
}

#[test]
fn test_fixed_connection_count() {
    let dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    let body = payload(MIB, 3);
    let url = server.serve("/files/four.bin", Resource::new(body.clone()));
    let engine = engine(&server);
    let recorder = Recorder::new();

    let task = engine
        .task(url.clone(), dir.path())
        .connection_count(4)
        .listener(recorder.clone())
        .build(engine.store());

    assert_eq!(engine.dispatcher().execute(Arc::clone(&task)), EndCause::Completed);
    assert_eq!(read_file(&dir.path().join("four.bin")), body);
    assert!(recorder.events_for(task.id()).contains(&Event::SplitEnd {
        blocks: 4,
        total: body.len() as u64
    }));

    let quarter = body.len() / 4;
    let ranges: Vec<_> = server
        .requests_to(&url)
        .iter()
        .filter_map(|request| request.range().map(str::to_string))
        .collect();
    assert_eq!(ranges.len(), 4);
    assert!(ranges.contains(&format!("bytes={}-{}", quarter, 2 * quarter - 1)));
    assert!(ranges.contains(&format!("bytes={}-", 3 * quarter)));
}

#[test]
fn test_redirect_is_followed_and_remembered() {
    let dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    let body = payload(3 * MIB, 4);
    let target = server.serve("/files/moved.bin", Resource::new(body.clone()));
    let old = server.redirect("/old", "/files/moved.bin");
    let engine = engine(&server);

    let task = engine.task(old.clone(), dir.path()).build(engine.store());
    assert_eq!(engine.dispatcher().execute(Arc::clone(&task)), EndCause::Completed);

    assert_eq!(task.redirect_location().as_deref(), Some(target.as_str()));
    assert_eq!(task.filename().as_deref(), Some("moved.bin"));
    assert_eq!(read_file(&dir.path().join("moved.bin")), body);

    // Only the trial goes through the redirect; the second block asks the target.
    assert_eq!(server.requests_to(&old).len(), 1);
    assert_eq!(server.requests_to(&target).len(), 2);
}

#[test]
fn test_content_disposition_names_the_file() {
    let dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    let body = payload(20 * KIB, 5);
    let url = server.serve(
        "/download",
        Resource::new(body.clone()).disposition("attachment; filename=\"report.pdf\""),
    );
    let engine = engine(&server);

    let task = engine.task(url.clone(), dir.path()).build(engine.store());
    assert_eq!(engine.dispatcher().execute(Arc::clone(&task)), EndCause::Completed);

    assert_eq!(read_file(&dir.path().join("report.pdf")), body);
    assert_eq!(
        engine.store().response_filename(&url).as_deref(),
        Some("report.pdf")
    );
}

#[test]
fn test_chunked_download() {
    let dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    let body = payload(300 * KIB, 6);
    let url = server.serve("/stream", Resource::new(body.clone()).etag(None).chunked());
    let engine = engine(&server);
    let recorder = Recorder::new();

    let task = engine
        .task(url, dir.path())
        .filename("stream.bin")
        .listener(recorder.clone())
        .build(engine.store());

    assert_eq!(engine.dispatcher().execute(Arc::clone(&task)), EndCause::Completed);
    assert_eq!(read_file(&dir.path().join("stream.bin")), body);
    assert!(recorder
        .events_for(task.id())
        .contains(&Event::TrialEnd { status: 200 }));
}

#[test]
fn test_transient_failure_is_retried_from_durable_offset() {
    let dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    let body = payload(200 * KIB, 7);
    let url = server.serve(
        "/files/flaky.bin",
        Resource::new(body.clone()).fail_after(64 * KIB as u64, 1),
    );
    let engine = engine(&server);

    let task = engine.task(url.clone(), dir.path()).build(engine.store());
    assert_eq!(engine.dispatcher().execute(Arc::clone(&task)), EndCause::Completed);
    assert_eq!(read_file(&dir.path().join("flaky.bin")), body);

    let requests = server.requests_to(&url);
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].range_start(), Some(64 * KIB as u64));
    assert_eq!(requests[1].headers.get("If-Match"), Some("\"v1\""));
}

#[test]
fn test_exhausted_retries_end_with_error() {
    let dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    let url = server.serve(
        "/files/broken.bin",
        Resource::new(payload(200 * KIB, 8)).fail_after(10 * KIB as u64, 10),
    );
    let engine = engine(&server);
    let recorder = Recorder::new();

    let task = engine
        .task(url.clone(), dir.path())
        .listener(recorder.clone())
        .build(engine.store());
    assert_eq!(engine.dispatcher().execute(Arc::clone(&task)), EndCause::Error);

    // One first attempt plus two retries.
    assert_eq!(server.requests_to(&url).len(), 3);
    let ends = recorder.ends_for(task.id());
    assert_eq!(ends.len(), 1);
    assert!(ends[0].1.as_deref().is_some_and(|e| e.contains("I/O error")));
}

#[test]
fn test_missing_resource_is_server_canceled() {
    let dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    let engine = engine(&server);
    let recorder = Recorder::new();

    let task = engine
        .task(url("/nowhere.bin"), dir.path())
        .listener(recorder.clone())
        .build(engine.store());
    assert_eq!(engine.dispatcher().execute(Arc::clone(&task)), EndCause::Error);

    let ends = recorder.ends_for(task.id());
    assert!(ends[0].1.as_deref().is_some_and(|e| e.contains("status 404")));
}

#[test]
fn test_resume_after_restart() {
    let dir = TempDir::new().unwrap();
    let persistence = Arc::new(MemoryPersistence::new());
    let body = payload(3 * MIB, 9);
    let id = interrupted_download(dir.path(), &persistence, &body);

    let server = FakeServer::new();
    let url = server.serve("/files/big.bin", Resource::new(body.clone()));
    let engine = resumed_engine(&server, &persistence);
    let recorder = Recorder::new();

    let task = engine
        .task(url.clone(), dir.path())
        .filename("big.bin")
        .listener(recorder.clone())
        .build(engine.store());
    assert_eq!(task.id(), id);
    assert_eq!(engine.dispatcher().execute(Arc::clone(&task)), EndCause::Completed);
    assert_eq!(read_file(&dir.path().join("big.bin")), body);

    let events = recorder.events_for(id);
    assert!(events
        .iter()
        .any(|event| matches!(event, Event::FromBreakpoint { offset } if *offset > 0)));
    assert!(!events.contains(&Event::TrialStart));

    let requests = server.requests_to(&url);
    assert!(!requests.is_empty());
    for request in &requests {
        assert_ne!(request.range_start(), Some(0));
        assert_eq!(request.headers.get("If-Match"), Some("\"v1\""));
    }
    assert!(persistence.record(id).is_none());
}

#[test]
fn test_changed_etag_restarts_from_beginning() {
    let dir = TempDir::new().unwrap();
    let persistence = Arc::new(MemoryPersistence::new());
    let id = interrupted_download(dir.path(), &persistence, &payload(3 * MIB, 10));

    let server = FakeServer::new();
    let replacement = payload(2 * MIB, 11);
    let url = server.serve(
        "/files/big.bin",
        Resource::new(replacement.clone()).etag(Some("\"v2\"")),
    );
    let engine = resumed_engine(&server, &persistence);
    let recorder = Recorder::new();

    let task = engine
        .task(url, dir.path())
        .filename("big.bin")
        .listener(recorder.clone())
        .build(engine.store());
    assert_eq!(engine.dispatcher().execute(Arc::clone(&task)), EndCause::Completed);
    assert_eq!(read_file(&dir.path().join("big.bin")), replacement);

    let events = recorder.events_for(id);
    assert!(events.contains(&Event::FromBeginning(
        ResumeFailedCause::ResponsePreconditionFailed
    )));
    assert!(events.contains(&Event::SplitEnd {
        blocks: 2,
        total: replacement.len() as u64
    }));
}

#[test]
fn test_server_ignoring_ranges_cancels_resume() {
    let dir = TempDir::new().unwrap();
    let persistence = Arc::new(MemoryPersistence::new());
    let body = payload(3 * MIB, 12);
    interrupted_download(dir.path(), &persistence, &body);

    let server = FakeServer::new();
    let url = server.serve("/files/big.bin", Resource::new(body).without_ranges());
    let engine = resumed_engine(&server, &persistence);
    let recorder = Recorder::new();

    let task = engine
        .task(url, dir.path())
        .filename("big.bin")
        .listener(recorder.clone())
        .build(engine.store());
    assert_eq!(engine.dispatcher().execute(Arc::clone(&task)), EndCause::Error);

    let ends = recorder.ends_for(task.id());
    assert_eq!(ends.len(), 1);
    assert!(ends[0]
        .1
        .as_deref()
        .is_some_and(|e| e.contains("server canceled") && e.contains("status 200")));
}

/// File backend reporting an almost full disk.
struct TinyDisk;

impl OutputBackend for TinyDisk {
    fn create(&self, path: &Path, buffer_size: usize) -> io::Result<Box<dyn OutputHandle>> {
        FileOutputBackend.create(path, buffer_size)
    }

    fn available_space(&self, _path: &Path) -> Option<u64> {
        Some(10)
    }
}

#[test]
fn test_pre_allocate_failure() {
    let dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    let url = server.serve("/files/huge.bin", Resource::new(payload(100 * KIB, 13)));
    let engine = EngineBuilder::new(EngineConfig::default())
        .connections(Arc::new(server.clone()))
        .output(Arc::new(TinyDisk))
        .build()
        .unwrap();

    let task = engine
        .task(url, dir.path())
        .pre_allocate(true)
        .build(engine.store());
    assert_eq!(
        engine.dispatcher().execute(Arc::clone(&task)),
        EndCause::PreAllocateFailed
    );
}

#[test]
fn test_ten_mib_download_resumes_after_restart_and_completes_once() {
    let dir = TempDir::new().unwrap();
    let persistence = Arc::new(MemoryPersistence::new());
    let body = payload(10 * MIB, 14);
    let half_block = (5 * MIB / 2) as u64;

    // First run: both blocks stop halfway, then the engine goes away.
    let id = {
        let server = FakeServer::new();
        let gate = Gate::new();
        let url = server.serve(
            "/files/ten.bin",
            Resource::new(body.clone()).gated_after(half_block, Arc::clone(&gate)),
        );
        let engine = resumed_engine(&server, &persistence);
        let recorder = Recorder::new();
        let task = engine
            .task(url, dir.path())
            .filename("ten.bin")
            .connection_count(2)
            .listener(recorder.clone())
            .build(engine.store());

        engine.dispatcher().enqueue(Arc::clone(&task));
        gate.wait_for_held(2);
        assert!(engine.dispatcher().cancel(&task));
        gate.open();
        assert_eq!(recorder.wait_for_end(task.id()).0, EndCause::Canceled);
        while engine.dispatcher().running_count() > 0 {
            thread::sleep(std::time::Duration::from_millis(10));
        }

        let record = persistence.record(task.id()).expect("breakpoint kept after cancel");
        assert_eq!(record.blocks.len(), 2);
        let offsets: Vec<u64> = record.blocks.iter().map(|block| block.current_offset).collect();
        assert_eq!(offsets, vec![half_block, half_block]);
        task.id()
    };

    // Second run: a new engine over the same records finishes the rest.
    let server = FakeServer::new();
    let url = server.serve("/files/ten.bin", Resource::new(body.clone()));
    let engine = resumed_engine(&server, &persistence);
    let recorder = Recorder::new();
    let task = engine
        .task(url, dir.path())
        .filename("ten.bin")
        .connection_count(2)
        .listener(recorder.clone())
        .build(engine.store());
    assert_eq!(task.id(), id);

    assert_eq!(engine.dispatcher().execute(Arc::clone(&task)), EndCause::Completed);
    let events = recorder.events_for(id);
    assert!(events.contains(&Event::FromBreakpoint {
        offset: 2 * half_block
    }));
    let completions = events
        .iter()
        .filter(|event| matches!(event, Event::TaskEnd { cause: EndCause::Completed, .. }))
        .count();
    assert_eq!(completions, 1);
    assert_eq!(2 * half_block + recorder.progress_for(id), body.len() as u64);
    assert_eq!(read_file(&dir.path().join("ten.bin")), body);
    assert!(persistence.record(id).is_none());
}

#[test]
fn test_canceled_standalone_call_reports_end_once() {
    let dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    let gate = Gate::new();
    let url = server.serve(
        "/files/alone.bin",
        Resource::new(payload(256 * KIB, 15)).gated(Arc::clone(&gate)),
    );
    let engine = engine(&server);
    let recorder = Recorder::new();
    let task = engine
        .task(url, dir.path())
        .filename("alone.bin")
        .listener(recorder.clone())
        .build(engine.store());

    let call = DownloadCall::standalone(Arc::clone(&task), Arc::clone(engine.context()));
    let worker = {
        let call = Arc::clone(&call);
        thread::spawn(move || call.execute())
    };
    gate.wait_for_held(1);

    assert!(call.cancel());
    assert!(!call.cancel());
    gate.open();
    assert_eq!(worker.join().unwrap(), EndCause::Canceled);
    assert_eq!(recorder.ends_for(task.id()), vec![(EndCause::Canceled, None)]);
}
