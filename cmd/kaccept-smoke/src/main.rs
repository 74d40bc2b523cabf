//! kaccept End-to-End Smoke Test
//!
//! Drives one accept cycle against the loopback queue:
//!   Part A: Collaborators: buffers, descriptor table, loopback queue
//!   Part B: Synchronous accepts: backlog, oversized requests, bad requests
//!   Part C: Asynchronous accepts: parked receive, more-data, challenge
//!   Part D: Teardown: dispose while pending, busy rejection
//!
//! Run: RUST_LOG=kaccept=debug ./target/release/kaccept-smoke

use kaccept::{AcceptConfig, AcceptCycle, AcceptError};
use kaccept_core::buffer::BufferProvider;
use kaccept_core::factory::Passthrough;
use kaccept_core::native::HEADER_SIZE;
use kaccept_core::status::{codes, ReceiveStatus};
use kaccept_module::{BasicPolicy, LoopbackConfig, LoopbackQueue, MallocBuffers};

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const GET: &[u8] = b"GET /smoke HTTP/1.1\r\nHost: localhost\r\n\r\n";

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

struct Stack {
    queue: Arc<LoopbackQueue>,
    buffers: Arc<MallocBuffers>,
    cycle: AcceptCycle<Passthrough>,
}

fn build(config: AcceptConfig, require_auth: bool) -> Result<Stack, String> {
    let queue = Arc::new(LoopbackQueue::new(LoopbackConfig::default()).map_err(|e| e.to_string())?);
    let buffers = Arc::new(MallocBuffers::new());
    let policy = Arc::new(BasicPolicy::new(queue.clone()).require_auth(require_auth));
    let cycle = AcceptCycle::new(queue.clone(), buffers.clone(), policy, Passthrough, config)
        .map_err(|e| e.to_string())?;
    Ok(Stack { queue, buffers, cycle })
}

/// Poll `cond` for up to a second.
fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

// ════════════════════════════════════════════════════════════
// Part A: Collaborators
// ════════════════════════════════════════════════════════════

fn test_collaborators(t: &mut TestRunner) {
    t.section("Part A: Collaborators");

    let bufs = MallocBuffers::new().limit(1);
    match bufs.acquire(128) {
        Ok(b) => {
            t.check("MallocBuffers acquire(128)", b.len == 128, &format!("len {}", b.len));
            let second = bufs.acquire(128);
            t.check(
                "MallocBuffers limit -> OutOfBuffers",
                matches!(second, Err(AcceptError::OutOfBuffers { .. })),
                "second acquire succeeded",
            );
            bufs.release(b);
            t.check("MallocBuffers release", bufs.in_use() == 0, &format!("in_use {}", bufs.in_use()));
        }
        Err(e) => t.fail("MallocBuffers acquire(128)", &e.to_string()),
    }

    match LoopbackQueue::new(LoopbackConfig::default()) {
        Ok(q) => {
            let id = q.push_request(GET, false);
            t.check("LoopbackQueue push_request", q.backlog() == 1 && !id.is_new(), "backlog empty");
        }
        Err(e) => t.fail("LoopbackQueue::new", &e.to_string()),
    }
}

// ════════════════════════════════════════════════════════════
// Part B: Synchronous accepts
// ════════════════════════════════════════════════════════════

fn test_sync(t: &mut TestRunner, s: &Stack) {
    t.section("Part B: Synchronous accepts");

    let id = s.queue.push_request(GET, false);
    match s.cycle.accept_next().wait() {
        Ok(req) => {
            t.check("accept backlog request", req.id() == id, &format!("got {}", req.id()));
            t.check(
                "bytes transferred",
                req.len() == HEADER_SIZE + GET.len(),
                &format!("len {}", req.len()),
            );
        }
        Err(e) => t.fail("accept backlog request", &e.to_string()),
    }

    let mut big = b"POST /big HTTP/1.1\r\n\r\n".to_vec();
    big.resize(10_000, b'b');
    let id = s.queue.push_request(big, false);
    match s.cycle.accept_next().wait() {
        Ok(req) => t.check(
            "oversized request -> reallocated",
            req.id() == id && req.bytes().len() == 10_000,
            &format!("size {}", req.size()),
        ),
        Err(e) => t.fail("oversized request -> reallocated", &e.to_string()),
    }

    let bad = s.queue.push_request(&b"\x00\x01 junk"[..], false);
    let result = s.cycle.accept_next().wait();
    t.check(
        "bad request -> Validation",
        matches!(result, Err(AcceptError::Validation(_))),
        &format!("{:?}", result.err()),
    );
    t.check(
        "bad request -> 400 sent",
        s.queue.responses().contains(&(bad, 400)),
        &format!("{:?}", s.queue.responses()),
    );

    s.queue.fail_next(ReceiveStatus::Other(codes::CONNECTION_INVALID));
    let result = s.cycle.accept_next().wait();
    t.check(
        "queue error -> Os",
        matches!(result, Err(AcceptError::Os(ReceiveStatus::Other(codes::CONNECTION_INVALID)))),
        &format!("{:?}", result.err()),
    );
}

// ════════════════════════════════════════════════════════════
// Part C: Asynchronous accepts
// ════════════════════════════════════════════════════════════

fn test_async(t: &mut TestRunner, s: &Stack) {
    t.section("Part C: Asynchronous accepts");

    let future = s.cycle.accept_next();
    t.check("receive parks with empty backlog", eventually(|| s.queue.is_parked()), "not parked");

    let queue = s.queue.clone();
    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        let mut body = b"PUT /async HTTP/1.1\r\n\r\n".to_vec();
        body.resize(6000, b'a');
        queue.push_request(body, false)
    });
    let result = future.wait();
    match (result, client.join()) {
        (Ok(req), Ok(id)) => t.check(
            "worker completion (more-data) resolves",
            req.id() == id && req.bytes().len() == 6000,
            &format!("got {} / {} bytes", req.id(), req.bytes().len()),
        ),
        (Err(e), _) => t.fail("worker completion (more-data) resolves", &e.to_string()),
        (_, Err(_)) => t.fail("worker completion (more-data) resolves", "client panicked"),
    }
}

fn test_challenge(t: &mut TestRunner) {
    let s = match build(AcceptConfig::from_env(), true) {
        Ok(s) => s,
        Err(e) => return t.fail("build auth stack", &e),
    };
    let anon = s.queue.push_request(GET, false);
    let user = s.queue.push_request(GET, true);
    match s.cycle.accept_next().wait() {
        Ok(req) => t.check("challenge then accept", req.id() == user, &format!("got {}", req.id())),
        Err(e) => t.fail("challenge then accept", &e.to_string()),
    }
    t.check(
        "401 sent to anonymous client",
        s.queue.responses() == vec![(anon, 401)],
        &format!("{:?}", s.queue.responses()),
    );
}

// ════════════════════════════════════════════════════════════
// Part D: Teardown
// ════════════════════════════════════════════════════════════

fn test_teardown(t: &mut TestRunner, s: &Stack) {
    t.section("Part D: Teardown");

    let first = s.cycle.accept_next();
    let second = s.cycle.accept_next().wait();
    t.check(
        "accept while pending -> Busy",
        matches!(second, Err(AcceptError::Busy)),
        &format!("{:?}", second.err()),
    );

    s.cycle.dispose();
    let result = first.wait();
    t.check(
        "dispose fails pending accept",
        matches!(result, Err(AcceptError::Disposed)),
        &format!("{:?}", result.err()),
    );
    t.check(
        "cancelled receive releases buffer",
        eventually(|| s.buffers.in_use() == 0),
        &format!("in_use {}", s.buffers.in_use()),
    );

    s.cycle.dispose();
    t.check(
        "accept after dispose -> Disposed",
        matches!(s.cycle.accept_next().wait(), Err(AcceptError::Disposed)),
        "accepted after dispose",
    );
}

// ════════════════════════════════════════════════════════════

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .init();

    println!("=== kaccept End-to-End Smoke Test ===");

    let mut t = TestRunner::new();

    test_collaborators(&mut t);

    let config = AcceptConfig::from_env();
    if let Err(e) = config.validate() {
        println!("\nFATAL: invalid configuration: {}", e);
        std::process::exit(1);
    }
    println!("    buffer size: {}  strict: {}", config.default_buffer_size, config.strict_invariants);

    let stack = match build(config, false) {
        Ok(s) => s,
        Err(e) => {
            println!("\nFATAL: accept cycle setup failed: {}", e);
            t.summary();
            std::process::exit(1);
        }
    };

    test_sync(&mut t, &stack);
    test_async(&mut t, &stack);
    t.section("Part C: Auth challenge");
    test_challenge(&mut t);
    test_teardown(&mut t, &stack);

    let stats = stack.cycle.stats();
    println!(
        "\n    accepted {}  failed {}  retries {}/{}  allocations {}  challenges {}",
        stats.accepted,
        stats.failed,
        stats.insufficient_retries,
        stats.collision_retries,
        stats.reallocations,
        stats.challenges
    );

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
