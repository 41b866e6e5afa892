//! End-to-end probe runs against scripted discovery engines.
//!
//! The scripted engine replays a fixed sequence of notifications from its own
//! task, which lets these tests pin down the report and the exact text output
//! for completion, timeout, construction failure and the end-of-candidates
//! sentinel.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use tokio::task::JoinHandle;

use ice_gather_probe::{
    candidate::{Candidate, Protocol},
    engine::{DiscoveryEngine, EngineError, GathererState},
    ice_url::IceUrl,
    output::{OutputFormat, Reporter},
    probe::{ProbeError, ProbeOutcome, ProbeReport, ProbeSettings, TimingProbe},
    sink::EventSink,
};

#[derive(Clone)]
enum Step {
    Sleep(Duration),
    Candidate(Candidate),
    EndOfCandidates,
    Complete,
    /// Keeps the sink alive without sending anything else.
    Hang,
}

struct ScriptedEngine {
    script: Vec<Step>,
    worker: Option<JoinHandle<()>>,
    closed: Arc<AtomicBool>,
}

impl ScriptedEngine {
    fn build(server: &str, script: Vec<Step>) -> Result<(Self, Arc<AtomicBool>), EngineError> {
        server.parse::<IceUrl>()?;
        let closed = Arc::new(AtomicBool::new(false));
        Ok((
            ScriptedEngine {
                script,
                worker: None,
                closed: closed.clone(),
            },
            closed,
        ))
    }
}

impl DiscoveryEngine for ScriptedEngine {
    fn start_gathering(&mut self, sink: EventSink) -> Result<(), EngineError> {
        let script = self.script.clone();
        self.worker = Some(tokio::spawn(async move {
            sink.on_state_change(GathererState::Gathering);
            for step in script {
                match step {
                    Step::Sleep(d) => tokio::time::sleep(d).await,
                    Step::Candidate(c) => sink.on_candidate(Some(c)),
                    Step::EndOfCandidates => sink.on_candidate(None),
                    Step::Complete => sink.on_state_change(GathererState::Complete),
                    Step::Hang => std::future::pending::<()>().await,
                }
            }
        }));
        Ok(())
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        self.closed.store(true, Ordering::Release);
    }
}

/// Spawns several OS threads that deliver candidates concurrently, then completes.
struct ThreadedEngine {
    threads: usize,
    per_thread: usize,
}

impl DiscoveryEngine for ThreadedEngine {
    fn start_gathering(&mut self, sink: EventSink) -> Result<(), EngineError> {
        let (threads, per_thread) = (self.threads, self.per_thread);
        thread::spawn(move || {
            let workers: Vec<_> = (0..threads)
                .map(|t| {
                    let sink = sink.clone();
                    thread::spawn(move || {
                        for i in 0..per_thread {
                            let port = 10_000 + (t * per_thread + i) as u16;
                            sink.on_candidate(Some(host(port)));
                        }
                    })
                })
                .collect();
            for w in workers {
                let _ = w.join();
            }
            sink.on_candidate(None);
            sink.on_state_change(GathererState::Complete);
            sink.on_state_change(GathererState::Complete);
        });
        Ok(())
    }

    fn close(&mut self) {}
}

/// Fails every start request.
struct RefusingEngine {
    closed: Arc<AtomicBool>,
}

impl DiscoveryEngine for RefusingEngine {
    fn start_gathering(&mut self, _sink: EventSink) -> Result<(), EngineError> {
        Err(EngineError::AlreadyStarted)
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn host(port: u16) -> Candidate {
    Candidate::host(([192, 168, 0, 10], port).into(), Protocol::Udp)
}

fn srflx(port: u16) -> Candidate {
    Candidate::server_reflexive(
        ([203, 0, 113, 5], port).into(),
        ([0, 0, 0, 0], port).into(),
    )
}

fn settings(timeout_ms: u64) -> ProbeSettings {
    ProbeSettings {
        timeout: Duration::from_millis(timeout_ms),
        drain_grace: Duration::from_millis(50),
    }
}

async fn run_script(
    server: &str,
    script: Vec<Step>,
    timeout_ms: u64,
) -> (Result<ProbeReport, ProbeError>, String, Arc<AtomicBool>) {
    let probe = TimingProbe::new(server, settings(timeout_ms));
    let mut reporter = Reporter::new(Vec::new(), OutputFormat::Text);
    let mut closed = Arc::new(AtomicBool::new(false));
    let result = probe
        .run(
            |server| {
                let (engine, flag) = ScriptedEngine::build(server, script)?;
                closed = flag;
                Ok(engine)
            },
            &mut reporter,
        )
        .await;
    let output = String::from_utf8(reporter.into_inner()).unwrap();
    (result, output, closed)
}

#[tokio::test]
async fn test_three_candidates_then_complete() {
    let script = vec![
        Step::Sleep(Duration::from_millis(20)),
        Step::Candidate(host(5000)),
        Step::Sleep(Duration::from_millis(40)),
        Step::Candidate(host(5001)),
        Step::Sleep(Duration::from_millis(60)),
        Step::Candidate(srflx(5002)),
        Step::Complete,
    ];
    let (result, output, closed) = run_script("stun:stun.example.org", script, 5000).await;
    let report = result.unwrap();

    assert_eq!(report.outcome, ProbeOutcome::Complete);
    assert_eq!(report.in_flight, 0);
    assert_eq!(report.candidates().count(), 3);
    assert!(closed.load(Ordering::Acquire));

    let elapsed: Vec<Duration> = report.events.iter().map(|e| e.elapsed).collect();
    assert!(elapsed.windows(2).all(|w| w[0] < w[1]));
    assert!(elapsed[0] >= Duration::from_millis(20));
    assert!(report.duration >= elapsed[2]);

    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 1 + 3 * 2 + 1);
    assert_eq!(lines[0], "gathering...");
    for (i, candidate) in report.candidates().enumerate() {
        let time_line = lines[1 + 2 * i];
        assert!(time_line.starts_with("time: ") && time_line.ends_with('s'));
        let secs: f64 = time_line["time: ".len()..time_line.len() - 1].parse().unwrap();
        assert!(secs >= 0.0);
        let decoded: Candidate = serde_json::from_str(lines[2 + 2 * i]).unwrap();
        assert_eq!(&decoded, candidate);
    }
    assert_eq!(lines[7], "gathering complete!");
}

#[tokio::test]
async fn test_no_completion_times_out() {
    let start = Instant::now();
    let (result, output, closed) =
        run_script("stun:stun.example.org", vec![Step::Hang], 1000).await;
    let report = result.unwrap();

    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(report.outcome, ProbeOutcome::TimedOut);
    assert_eq!(report.candidates().count(), 0);
    assert_eq!(output, "gathering...\ntimeout!\n");
    // The engine is cancelled once the probe gives up.
    assert!(closed.load(Ordering::Acquire));
}

#[tokio::test]
async fn test_empty_endpoint_fails_before_gathering() {
    let (result, output, closed) = run_script("", vec![Step::Complete], 1000).await;
    assert!(matches!(result, Err(ProbeError::GathererInitFailed(_))));
    assert!(output.is_empty());
    assert!(!closed.load(Ordering::Acquire));
}

#[tokio::test]
async fn test_engine_refusing_to_start_writes_failure_line() {
    let probe = TimingProbe::new("stun:stun.example.org", settings(1000));
    let mut reporter = Reporter::new(Vec::new(), OutputFormat::Text);
    let closed = Arc::new(AtomicBool::new(false));
    let start = Instant::now();
    let result = probe
        .run(
            |_| {
                Ok(RefusingEngine {
                    closed: closed.clone(),
                })
            },
            &mut reporter,
        )
        .await;

    assert!(matches!(
        result,
        Err(ProbeError::StartFailed(EngineError::AlreadyStarted))
    ));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(closed.load(Ordering::Acquire));
    let output = String::from_utf8(reporter.into_inner()).unwrap();
    assert_eq!(output, "gathering...\ngathering failed!\n");
}

#[tokio::test]
async fn test_end_of_candidates_before_complete() {
    let script = vec![
        Step::Candidate(host(6000)),
        Step::EndOfCandidates,
        Step::Complete,
    ];
    let (result, output, _) = run_script("stun:stun.example.org", script, 5000).await;
    let report = result.unwrap();

    assert_eq!(report.outcome, ProbeOutcome::Complete);
    assert!(report.saw_end_of_candidates());
    assert_eq!(report.events.len(), 2);
    assert_eq!(report.candidates().count(), 1);
    assert_eq!(report.in_flight, 0);

    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[3], "gathering complete!");
    assert!(!output.contains("null"));
}

#[tokio::test]
async fn test_timeout_keeps_candidates_already_processed() {
    let script = vec![
        Step::Candidate(host(7000)),
        Step::Candidate(srflx(7001)),
        Step::Hang,
    ];
    let (result, output, _) = run_script("stun:stun.example.org", script, 300).await;
    let report = result.unwrap();

    assert_eq!(report.outcome, ProbeOutcome::TimedOut);
    assert_eq!(report.candidates().count(), 2);
    assert!(output.ends_with("timeout!\n"));
    assert!(!output.contains("gathering complete!"));
}

#[tokio::test]
async fn test_complete_without_sink_release_is_bounded_by_grace() {
    let script = vec![Step::Candidate(host(8000)), Step::Complete, Step::Hang];
    let start = Instant::now();
    let (result, output, closed) = run_script("stun:stun.example.org", script, 5000).await;
    let report = result.unwrap();

    assert_eq!(report.outcome, ProbeOutcome::Complete);
    assert_eq!(report.candidates().count(), 1);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(closed.load(Ordering::Acquire));
    assert_eq!(output.matches("gathering complete!").count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_delivery_drains_to_zero() {
    let probe = TimingProbe::new("stun:stun.example.org", settings(5000));
    let mut reporter = Reporter::new(Vec::new(), OutputFormat::Text);
    let report = probe
        .run(
            |_| {
                Ok(ThreadedEngine {
                    threads: 8,
                    per_thread: 50,
                })
            },
            &mut reporter,
        )
        .await
        .unwrap();

    assert_eq!(report.outcome, ProbeOutcome::Complete);
    assert_eq!(report.in_flight, 0);
    assert_eq!(report.candidates().count(), 400);
    assert!(report.saw_end_of_candidates());
    assert!(report.events.iter().all(|e| e.elapsed <= report.duration));

    let output = String::from_utf8(reporter.into_inner()).unwrap();
    assert_eq!(output.matches("time: ").count(), 400);
    assert_eq!(output.matches("gathering complete!").count(), 1);
    assert!(!output.contains("timeout!"));
}

#[tokio::test]
async fn test_zero_candidates_complete() {
    let script = vec![Step::EndOfCandidates, Step::Complete];
    let (result, output, _) = run_script("stun:stun.example.org", script, 1000).await;
    let report = result.unwrap();
    assert_eq!(report.outcome, ProbeOutcome::Complete);
    assert_eq!(report.candidates().count(), 0);
    assert_eq!(output, "gathering...\ngathering complete!\n");
}
