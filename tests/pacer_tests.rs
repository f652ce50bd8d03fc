use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use agentmesh::config::LiveTuning;
use agentmesh::pacer::{PacerTuning, RequestPacer};

// ─── Helper ───────────────────────────────────────────────────────────

fn tuning(max_inflight: usize, min_start_interval_ms: u64) -> PacerTuning {
    PacerTuning {
        max_inflight,
        min_start_interval: Duration::from_millis(min_start_interval_ms),
        start_jitter: Duration::ZERO,
        rate_limit_cooldown: Duration::from_secs(1),
        rate_limit_cooldown_max: Duration::from_secs(2),
        wait_poll_interval: Duration::from_millis(100),
    }
}

/// Run `calls` paced calls on a dedicated OS thread with its own
/// current-thread runtime. Returns the start instants.
fn spawn_caller(
    pacer: Arc<RequestPacer>,
    concurrent: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    calls: usize,
    hold: Duration,
) -> thread::JoinHandle<Vec<Instant>> {
    thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let mut starts = Vec::new();
            for _ in 0..calls {
                let _permit = pacer.acquire(|_, _| {}).await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                starts.push(Instant::now());
                tokio::time::sleep(hold).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }
            starts
        })
    })
}

// ============================================================
// Cross-runtime admission control
// ============================================================

#[test]
fn test_capacity_one_is_honoured_across_os_threads() {
    let pacer = Arc::new(RequestPacer::new(LiveTuning::new(tuning(1, 0))));
    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let a = spawn_caller(pacer.clone(), concurrent.clone(), peak.clone(), 3, Duration::from_millis(50));
    let b = spawn_caller(pacer.clone(), concurrent.clone(), peak.clone(), 3, Duration::from_millis(50));
    let mut starts = a.join().unwrap();
    starts.extend(b.join().unwrap());

    assert_eq!(starts.len(), 6);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(pacer.snapshot().inflight, 0);
}

#[test]
fn test_starts_are_spaced_across_os_threads() {
    let pacer = Arc::new(RequestPacer::new(LiveTuning::new(tuning(4, 200))));
    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let a = spawn_caller(pacer.clone(), concurrent.clone(), peak.clone(), 2, Duration::ZERO);
    let b = spawn_caller(pacer.clone(), concurrent.clone(), peak.clone(), 2, Duration::ZERO);
    let mut starts = a.join().unwrap();
    starts.extend(b.join().unwrap());
    starts.sort();

    for pair in starts.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        // Allow a little scheduler slack below the configured interval.
        assert!(gap >= Duration::from_millis(150), "starts only {gap:?} apart");
    }
}

#[test]
fn test_rate_limit_from_one_thread_brakes_the_other() {
    let pacer = Arc::new(RequestPacer::new(LiveTuning::new(tuning(4, 0))));
    pacer.register_rate_limit(Some(Duration::from_millis(400)));

    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let began = Instant::now();
    let starts = spawn_caller(pacer, concurrent, peak, 1, Duration::ZERO)
        .join()
        .unwrap();

    assert!(starts[0].duration_since(began) >= Duration::from_millis(350));
}
