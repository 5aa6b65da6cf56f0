//! # Flow-Control Reactor Module
//!
//! A per-process supervisory agent with a permanently running action loop
//! that communicates with the parent supervisor: it requests a hard kill
//! when a task overruns its deadline, ships periodic liveness pings, and
//! batches worker events.
//!
//! ## Action loop
//!
//! A background task ticks every 200ms and runs three actions in order:
//!
//! 1. **Hard kill**: snapshot the running-task map; for every entry whose
//!    hard deadline has passed, call `mark_for_termination(pid)` on the
//!    parent once and drop the entry locally. The parent decides the actual
//!    OS action; the in-process task is not interrupted here.
//! 2. **Ping**: every 30s, swap the accumulator and report tasks done,
//!    summed task duration and the idle percentage computed from per-tick
//!    idle points. The first flush after startup is a warm-up and is not
//!    transmitted. Initial deadlines are randomised to de-correlate pings
//!    across the fleet.
//! 3. **Events**: every 60s, drain the buffer, collapse duplicates by
//!    (origin, type, body) summing repeats and keeping the latest
//!    timestamp, and ship them sorted ascending by timestamp.
//!
//! An action failure is recorded as an ERROR event and never stops the
//! loop; all parent RPC is best effort.
//!
//! ## Task scopes
//!
//! The executor enters a task through [`FlowControlReactor::task_scope`].
//! The returned guard keeps the running-task map accurate on every exit
//! path: `complete()` on success, `fail()` on error, and plain drop (the
//! panic path) counts as a failure. A task is in the map exactly while it
//! executes.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;

use crate::rpc_client::{EventKind, EventRecord, PingData, WorkerRpc};
use crate::worker_error::WorkerError;

pub const ORIGIN_HARD_KILL: &str = "FlowControlReactor.action_hard_kill";
pub const ORIGIN_TASK_ENDED: &str = "FlowControlReactor.task_ended";
pub const ORIGIN_ACTION_LOOP: &str = "FlowControlReactor.action_loop";

/// Reactor pacing. Defaults match production; tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    pub tick_interval: Duration,
    pub ping_interval: Duration,
    pub events_interval: Duration,
    pub max_keep_events: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(200),
            ping_interval: Duration::from_secs(30),
            events_interval: Duration::from_secs(60),
            max_keep_events: 5000,
        }
    }
}

#[derive(Debug, Clone)]
struct RunningTask {
    taskname: String,
    t_hard: f64,
    #[allow(dead_code)]
    t_soft: f64,
    started: Instant,
}

#[derive(Debug, Default)]
struct PingAccumulator {
    tasks_done: u64,
    task_duration: f64,
}

struct PingState {
    data: PingAccumulator,
    idle_points: u64,
    total_points: u64,
    last_flush: Instant,
    flushes: u64,
}

struct EventState {
    buffer: Vec<EventRecord>,
    last_flush: Instant,
}

struct ReactorShared {
    pid: u32,
    config: ReactorConfig,
    rpc: Arc<dyn WorkerRpc>,
    running: Mutex<HashMap<u64, RunningTask>>,
    ping: Mutex<PingState>,
    events: Mutex<EventState>,
    next_scope_id: AtomicU64,
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl ReactorShared {
    fn add_event(&self, origin: &str, kind: EventKind, body: String, repeats: u64) {
        let mut events = self.events.lock().expect("event lock");
        events.buffer.push(EventRecord {
            origin: origin.to_string(),
            kind,
            body,
            timestamp: unix_now(),
            repeats,
        });
        let len = events.buffer.len();
        if len > self.config.max_keep_events {
            events.buffer.drain(..len - self.config.max_keep_events);
        }
    }

    fn task_received(&self, taskname: &str, t_hard: f64, t_soft: f64) -> u64 {
        let id = self.next_scope_id.fetch_add(1, Ordering::Relaxed);
        self.running.lock().expect("task lock").insert(
            id,
            RunningTask {
                taskname: taskname.to_string(),
                t_hard,
                t_soft,
                started: Instant::now(),
            },
        );
        id
    }

    fn task_ended(&self, id: u64, error: Option<String>) {
        let detail = self.running.lock().expect("task lock").remove(&id);
        match error {
            None => {
                let mut ping = self.ping.lock().expect("ping lock");
                ping.data.tasks_done += 1;
                if let Some(task) = detail {
                    ping.data.task_duration += task.started.elapsed().as_secs_f64();
                }
            }
            Some(message) => {
                self.add_event(ORIGIN_TASK_ENDED, EventKind::Error, message, 1);
            }
        }
    }

    /// Request termination for every task past its hard deadline. The RPC
    /// goes out before the entry is removed, so a failed call is retried on
    /// the next tick.
    async fn action_hard_kill(&self) -> Result<(), WorkerError> {
        let expired: Vec<(u64, RunningTask)> = {
            let running = self.running.lock().expect("task lock");
            running
                .iter()
                .filter(|(_, task)| task.started.elapsed().as_secs_f64() > task.t_hard)
                .map(|(id, task)| (*id, task.clone()))
                .collect()
        };
        for (id, task) in expired {
            let message = format!(
                "Hard kill request received for worker pid={}, task={}, t_hard={}",
                self.pid, task.taskname, task.t_hard
            );
            tracing::warn!(taskname = %task.taskname, t_hard = task.t_hard, "{message}");
            self.add_event(ORIGIN_HARD_KILL, EventKind::Action, message, 1);
            self.rpc.mark_for_termination(self.pid).await?;
            self.running.lock().expect("task lock").remove(&id);
        }
        Ok(())
    }

    /// Ship the accumulated ping report when due; otherwise record one
    /// idle/total point for this tick.
    async fn action_send_ping(&self) -> Result<(), WorkerError> {
        let now = Instant::now();
        let flush = {
            let mut ping = self.ping.lock().expect("ping lock");
            if now.saturating_duration_since(ping.last_flush) >= self.config.ping_interval {
                let data = mem::take(&mut ping.data);
                let idle = mem::take(&mut ping.idle_points);
                let total = mem::take(&mut ping.total_points);
                let timedelta = now.saturating_duration_since(ping.last_flush).as_secs_f64();
                ping.last_flush = now;
                let warmed_up = ping.flushes > 0;
                ping.flushes += 1;
                Some((data, idle, total, timedelta, warmed_up))
            } else {
                let idle = self.running.lock().expect("task lock").is_empty();
                ping.idle_points += u64::from(idle);
                ping.total_points += 1;
                None
            }
        };

        if let Some((data, idle, total, timedelta, warmed_up)) = flush {
            // the first swap after startup is warm-up and is not transmitted
            if warmed_up {
                let percent_idle = if total > 0 {
                    idle as f64 * 100.0 / total as f64
                } else {
                    0.0
                };
                self.rpc
                    .ping(
                        self.pid,
                        PingData {
                            timestamp: unix_now(),
                            timedelta,
                            tasks_done: data.tasks_done,
                            percent_idle,
                            task_duration: data.task_duration,
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Drain, collapse and ship buffered events when due.
    async fn action_send_events(&self) -> Result<(), WorkerError> {
        let now = Instant::now();
        let drained = {
            let mut events = self.events.lock().expect("event lock");
            if now.saturating_duration_since(events.last_flush) < self.config.events_interval {
                return Ok(());
            }
            events.last_flush = now;
            mem::take(&mut events.buffer)
        };
        if drained.is_empty() {
            return Ok(());
        }

        // newest first, so the kept record carries the latest timestamp
        let mut collapsed: HashMap<(String, EventKind, String), EventRecord> = HashMap::new();
        for event in drained.into_iter().rev() {
            let key = (event.origin.clone(), event.kind, event.body.clone());
            collapsed
                .entry(key)
                .and_modify(|kept| kept.repeats += event.repeats)
                .or_insert(event);
        }
        let mut batch: Vec<EventRecord> = collapsed.into_values().collect();
        batch.sort_by(|a, b| {
            a.timestamp
                .partial_cmp(&b.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.rpc.add_events(self.pid, batch).await
    }
}

async fn run_actions(shared: &ReactorShared) {
    let actions: [(&str, _); 3] = [
        ("action_hard_kill", shared.action_hard_kill().await),
        ("action_send_ping", shared.action_send_ping().await),
        ("action_send_events", shared.action_send_events().await),
    ];
    for (name, result) in actions {
        if let Err(e) = result {
            tracing::error!(action = name, error = %e, "error in reactor action loop");
            shared.add_event(ORIGIN_ACTION_LOOP, EventKind::Error, e.to_string(), 1);
        }
    }
}

/// RAII guard for one task execution. Exactly one of `complete` or `fail`
/// consumes it; dropping it unconsumed (the panic path) counts as failure.
pub struct TaskScope {
    shared: Arc<ReactorShared>,
    id: u64,
    finished: bool,
}

impl TaskScope {
    pub fn complete(mut self) {
        self.finished = true;
        self.shared.task_ended(self.id, None);
    }

    pub fn fail(mut self, error: &WorkerError) {
        self.finished = true;
        self.shared.task_ended(self.id, Some(error.to_string()));
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        if !self.finished {
            self.shared
                .task_ended(self.id, Some("task scope dropped without completion".to_string()));
        }
    }
}

/// The per-process flow-control reactor.
pub struct FlowControlReactor {
    shared: Arc<ReactorShared>,
    action_on: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FlowControlReactor {
    pub fn new(pid: u32, rpc: Arc<dyn WorkerRpc>, config: ReactorConfig) -> Self {
        let now = Instant::now();
        // randomise initial deadlines so a fleet of workers does not flush
        // in lockstep: pings start up to one interval early, events up to
        // one interval late
        let ping_jitter = config.ping_interval.mul_f64(rand::random::<f64>());
        let events_jitter = config.events_interval.mul_f64(rand::random::<f64>());
        let ping_last_flush = now.checked_sub(ping_jitter).unwrap_or(now);
        let events_last_flush = now.checked_add(events_jitter).unwrap_or(now);

        Self {
            shared: Arc::new(ReactorShared {
                pid,
                config,
                rpc,
                running: Mutex::new(HashMap::new()),
                ping: Mutex::new(PingState {
                    data: PingAccumulator::default(),
                    idle_points: 0,
                    total_points: 0,
                    last_flush: ping_last_flush,
                    flushes: 0,
                }),
                events: Mutex::new(EventState {
                    buffer: Vec::new(),
                    last_flush: events_last_flush,
                }),
                next_scope_id: AtomicU64::new(1),
            }),
            action_on: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the action loop. Idempotent.
    pub fn start(&self) {
        let mut handle = self.handle.lock().expect("handle lock");
        if handle.is_some() {
            return;
        }
        self.action_on.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let action_on = Arc::clone(&self.action_on);
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while action_on.load(Ordering::SeqCst) {
                ticker.tick().await;
                run_actions(&shared).await;
            }
        }));
    }

    pub fn stop(&self) {
        self.action_on.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().expect("handle lock").take() {
            handle.abort();
        }
    }

    /// Enter a task execution scope. The running-task map holds the entry
    /// until the guard is consumed or dropped.
    pub fn task_scope(&self, taskname: &str, t_hard: f64, t_soft: f64) -> TaskScope {
        let id = self.shared.task_received(taskname, t_hard, t_soft);
        TaskScope {
            shared: Arc::clone(&self.shared),
            id,
            finished: false,
        }
    }

    /// Buffer an event for the next flush.
    pub fn add_event(&self, origin: &str, kind: EventKind, body: impl Into<String>) {
        self.shared.add_event(origin, kind, body.into(), 1);
    }

    /// Number of tasks currently inside a scope.
    pub fn running_task_count(&self) -> usize {
        self.shared.running.lock().expect("task lock").len()
    }

    /// Number of buffered, not yet flushed events.
    pub fn pending_event_count(&self) -> usize {
        self.shared.events.lock().expect("event lock").buffer.len()
    }
}

static REACTOR: OnceLock<Arc<FlowControlReactor>> = OnceLock::new();

/// Install the process-wide reactor. Idempotent: the first instance wins.
pub fn install(reactor: Arc<FlowControlReactor>) -> Arc<FlowControlReactor> {
    Arc::clone(REACTOR.get_or_init(|| reactor))
}

/// The process-wide reactor, when installed.
pub fn instance() -> Option<Arc<FlowControlReactor>> {
    REACTOR.get().map(Arc::clone)
}
