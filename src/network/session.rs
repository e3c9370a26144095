use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use crate::config::CaptureConfig;
use crate::utils::generate_session_id;
use super::packet::PacketRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Running,
    Stopped,
    Failed,
}

impl SessionState {
    /// Idle -> Running -> {Stopped, Failed}. Terminal states absorb.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Idle, SessionState::Running)
                | (SessionState::Idle, SessionState::Failed)
                | (SessionState::Running, SessionState::Stopped)
                | (SessionState::Running, SessionState::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

/// Where the orchestrator is within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapturePhase {
    Idle,
    Starting,
    /// Attempting the named strategy.
    Running(String),
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for CapturePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapturePhase::Idle => write!(f, "idle"),
            CapturePhase::Starting => write!(f, "starting"),
            CapturePhase::Running(strategy) => write!(f, "running({})", strategy),
            CapturePhase::Stopping => write!(f, "stopping"),
            CapturePhase::Stopped => write!(f, "stopped"),
            CapturePhase::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureStatistics {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub elapsed_secs: f64,
    pub packets_per_second: f64,
    pub protocols: BTreeMap<String, u64>,
    pub is_running: bool,
}

/// Snapshot returned to callers polling a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub id: String,
    pub state: SessionState,
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub demo_mode: bool,
    /// Records currently buffered.
    pub buffered: usize,
    pub stats: CaptureStatistics,
    /// Seconds since start.
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final result of a session, records included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub id: String,
    pub state: SessionState,
    pub packets: Vec<PacketRecord>,
    pub stats: CaptureStatistics,
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct SessionInner {
    state: SessionState,
    phase: CapturePhase,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    stopped: Option<Instant>,
    buffer: VecDeque<PacketRecord>,
    total_packets: u64,
    total_bytes: u64,
    protocols: BTreeMap<String, u64>,
    strategy: Option<String>,
    demo_mode: bool,
    error: Option<String>,
}

impl SessionInner {
    fn elapsed_secs(&self) -> f64 {
        match self.started {
            Some(started) => {
                let end = self.stopped.unwrap_or_else(Instant::now);
                end.saturating_duration_since(started).as_secs_f64()
            }
            None => 0.0,
        }
    }

    fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            log::debug!("Ignoring session transition {:?} -> {:?}", self.state, next);
            return false;
        }
        self.state = next;
        match next {
            SessionState::Running => {
                self.started_at = Some(Utc::now());
                self.started = Some(Instant::now());
                self.phase = CapturePhase::Starting;
            }
            SessionState::Stopped | SessionState::Failed => {
                self.stopped_at = Some(Utc::now());
                self.stopped = Some(Instant::now());
                self.phase = if next == SessionState::Stopped {
                    CapturePhase::Stopped
                } else {
                    CapturePhase::Failed
                };
            }
            SessionState::Idle => {}
        }
        true
    }
}

/// One capture run. The orchestrator's worker is the only writer; every
/// read returns a copy.
pub struct CaptureSession {
    id: String,
    config: CaptureConfig,
    capacity: usize,
    inner: RwLock<SessionInner>,
    stop_requested: AtomicBool,
    done: Receiver<()>,
    join_grace: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureSession {
    /// Creates an idle session. The returned sender is held by the worker;
    /// dropping it marks the worker finished.
    pub fn new(config: CaptureConfig, capacity: usize, join_grace: Duration) -> (Self, Sender<()>) {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let capacity = capacity.max(1);
        let session = Self {
            id: generate_session_id(),
            config,
            capacity,
            inner: RwLock::new(SessionInner {
                state: SessionState::Idle,
                phase: CapturePhase::Idle,
                started_at: None,
                stopped_at: None,
                started: None,
                stopped: None,
                buffer: VecDeque::with_capacity(capacity.min(4096)),
                total_packets: 0,
                total_bytes: 0,
                protocols: BTreeMap::new(),
                strategy: None,
                demo_mode: false,
                error: None,
            }),
            stop_requested: AtomicBool::new(false),
            done: done_rx,
            join_grace,
            worker: Mutex::new(None),
        };
        (session, done_tx)
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> SessionState {
        self.read().state
    }

    pub fn phase(&self) -> CapturePhase {
        self.read().phase.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.read().started_at
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.read().stopped_at
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// True once the worker has exited.
    pub fn is_finished(&self) -> bool {
        matches!(self.done.try_recv(), Err(crossbeam_channel::TryRecvError::Disconnected))
    }

    /// Blocks until the worker exits or `timeout` passes. Returns whether
    /// the worker finished.
    pub fn wait(&self, timeout: Duration) -> bool {
        !matches!(self.done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    /// The most recent `limit` records (all when `None`), oldest first.
    pub fn records(&self, limit: Option<usize>) -> Vec<PacketRecord> {
        let inner = self.read();
        let len = inner.buffer.len();
        let skip = limit.map(|l| len.saturating_sub(l)).unwrap_or(0);
        inner.buffer.iter().skip(skip).cloned().collect()
    }

    pub fn statistics(&self) -> CaptureStatistics {
        Self::statistics_of(&self.read())
    }

    fn statistics_of(inner: &SessionInner) -> CaptureStatistics {
        let elapsed_secs = inner.elapsed_secs();
        let packets_per_second = if elapsed_secs > 0.0 {
            inner.total_packets as f64 / elapsed_secs
        } else {
            0.0
        };
        CaptureStatistics {
            total_packets: inner.total_packets,
            total_bytes: inner.total_bytes,
            elapsed_secs,
            packets_per_second,
            protocols: inner.protocols.clone(),
            is_running: inner.state == SessionState::Running,
        }
    }

    /// State, phase and statistics come from one lock acquisition, so the
    /// snapshot is consistent.
    pub fn status(&self) -> SessionStatus {
        let inner = self.read();
        let stats = Self::statistics_of(&inner);
        SessionStatus {
            id: self.id.clone(),
            state: inner.state,
            phase: inner.phase.to_string(),
            strategy: inner.strategy.clone(),
            demo_mode: inner.demo_mode,
            buffered: inner.buffer.len(),
            duration: stats.elapsed_secs,
            stats,
            error: inner.error.clone(),
        }
    }

    pub fn report(&self) -> SessionReport {
        let inner = self.read();
        let stats = Self::statistics_of(&inner);
        SessionReport {
            id: self.id.clone(),
            state: inner.state,
            packets: inner.buffer.iter().cloned().collect(),
            duration: stats.elapsed_secs,
            stats,
            error: inner.error.clone(),
        }
    }

    /// Requests a cooperative stop and waits up to the join grace for the
    /// worker. Safe to call repeatedly.
    pub fn stop(&self) -> SessionStatus {
        if self.state().is_terminal() {
            return self.status();
        }

        log::info!("Stopping capture session {}", self.id);
        self.stop_requested.store(true, Ordering::SeqCst);
        if self.state() == SessionState::Running {
            self.set_phase(CapturePhase::Stopping);
        }

        if self.wait(self.join_grace) {
            let handle = self.worker.lock().ok().and_then(|mut w| w.take());
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    log::error!("Capture worker for session {} panicked", self.id);
                }
            }
        } else {
            log::warn!(
                "Capture worker for session {} did not exit within {:?}, detaching",
                self.id,
                self.join_grace
            );
            if let Ok(mut worker) = self.worker.lock() {
                worker.take();
            }
        }

        self.finish(SessionState::Stopped, None);
        self.status()
    }

    pub(crate) fn attach_worker(&self, handle: JoinHandle<()>) {
        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(handle);
        }
    }

    pub(crate) fn mark_running(&self) -> bool {
        self.write().transition(SessionState::Running)
    }

    pub(crate) fn set_phase(&self, phase: CapturePhase) {
        let mut inner = self.write();
        if !inner.state.is_terminal() {
            inner.phase = phase;
        }
    }

    pub(crate) fn set_strategy(&self, strategy: &str, demo_mode: bool) {
        let mut inner = self.write();
        if inner.state.is_terminal() {
            return;
        }
        inner.strategy = Some(strategy.to_string());
        inner.demo_mode = demo_mode;
        inner.phase = CapturePhase::Running(strategy.to_string());
    }

    /// Appends a record, evicting the oldest when the buffer is full.
    pub(crate) fn push(&self, record: PacketRecord) {
        let mut inner = self.write();
        if inner.state.is_terminal() {
            return;
        }
        inner.total_packets += 1;
        inner.total_bytes += record.length as u64;
        *inner.protocols.entry(record.protocol.to_string()).or_insert(0) += 1;
        if inner.buffer.len() >= self.capacity {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(record);
    }

    /// Moves to a terminal state. Later calls are ignored.
    pub(crate) fn finish(&self, state: SessionState, error: Option<String>) -> bool {
        let mut inner = self.write();
        if !inner.transition(state) {
            return false;
        }
        if error.is_some() {
            inner.error = error;
        }
        log::info!(
            "Capture session {} {:?} with {} packets",
            self.id,
            inner.state,
            inner.total_packets
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::Protocol;

    fn record(length: usize, protocol: Protocol, info: &str) -> PacketRecord {
        PacketRecord {
            timestamp: Utc::now(),
            protocol,
            src_ip: Some("10.0.0.1".to_string()),
            dst_ip: Some("10.0.0.2".to_string()),
            src_port: None,
            dst_port: None,
            length,
            info: info.to_string(),
        }
    }

    fn running_session(capacity: usize) -> (CaptureSession, Sender<()>) {
        let (session, done) = CaptureSession::new(CaptureConfig::default(), capacity, Duration::from_millis(50));
        assert!(session.mark_running());
        (session, done)
    }

    #[test]
    fn test_state_transitions_are_monotonic() {
        assert!(SessionState::Idle.can_transition_to(SessionState::Running));
        assert!(SessionState::Running.can_transition_to(SessionState::Stopped));
        assert!(!SessionState::Stopped.can_transition_to(SessionState::Running));
        assert!(!SessionState::Failed.can_transition_to(SessionState::Stopped));
        assert!(!SessionState::Stopped.can_transition_to(SessionState::Failed));
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let (session, _done) = running_session(3);
        for i in 0..5 {
            session.push(record(100, Protocol::Tcp, &format!("packet {}", i)));
        }
        let records = session.records(None);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].info, "packet 2");
        assert_eq!(records[2].info, "packet 4");

        let stats = session.statistics();
        assert_eq!(stats.total_packets, 5);
        assert_eq!(stats.total_bytes, 500);
        assert_eq!(stats.protocols.get("TCP"), Some(&5));
    }

    #[test]
    fn test_records_limit_returns_most_recent() {
        let (session, _done) = running_session(10);
        for i in 0..6 {
            session.push(record(60, Protocol::Udp, &format!("packet {}", i)));
        }
        let recent = session.records(Some(2));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].info, "packet 4");
        assert_eq!(session.records(Some(100)).len(), 6);
    }

    #[test]
    fn test_statistics_before_start() {
        let (session, _done) = CaptureSession::new(CaptureConfig::default(), 10, Duration::from_millis(50));
        let stats = session.statistics();
        assert_eq!(stats.elapsed_secs, 0.0);
        assert_eq!(stats.packets_per_second, 0.0);
        assert!(!stats.is_running);
        assert_eq!(session.status().phase, "idle");
    }

    #[test]
    fn test_finish_is_absorbing() {
        let (session, _done) = running_session(10);
        assert!(session.finish(SessionState::Failed, Some("boom".to_string())));
        assert!(!session.finish(SessionState::Stopped, None));
        session.push(record(10, Protocol::Tcp, "late"));

        let status = session.status();
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(status.error.as_deref(), Some("boom"));
        assert_eq!(status.buffered, 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (session, done) = running_session(10);
        drop(done);
        session.push(record(42, Protocol::Icmp, "ping"));

        let first = session.stop();
        let second = session.stop();
        assert_eq!(first.state, SessionState::Stopped);
        assert_eq!(second.state, SessionState::Stopped);
        assert_eq!(first.stats.total_packets, second.stats.total_packets);
        assert!(session.is_stop_requested());
        assert!(session.is_finished());
    }

    #[test]
    fn test_stop_detaches_unresponsive_worker() {
        let (session, _done) = running_session(10);
        let status = session.stop();
        assert_eq!(status.state, SessionState::Stopped);
        assert!(!session.is_finished());
    }

    #[test]
    fn test_status_serializes_contract_fields() {
        let (session, _done) = running_session(10);
        session.set_strategy("synthetic", true);
        let json = serde_json::to_value(session.status()).unwrap();
        for key in ["id", "state", "phase", "strategy", "demo_mode", "buffered", "stats", "duration"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(json["state"], "running");
        assert_eq!(json["phase"], "running(synthetic)");
    }

    #[test]
    fn test_status_snapshot_is_consistent() {
        let (session, _done) = running_session(10);
        session.push(record(60, Protocol::Tcp, "syn"));
        let status = session.status();
        assert_eq!(status.state, SessionState::Running);
        assert!(status.stats.is_running);
        assert_eq!(status.buffered as u64, status.stats.total_packets);

        session.finish(SessionState::Stopped, None);
        let status = session.status();
        assert_eq!(status.state, SessionState::Stopped);
        assert!(!status.stats.is_running);
        assert_eq!(status.duration, status.stats.elapsed_secs);
    }

    #[test]
    fn test_report_carries_records() {
        let (session, _done) = running_session(10);
        session.push(record(80, Protocol::Dns, "query"));
        session.finish(SessionState::Stopped, None);

        let json = serde_json::to_value(session.report()).unwrap();
        assert_eq!(json["state"], "stopped");
        assert_eq!(json["packets"].as_array().map(Vec::len), Some(1));
        assert_eq!(json["packets"][0]["protocol"], "DNS");
        assert!(json.get("error").is_none());
    }
}
