//! Runs the strategy chain for one session at a time.
//!
//! Each session gets a dedicated worker thread. The worker runs every
//! strategy attempt on its own thread and consumes its records over a
//! channel, so a strategy stuck in a blocking read can be cancelled, have its
//! subprocess killed, and finally be detached without stalling the session.

use crossbeam_channel::RecvTimeoutError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use crate::config::{CaptureConfig, Config};
use crate::utils::is_elevated;
use crate::{Result, SnifferError};
use super::interfaces::{InterfaceRegistry, NetworkInterface};
use super::session::{CapturePhase, CaptureSession, SessionState, SessionStatus};
use super::strategies::default_chain;
use super::strategy::{AttemptContext, AttemptEvent, CaptureStrategy, InterfaceTarget, ProcessSlot};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct CaptureOrchestrator {
    config: Config,
    strategies: Vec<Arc<dyn CaptureStrategy>>,
    registry: InterfaceRegistry,
    current: Mutex<Option<Arc<CaptureSession>>>,
}

impl CaptureOrchestrator {
    pub fn new(config: &Config) -> Self {
        Self::with_strategies(default_chain(&config.strategies), config)
    }

    pub fn with_strategies(strategies: Vec<Arc<dyn CaptureStrategy>>, config: &Config) -> Self {
        Self {
            config: config.clone(),
            strategies,
            registry: InterfaceRegistry::new(),
            current: Mutex::new(None),
        }
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn interfaces(&self) -> Vec<NetworkInterface> {
        self.registry.discover()
    }

    /// The most recently started session.
    pub fn session(&self) -> Option<Arc<CaptureSession>> {
        self.current.lock().ok().and_then(|current| current.clone())
    }

    /// Starts a session on a background worker and returns immediately.
    pub fn start(&self, request: CaptureConfig) -> Result<Arc<CaptureSession>> {
        request.validate()?;

        let mut current = self
            .current
            .lock()
            .map_err(|_| SnifferError::InvalidConfig("orchestrator state poisoned".to_string()))?;
        if let Some(session) = current.as_ref() {
            if session.is_running() {
                return Err(SnifferError::Busy);
            }
        }

        let join_grace = self.config.strategies.stop_grace() * 3;
        let (session, done) = CaptureSession::new(request, self.config.capture.buffer_capacity, join_grace);
        let session = Arc::new(session);
        session.mark_running();
        log::info!(
            "Starting capture session {} (interface: {}, filter: {}, count: {}, timeout: {}s)",
            session.id(),
            session.config().interface.as_deref().unwrap_or("auto"),
            session.config().filter.as_deref().unwrap_or("none"),
            session.config().packet_count,
            session.config().timeout_secs
        );

        let worker = Worker {
            session: Arc::clone(&session),
            strategies: self.strategies.clone(),
            config: self.config.clone(),
            registry: self.registry,
        };
        let spawned = thread::Builder::new()
            .name(format!("capture-{}", &session.id()[..8]))
            .spawn(move || {
                let _done = done;
                let session = Arc::clone(&worker.session);
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| worker.run())) {
                    let message = panic_message(panic.as_ref());
                    log::error!("Capture worker for session {} panicked: {}", session.id(), message);
                    session.finish(SessionState::Failed, Some(format!("capture worker panicked: {}", message)));
                }
            });

        match spawned {
            Ok(handle) => session.attach_worker(handle),
            Err(e) => {
                session.finish(SessionState::Failed, Some(e.to_string()));
                return Err(SnifferError::Io(e));
            }
        }

        *current = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Stops the current session. Stopping a finished session returns its
    /// final status.
    pub fn stop(&self) -> Result<SessionStatus> {
        let session = self
            .session()
            .ok_or_else(|| SnifferError::InvalidConfig("no capture session has been started".to_string()))?;
        Ok(session.stop())
    }
}

struct Worker {
    session: Arc<CaptureSession>,
    strategies: Vec<Arc<dyn CaptureStrategy>>,
    config: Config,
    registry: InterfaceRegistry,
}

/// How one strategy attempt ended.
struct AttemptOutcome {
    delivered: usize,
    error: Option<SnifferError>,
}

impl Worker {
    fn run(&self) {
        let request = self.session.config().clone();
        let deadline = Instant::now() + request.timeout();
        let interfaces = self.registry.discover();
        let mut failures: Vec<SnifferError> = Vec::new();

        let (live, fallbacks): (Vec<_>, Vec<_>) = self.strategies.iter().partition(|s| !s.is_fallback());

        for strategy in live {
            if self.session.is_stop_requested() || Instant::now() >= deadline {
                break;
            }
            let outcome = self.attempt(strategy, Some(interfaces.as_slice()), deadline, false);
            if self.settle(strategy.name(), outcome, &mut failures) {
                return;
            }
        }

        if self.session.is_stop_requested() {
            self.session.finish(SessionState::Stopped, None);
            return;
        }

        // Fallbacks get at least one probe window even when live strategies
        // used up the session timeout.
        let fallback_deadline = deadline.max(Instant::now() + self.config.strategies.probe_timeout());
        for strategy in fallbacks {
            if self.session.is_stop_requested() {
                break;
            }
            log::warn!("No live strategy produced packets, falling back to {}", strategy.name());
            let outcome = self.attempt(strategy, None, fallback_deadline, true);
            if self.settle(strategy.name(), outcome, &mut failures) {
                return;
            }
        }

        if self.session.is_stop_requested() {
            self.session.finish(SessionState::Stopped, None);
            return;
        }

        let error = exhausted(&failures, is_elevated());
        log::error!("Capture session {} failed: {}", self.session.id(), error);
        self.session.finish(SessionState::Failed, Some(error.to_string()));
    }

    /// Returns true once the session is complete.
    fn settle(&self, strategy: &str, outcome: AttemptOutcome, failures: &mut Vec<SnifferError>) -> bool {
        if outcome.delivered > 0 {
            if let Some(error) = &outcome.error {
                log::warn!("Strategy {} ended with an error after {} packets: {}", strategy, outcome.delivered, error);
            }
            self.session.finish(SessionState::Stopped, outcome.error.map(|e| e.to_string()));
            return true;
        }

        let error = outcome
            .error
            .unwrap_or_else(|| SnifferError::probe(strategy, "no packets captured"));
        log::warn!("Abandoning strategy {}: {}", strategy, error);
        failures.push(error);
        false
    }

    /// Runs one strategy. With `interfaces`, the target is resolved on the
    /// attempt thread so a slow interface lookup is bounded like capture
    /// itself; without, the strategy picks automatically.
    fn attempt(
        &self,
        strategy: &Arc<dyn CaptureStrategy>,
        interfaces: Option<&[NetworkInterface]>,
        deadline: Instant,
        demo_mode: bool,
    ) -> AttemptOutcome {
        let name = strategy.name().to_string();
        let settings = &self.config.strategies;
        let request = self.session.config();
        let probe_timeout = settings.probe_timeout();
        let grace = settings.stop_grace();

        self.session.set_strategy(&name, demo_mode);

        let cancel = Arc::new(AtomicBool::new(false));
        let process = ProcessSlot::default();
        let (events_tx, events) = crossbeam_channel::unbounded();
        let interfaces = interfaces.map(<[NetworkInterface]>::to_vec);
        let thread_request = request.clone();
        let thread_settings = settings.clone();
        let promiscuous = self.config.capture.promiscuous;
        let thread_cancel = Arc::clone(&cancel);
        let thread_process = process.clone();

        let runner = Arc::clone(strategy);
        let spawned = thread::Builder::new()
            .name(format!("attempt-{}", name))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    let target = match &interfaces {
                        Some(interfaces) => resolve_target(&*runner, interfaces, &thread_request),
                        None => InterfaceTarget::Auto,
                    };
                    log::debug!("Attempting strategy {} on {:?}", runner.name(), target);
                    let ctx = AttemptContext::new(
                        target,
                        thread_request.filter.clone().filter(|f| !f.trim().is_empty()),
                        thread_request.packet_count,
                        deadline,
                        probe_timeout,
                        thread_settings,
                        promiscuous,
                        thread_cancel,
                        thread_process,
                        events_tx.clone(),
                    );
                    runner.attempt(&ctx)
                }))
                .unwrap_or_else(|panic| {
                    Err(SnifferError::probe(runner.name(), format!("panicked: {}", panic_message(panic.as_ref()))))
                });
                let _ = events_tx.send(AttemptEvent::Finished(result));
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                return AttemptOutcome {
                    delivered: 0,
                    error: Some(SnifferError::from_capture_io(&name, &e)),
                }
            }
        };

        let started = Instant::now();
        let mut delivered = 0usize;
        let mut confirmed = false;
        let mut probe_expired = false;
        let mut cancelled_at: Option<Instant> = None;
        let mut killed = false;
        let mut result: Option<Result<usize>> = None;
        let mut detached = false;

        loop {
            match events.recv_timeout(POLL_INTERVAL) {
                Ok(AttemptEvent::Record(record)) => {
                    confirmed = true;
                    if request.packet_count == 0 || delivered < request.packet_count {
                        self.session.push(record);
                        delivered += 1;
                    }
                }
                Ok(AttemptEvent::ProbeConfirmed) => {
                    log::debug!("Strategy {} confirmed its probe", name);
                    confirmed = true;
                }
                Ok(AttemptEvent::Finished(finished)) => {
                    result = Some(finished);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            match cancelled_at {
                None => {
                    let reason = if self.session.is_stop_requested() {
                        self.session.set_phase(CapturePhase::Stopping);
                        Some("stop requested")
                    } else if request.packet_count > 0 && delivered >= request.packet_count {
                        Some("packet count reached")
                    } else if now >= deadline {
                        Some("timeout reached")
                    } else if !confirmed && now.duration_since(started) >= probe_timeout {
                        probe_expired = true;
                        Some("probe window expired")
                    } else {
                        None
                    };
                    if let Some(reason) = reason {
                        log::debug!("Cancelling strategy {}: {}", name, reason);
                        cancel.store(true, Ordering::SeqCst);
                        cancelled_at = Some(now);
                    }
                }
                Some(at) => {
                    let waited = now.duration_since(at);
                    if !killed && waited >= grace {
                        if process.kill() {
                            log::warn!("Killed capture process of strategy {}", name);
                        }
                        killed = true;
                    }
                    if waited >= grace * 2 {
                        log::warn!("Strategy {} did not stop, detaching its thread", name);
                        detached = true;
                        break;
                    }
                }
            }
        }

        if detached {
            drop(handle);
        } else if handle.join().is_err() {
            log::error!("Attempt thread for {} panicked", name);
        }

        let error = match result {
            _ if probe_expired && delivered == 0 => Some(SnifferError::probe(&name, "no packets within probe window")),
            Some(Ok(count)) => {
                log::debug!("Strategy {} finished with {} packets", name, count);
                None
            }
            Some(Err(e)) => Some(e),
            None if detached => Some(SnifferError::Timeout(format!("strategy {} did not stop", name))),
            None => Some(SnifferError::probe(&name, "attempt ended without a result")),
        };

        AttemptOutcome { delivered, error }
    }
}

/// Picks the interface a strategy should capture on: the requested one when
/// it maps, otherwise the first interface with an address, otherwise
/// automatic selection.
pub fn resolve_target(
    strategy: &dyn CaptureStrategy,
    interfaces: &[NetworkInterface],
    request: &CaptureConfig,
) -> InterfaceTarget {
    let requested = request.requested_interface();

    if let Some(requested) = requested {
        if let Some(interface) = InterfaceRegistry::find(interfaces, requested) {
            if let Some(id) = strategy.translate_interface(interface) {
                return InterfaceTarget::Named {
                    name: interface.name.clone(),
                    id,
                    substituted: false,
                };
            }
        }
        log::warn!(
            "Interface '{}' could not be mapped for {}, substituting",
            requested,
            strategy.name()
        );
    }

    if let Some(interface) = InterfaceRegistry::first_with_address(interfaces) {
        if let Some(id) = strategy.translate_interface(interface) {
            return InterfaceTarget::Named {
                name: interface.name.clone(),
                id,
                substituted: requested.is_some(),
            };
        }
    }
    InterfaceTarget::Auto
}

/// The error reported once every strategy failed. Lack of privilege wins
/// over ordinary failures.
fn exhausted(failures: &[SnifferError], elevated: bool) -> SnifferError {
    if let Some(permission) = failures.iter().find(|e| e.is_permission()) {
        let mut detail = match permission {
            SnifferError::Permission(detail) => detail.clone(),
            other => other.to_string(),
        };
        if !elevated {
            detail.push_str(" (not running as root/Administrator)");
        }
        return SnifferError::Permission(detail);
    }
    if failures.is_empty() {
        return SnifferError::CaptureExhausted("no capture strategy is enabled".to_string());
    }
    let reasons: Vec<String> = failures.iter().map(|e| e.to_string()).collect();
    SnifferError::CaptureExhausted(reasons.join("; "))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
