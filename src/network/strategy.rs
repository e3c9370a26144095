//! The capability shared by every capture technique, plus the per-attempt
//! plumbing the orchestrator hands to a strategy.

use crossbeam_channel::Sender;
use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use crate::config::StrategyConfig;
use crate::{Result, SnifferError};
use super::interfaces::NetworkInterface;
use super::packet::PacketRecord;

/// Batches in a row that may fail to parse before a strategy gives up.
pub const MAX_CONSECUTIVE_BAD_BATCHES: usize = 5;

/// Interface identifier handed to a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceTarget {
    /// Let the capture mechanism pick.
    Auto,
    Named {
        /// Name as discovered on the host.
        name: String,
        /// Identifier in the form the strategy expects (name or index).
        id: String,
        /// True when the requested interface could not be used and this one
        /// was substituted.
        substituted: bool,
    },
}

impl InterfaceTarget {
    pub fn id(&self) -> Option<&str> {
        match self {
            InterfaceTarget::Auto => None,
            InterfaceTarget::Named { id, .. } => Some(id),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            InterfaceTarget::Auto => None,
            InterfaceTarget::Named { name, .. } => Some(name),
        }
    }

    pub fn is_substituted(&self) -> bool {
        matches!(self, InterfaceTarget::Named { substituted: true, .. })
    }
}

/// Messages from an attempt thread to the orchestrator worker.
#[derive(Debug)]
pub enum AttemptEvent {
    Record(PacketRecord),
    /// The strategy passed its own probe and commits to a full run.
    ProbeConfirmed,
    Finished(Result<usize>),
}

/// One technique for obtaining packets.
pub trait CaptureStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Maps a discovered interface to the identifier this strategy uses.
    /// `None` means the mapping failed.
    fn translate_interface(&self, interface: &NetworkInterface) -> Option<String> {
        Some(interface.name.clone())
    }

    /// Fallback strategies only run when nothing else produced a record.
    fn is_fallback(&self) -> bool {
        false
    }

    /// Captures until the context says to stop. Returns the number of
    /// records emitted.
    fn attempt(&self, ctx: &AttemptContext) -> Result<usize>;
}

/// Everything one strategy attempt may read or signal.
pub struct AttemptContext {
    pub interface: InterfaceTarget,
    pub filter: Option<String>,
    /// 0 = unbounded.
    pub packet_count: usize,
    pub deadline: Instant,
    pub probe_timeout: Duration,
    pub settings: StrategyConfig,
    pub promiscuous: bool,
    cancel: Arc<AtomicBool>,
    process: ProcessSlot,
    events: Sender<AttemptEvent>,
}

impl AttemptContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        interface: InterfaceTarget,
        filter: Option<String>,
        packet_count: usize,
        deadline: Instant,
        probe_timeout: Duration,
        settings: StrategyConfig,
        promiscuous: bool,
        cancel: Arc<AtomicBool>,
        process: ProcessSlot,
        events: Sender<AttemptEvent>,
    ) -> Self {
        Self {
            interface,
            filter,
            packet_count,
            deadline,
            probe_timeout,
            settings,
            promiscuous,
            cancel,
            process,
            events,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn reached_count(&self, emitted: usize) -> bool {
        self.packet_count > 0 && emitted >= self.packet_count
    }

    /// True while the attempt should keep capturing.
    pub fn should_continue(&self, emitted: usize) -> bool {
        !self.is_cancelled() && Instant::now() < self.deadline && !self.reached_count(emitted)
    }

    /// Returns false once the orchestrator stopped listening.
    pub fn emit(&self, record: PacketRecord) -> bool {
        self.events.send(AttemptEvent::Record(record)).is_ok()
    }

    pub fn confirm_probe(&self) {
        let _ = self.events.send(AttemptEvent::ProbeConfirmed);
    }

    /// A handle that confirms the probe from another thread, e.g. a stderr
    /// watcher waiting for the capture tool's start banner.
    pub fn probe_confirmer(&self) -> impl Fn() + Send + 'static {
        let events = self.events.clone();
        move || {
            let _ = events.send(AttemptEvent::ProbeConfirmed);
        }
    }

    pub fn process(&self) -> &ProcessSlot {
        &self.process
    }
}

/// Subprocess owned jointly by the attempt thread and the orchestrator, so
/// the orchestrator can kill a capture that overruns its deadline.
#[derive(Clone, Default)]
pub struct ProcessSlot {
    child: Arc<Mutex<Option<Child>>>,
    stderr: Arc<Mutex<String>>,
}

impl ProcessSlot {
    /// Spawns `command` with piped output and parks the child in the slot.
    /// Stderr is drained on a helper thread.
    pub fn spawn(&self, command: Command) -> std::io::Result<(ChildStdout, JoinHandle<()>)> {
        self.spawn_watching(command, |_| {})
    }

    /// Like [`spawn`](Self::spawn), handing each stderr line to `on_stderr`
    /// as it arrives.
    pub fn spawn_watching<F>(&self, mut command: Command, mut on_stderr: F) -> std::io::Result<(ChildStdout, JoinHandle<()>)>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "stdout not captured"))?;
        let stderr = child.stderr.take();
        let sink = Arc::clone(&self.stderr);
        let drain = thread::spawn(move || {
            if let Some(stderr) = stderr {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    on_stderr(&line);
                    if let Ok(mut buffer) = sink.lock() {
                        buffer.push_str(&line);
                        buffer.push('\n');
                    }
                }
            }
        });

        if let Ok(mut slot) = self.child.lock() {
            *slot = Some(child);
        }
        Ok((stdout, drain))
    }

    /// Kills the parked child, if any. Returns whether a process was killed.
    pub fn kill(&self) -> bool {
        match self.child.lock() {
            Ok(mut slot) => match slot.as_mut() {
                Some(child) => child.kill().is_ok(),
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Reaps the child and clears the slot.
    pub fn wait(&self) -> std::io::Result<Option<ExitStatus>> {
        let child = match self.child.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match child {
            Some(mut child) => child.wait().map(Some),
            None => Ok(None),
        }
    }

    pub fn stderr(&self) -> String {
        self.stderr.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Counts batches in a row that yielded nothing parsable.
#[derive(Debug, Default)]
pub struct BatchTracker {
    consecutive_bad: usize,
}

impl BatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one batch outcome. Errors once the bad-batch limit is hit.
    pub fn record(&mut self, strategy: &str, parsed: usize, failed: usize) -> Result<()> {
        if failed > 0 && parsed == 0 {
            self.consecutive_bad += 1;
            log::debug!("{}: unparsable batch ({} in a row)", strategy, self.consecutive_bad);
        } else if parsed > 0 {
            self.consecutive_bad = 0;
        }
        self.check(strategy)
    }

    /// Records a batch that failed outright (read error).
    pub fn record_error(&mut self, strategy: &str, error: &dyn std::fmt::Display) -> Result<()> {
        self.consecutive_bad += 1;
        log::debug!("{}: batch error ({} in a row): {}", strategy, self.consecutive_bad, error);
        self.check(strategy)
    }

    fn check(&self, strategy: &str) -> Result<()> {
        if self.consecutive_bad >= MAX_CONSECUTIVE_BAD_BATCHES {
            return Err(SnifferError::probe(
                strategy,
                format!("{} consecutive unparsable batches", self.consecutive_bad),
            ));
        }
        Ok(())
    }
}
