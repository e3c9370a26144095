use chrono::Utc;
use pnet::datalink::{self, Channel, Config as DatalinkConfig, DataLinkReceiver};
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use crate::network::filter::{CaptureFilter, FilterParse};
use crate::network::normalizer::PacketNormalizer;
use crate::network::packet::{CapturedFrame, PacketRecord};
use crate::network::strategy::{AttemptContext, BatchTracker, CaptureStrategy, InterfaceTarget};
use crate::{Result, SnifferError};

const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatalinkMode {
    /// Iterate the channel continuously.
    Stream,
    /// Read bounded batches, each with its own timeout.
    Batch,
}

/// Captures through the native link-layer channel.
pub struct DatalinkStrategy {
    mode: DatalinkMode,
    normalizer: PacketNormalizer,
}

enum Frame {
    Parsed(CapturedFrame),
    Unparsable { length: usize, reason: String },
    Idle,
}

impl DatalinkStrategy {
    pub fn new(mode: DatalinkMode) -> Self {
        Self {
            mode,
            normalizer: PacketNormalizer::new(),
        }
    }

    pub fn stream() -> Self {
        Self::new(DatalinkMode::Stream)
    }

    pub fn batch() -> Self {
        Self::new(DatalinkMode::Batch)
    }

    fn open(&self, ctx: &AttemptContext) -> Result<Box<dyn DataLinkReceiver>> {
        let interfaces = datalink::interfaces();
        let interface = match &ctx.interface {
            InterfaceTarget::Named { id, .. } => interfaces.into_iter().find(|iface| &iface.name == id),
            InterfaceTarget::Auto => interfaces
                .into_iter()
                .find(|iface| iface.is_up() && !iface.is_loopback() && !iface.ips.is_empty()),
        }
        .ok_or_else(|| SnifferError::probe(self.name(), "no matching link-layer interface"))?;

        let config = DatalinkConfig {
            read_timeout: Some(READ_TIMEOUT),
            promiscuous: ctx.promiscuous,
            ..Default::default()
        };

        log::debug!("{}: opening channel on {}", self.name(), interface.name);
        match datalink::channel(&interface, config) {
            Ok(Channel::Ethernet(_tx, rx)) => Ok(rx),
            Ok(_) => Err(SnifferError::probe(self.name(), "unsupported channel type")),
            Err(e) => Err(SnifferError::from_capture_io(self.name(), &e)),
        }
    }

    fn read_frame(&self, rx: &mut dyn DataLinkReceiver) -> Result<Frame> {
        match rx.next() {
            Ok(bytes) => Ok(match CapturedFrame::decode(bytes, Utc::now()) {
                Ok(frame) => Frame::Parsed(frame),
                Err(e) => Frame::Unparsable {
                    length: bytes.len(),
                    reason: e.to_string(),
                },
            }),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(Frame::Idle)
            }
            Err(e) => Err(SnifferError::from_capture_io(self.name(), &e)),
        }
    }

    /// Record for a frame. Undecodable frames become `UNKNOWN` placeholders
    /// carrying the captured length.
    fn record_for(&self, frame: Frame) -> Option<PacketRecord> {
        match frame {
            Frame::Parsed(frame) => Some(self.normalizer.convert_frame(frame)),
            Frame::Unparsable { length, reason } => {
                log::debug!("{}: undecodable frame: {}", self.name(), reason);
                Some(PacketNormalizer::placeholder(length, &reason))
            }
            Frame::Idle => None,
        }
    }

    /// Emits a record if it passes the filter. Returns `None` when the
    /// orchestrator stopped listening.
    fn deliver(&self, ctx: &AttemptContext, filter: &CaptureFilter, record: PacketRecord) -> Option<bool> {
        if !filter.matches(&record) {
            return Some(false);
        }
        if ctx.emit(record) {
            Some(true)
        } else {
            None
        }
    }

    fn run_stream(&self, ctx: &AttemptContext, filter: &CaptureFilter, rx: &mut dyn DataLinkReceiver) -> Result<usize> {
        let mut emitted = 0;
        while ctx.should_continue(emitted) {
            let Some(record) = self.record_for(self.read_frame(rx)?) else {
                continue;
            };
            match self.deliver(ctx, filter, record) {
                Some(true) => emitted += 1,
                Some(false) => {}
                None => break,
            }
        }
        Ok(emitted)
    }

    fn run_batches(&self, ctx: &AttemptContext, filter: &CaptureFilter, rx: &mut dyn DataLinkReceiver) -> Result<usize> {
        let batch_size = ctx.settings.batch_size.max(1);
        let mut tracker = BatchTracker::new();
        let mut emitted = 0;

        while ctx.should_continue(emitted) {
            let batch_deadline = (Instant::now() + ctx.settings.batch_timeout()).min(ctx.deadline);
            let (mut parsed, mut failed, mut seen) = (0, 0, 0);

            while seen < batch_size && Instant::now() < batch_deadline && ctx.should_continue(emitted) {
                let frame = self.read_frame(rx)?;
                match frame {
                    Frame::Parsed(_) => parsed += 1,
                    Frame::Unparsable { .. } => failed += 1,
                    Frame::Idle => continue,
                }
                seen += 1;
                if let Some(record) = self.record_for(frame) {
                    match self.deliver(ctx, filter, record) {
                        Some(true) => emitted += 1,
                        Some(false) => {}
                        None => return Ok(emitted),
                    }
                }
            }

            log::debug!("{}: batch of {} frames ({} unparsable)", self.name(), seen, failed);
            tracker.record(self.name(), parsed, failed)?;
        }
        Ok(emitted)
    }
}

impl CaptureStrategy for DatalinkStrategy {
    fn name(&self) -> &str {
        match self.mode {
            DatalinkMode::Stream => "datalink-stream",
            DatalinkMode::Batch => "datalink-batch",
        }
    }

    fn attempt(&self, ctx: &AttemptContext) -> Result<usize> {
        let filter = match ctx.filter.as_deref() {
            None => CaptureFilter::default(),
            Some(expression) => match CaptureFilter::parse(expression) {
                FilterParse::Supported(filter) => filter,
                FilterParse::Unsupported(reason) => {
                    return Err(SnifferError::probe(self.name(), format!("filter not supported: {}", reason)));
                }
            },
        };

        let mut rx = self.open(ctx)?;
        match self.mode {
            DatalinkMode::Stream => self.run_stream(ctx, &filter, rx.as_mut()),
            DatalinkMode::Batch => self.run_batches(ctx, &filter, rx.as_mut()),
        }
    }
}
