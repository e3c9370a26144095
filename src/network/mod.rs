pub mod analysis;
pub mod export;
pub mod filter;
pub mod interfaces;
pub mod normalizer;
pub mod orchestrator;
pub mod packet;
pub mod session;
pub mod strategies;
pub mod strategy;

pub use analysis::{AnalyticsEngine, FlowStats, TalkerStats};
pub use export::ExportFormat;
pub use filter::CaptureFilter;
pub use interfaces::{InterfaceRegistry, NetworkInterface};
pub use normalizer::PacketNormalizer;
pub use orchestrator::CaptureOrchestrator;
pub use packet::{PacketRecord, Protocol, RawRecord};
pub use session::{CaptureSession, CaptureStatistics, SessionReport, SessionState, SessionStatus};
pub use strategy::{AttemptContext, CaptureStrategy, InterfaceTarget};
