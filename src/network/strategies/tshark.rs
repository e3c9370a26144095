use std::io::{BufRead, BufReader, Read};
use std::process::{Command, ExitStatus};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;
use crate::config::StrategyConfig;
use crate::network::interfaces::NetworkInterface;
use crate::network::normalizer::{PacketNormalizer, ROW_DELIMITER, ROW_FIELDS};
use crate::network::packet::{PacketRecord, RawRecord};
use crate::network::strategy::{AttemptContext, BatchTracker, CaptureStrategy, ProcessSlot};
use crate::utils::find_tshark;
use crate::{Result, SnifferError};

const PROBE_PACKETS: usize = 3;

/// Upper bound on `tshark -D`. The listing is cached per strategy.
const DEVICE_LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Printed on stderr once the utility has opened the capture device.
const CAPTURE_BANNER: &str = "Capturing on";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsharkMode {
    /// `-T json`, whole array parsed once the utility exits.
    Json,
    /// `-T fields`, one delimited row per packet, streamed.
    Fields,
}

/// One line of `tshark -D` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub index: String,
    pub name: String,
    pub description: Option<String>,
}

/// Captures by driving the `tshark` utility as a subprocess.
pub struct TsharkStrategy {
    mode: TsharkMode,
    configured_path: Option<String>,
    binary: OnceLock<Option<String>>,
    devices: OnceLock<Vec<DeviceEntry>>,
    device_timeout: Duration,
    normalizer: PacketNormalizer,
}

impl TsharkStrategy {
    pub fn new(mode: TsharkMode, settings: &StrategyConfig) -> Self {
        Self {
            mode,
            configured_path: settings.tshark_path.clone(),
            binary: OnceLock::new(),
            devices: OnceLock::new(),
            device_timeout: DEVICE_LIST_TIMEOUT,
            normalizer: PacketNormalizer::new(),
        }
    }

    pub fn json(settings: &StrategyConfig) -> Self {
        Self::new(TsharkMode::Json, settings)
    }

    pub fn fields(settings: &StrategyConfig) -> Self {
        Self::new(TsharkMode::Fields, settings)
    }

    fn binary(&self) -> Result<&str> {
        self.binary
            .get_or_init(|| {
                let found = find_tshark(self.configured_path.as_deref());
                match &found {
                    Some(path) => log::debug!("Using tshark at {}", path),
                    None => log::debug!("tshark not found"),
                }
                found
            })
            .as_deref()
            .ok_or_else(|| SnifferError::probe(self.name(), "tshark binary not found"))
    }

    /// Device listing, fetched once. A failed or hung listing caches as
    /// empty so every later translation fails fast.
    fn devices(&self) -> &[DeviceEntry] {
        self.devices.get_or_init(|| {
            let listed = self
                .binary()
                .and_then(|binary| list_devices(binary, self.device_timeout));
            match listed {
                Ok(devices) => devices,
                Err(e) => {
                    log::debug!("{}: device listing unavailable: {}", self.name(), e);
                    Vec::new()
                }
            }
        })
    }

    fn base_command(&self, ctx: &AttemptContext) -> Result<Command> {
        let mut command = Command::new(self.binary()?);
        if let Some(id) = ctx.interface.id() {
            command.arg("-i").arg(id);
        }
        if !ctx.promiscuous {
            command.arg("-p");
        }
        Ok(command)
    }

    fn push_filter(ctx: &AttemptContext, command: &mut Command) {
        if let Some(filter) = ctx.filter.as_deref().filter(|f| !f.trim().is_empty()) {
            command.arg("-f").arg(filter);
        }
    }

    /// Runs a command to completion and returns its stdout.
    fn run_to_end<F>(&self, ctx: &AttemptContext, command: Command, on_stderr: F) -> Result<(String, ExitStatus)>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let slot = ctx.process();
        let (mut stdout, drain) = slot
            .spawn_watching(command, on_stderr)
            .map_err(|e| SnifferError::from_capture_io(self.name(), &e))?;

        let mut output = String::new();
        stdout.read_to_string(&mut output)?;
        let status = slot
            .wait()?
            .ok_or_else(|| SnifferError::probe(self.name(), "capture process vanished"))?;
        let _ = drain.join();
        Ok((output, status))
    }

    fn probe(&self, ctx: &AttemptContext) -> Result<()> {
        let packets = if ctx.packet_count > 0 {
            ctx.packet_count.min(PROBE_PACKETS)
        } else {
            PROBE_PACKETS
        };

        let mut command = self.base_command(ctx)?;
        command
            .arg("-c")
            .arg(packets.to_string())
            .arg("-a")
            .arg(format!("duration:{}", probe_duration_secs(ctx.probe_timeout)))
            .args(["-T", "json"]);
        Self::push_filter(ctx, &mut command);

        // The probe window covers tool startup only: once the device is open
        // the probe bounds itself with `-a duration`.
        let confirm = ctx.probe_confirmer();
        let mut announced = false;
        let (output, status) = self.run_to_end(ctx, command, move |line| {
            if !announced && line.contains(CAPTURE_BANNER) {
                announced = true;
                confirm();
            }
        })?;
        if ctx.is_cancelled() {
            return Err(SnifferError::probe(self.name(), "cancelled during probe"));
        }
        let packets = self.normalizer.parse_json_array(&output).unwrap_or_default();
        if packets.is_empty() {
            if !status.success() {
                return Err(exit_error(self.name(), status, &ctx.process().stderr()));
            }
            return Err(SnifferError::probe(self.name(), "probe capture saw no packets"));
        }

        log::debug!("{}: probe captured {} packets", self.name(), packets.len());
        ctx.confirm_probe();
        Ok(())
    }

    fn run_json(&self, ctx: &AttemptContext) -> Result<usize> {
        if ctx.interface.is_substituted() {
            return Err(SnifferError::probe(
                self.name(),
                "requested interface could not be mapped to a capture device",
            ));
        }
        self.probe(ctx)?;

        let mut command = self.base_command(ctx)?;
        if ctx.packet_count > 0 {
            command.arg("-c").arg(ctx.packet_count.to_string());
        }
        command
            .arg("-a")
            .arg(format!("duration:{}", duration_secs(ctx.remaining())))
            .args(["-T", "json", "-t", "a", "-l"]);
        Self::push_filter(ctx, &mut command);

        let (output, status) = self.run_to_end(ctx, command, |_| {})?;
        let packets = match self.normalizer.parse_json_array(&output) {
            Ok(packets) => packets,
            Err(_) if output.trim().is_empty() && !status.success() => {
                return Err(exit_error(self.name(), status, &ctx.process().stderr()));
            }
            Err(e) => return Err(e),
        };

        let mut emitted = 0;
        for packet in packets {
            if ctx.reached_count(emitted) {
                break;
            }
            if !ctx.emit(self.normalizer.normalize(RawRecord::Layers(packet))) {
                break;
            }
            emitted += 1;
        }
        Ok(emitted)
    }

    fn run_fields(&self, ctx: &AttemptContext) -> Result<usize> {
        let mut command = self.base_command(ctx)?;
        command.args(["-l", "-n", "-T", "fields"]);
        command
            .arg("-E")
            .arg(format!("separator={}", ROW_DELIMITER))
            .args(["-E", "occurrence=f"]);
        for field in ROW_FIELDS {
            command.arg("-e").arg(field);
        }
        if ctx.packet_count > 0 {
            command.arg("-c").arg(ctx.packet_count.to_string());
        }
        command.arg("-a").arg(format!("duration:{}", duration_secs(ctx.remaining())));
        Self::push_filter(ctx, &mut command);

        let slot = ctx.process();
        let (stdout, drain) = slot
            .spawn(command)
            .map_err(|e| SnifferError::from_capture_io(self.name(), &e))?;

        let batch_size = ctx.settings.batch_size.max(1);
        let mut tracker = BatchTracker::new();
        let (mut emitted, mut parsed, mut failed) = (0, 0, 0);
        let mut outcome = Ok(());

        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    outcome = Err(SnifferError::probe(self.name(), e.to_string()));
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let (record, ok) = self.row_record(line);
            if ok {
                parsed += 1;
            } else {
                failed += 1;
            }
            if !ctx.emit(record) {
                break;
            }
            emitted += 1;

            if parsed + failed >= batch_size {
                if let Err(e) = tracker.record(self.name(), parsed, failed) {
                    outcome = Err(e);
                    break;
                }
                parsed = 0;
                failed = 0;
            }
            if !ctx.should_continue(emitted) {
                break;
            }
        }

        slot.kill();
        let status = slot.wait()?;
        let _ = drain.join();
        outcome?;

        if emitted == 0 {
            if let Some(status) = status.filter(|s| !s.success()) {
                if !ctx.is_cancelled() {
                    return Err(exit_error(self.name(), status, &slot.stderr()));
                }
            }
        }
        Ok(emitted)
    }

    /// Converts one output row. A row that fails to parse still yields an
    /// `UNKNOWN` record; the flag says whether parsing succeeded.
    fn row_record(&self, line: String) -> (PacketRecord, bool) {
        let length = line
            .split(ROW_DELIMITER)
            .nth(1)
            .and_then(|l| l.trim().parse().ok())
            .unwrap_or(0);
        match self.normalizer.try_normalize(RawRecord::Row { line, delimiter: ROW_DELIMITER }) {
            Ok(record) => (record, true),
            Err(e) => {
                log::debug!("{}: {}", self.name(), e);
                (PacketNormalizer::placeholder(length, &e.to_string()), false)
            }
        }
    }
}

impl CaptureStrategy for TsharkStrategy {
    fn name(&self) -> &str {
        match self.mode {
            TsharkMode::Json => "tshark-json",
            TsharkMode::Fields => "tshark-fields",
        }
    }

    /// Maps the interface onto the numeric index from `tshark -D`.
    fn translate_interface(&self, interface: &NetworkInterface) -> Option<String> {
        match_device(self.devices(), &interface.name)
    }

    fn attempt(&self, ctx: &AttemptContext) -> Result<usize> {
        match self.mode {
            TsharkMode::Json => self.run_json(ctx),
            TsharkMode::Fields => self.run_fields(ctx),
        }
    }
}

/// Runs `tshark -D`, killing it if it does not answer within `timeout`.
fn list_devices(binary: &str, timeout: Duration) -> Result<Vec<DeviceEntry>> {
    let slot = ProcessSlot::default();
    let mut command = Command::new(binary);
    command.arg("-D");
    let (mut stdout, drain) = slot.spawn(command)?;

    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let mut text = String::new();
        let _ = stdout.read_to_string(&mut text);
        let _ = tx.send(text);
    });

    let text = match rx.recv_timeout(timeout) {
        Ok(text) => text,
        Err(_) => {
            slot.kill();
            let _ = slot.wait();
            return Err(SnifferError::Timeout(format!(
                "device listing did not finish within {}s",
                timeout.as_secs_f64()
            )));
        }
    };

    let status = slot.wait()?;
    let _ = drain.join();
    match status {
        Some(status) if status.success() => Ok(parse_device_list(&text)),
        _ => Err(SnifferError::Discovery(format!("device listing failed: {}", slot.stderr().trim()))),
    }
}

/// Parses `tshark -D` lines of the form `N. name (description)`.
pub fn parse_device_list(text: &str) -> Vec<DeviceEntry> {
    text.lines()
        .filter_map(|line| {
            let (index, rest) = line.trim().split_once(". ")?;
            if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let rest = rest.trim();
            let (name, description) = match rest.find(" (") {
                Some(pos) if rest.ends_with(')') => (
                    rest[..pos].to_string(),
                    Some(rest[pos + 2..rest.len() - 1].to_string()),
                ),
                _ => (rest.to_string(), None),
            };
            Some(DeviceEntry {
                index: index.to_string(),
                name,
                description,
            })
        })
        .collect()
}

/// Index of the single device whose name or description matches. Ambiguous
/// or missing matches yield `None`.
pub fn match_device(devices: &[DeviceEntry], requested: &str) -> Option<String> {
    if let Some(exact) = devices.iter().find(|d| d.name == requested) {
        return Some(exact.index.clone());
    }

    let matches: Vec<&DeviceEntry> = devices
        .iter()
        .filter(|d| {
            d.name.eq_ignore_ascii_case(requested)
                || d.description
                    .as_deref()
                    .map(|desc| desc.eq_ignore_ascii_case(requested))
                    .unwrap_or(false)
        })
        .collect();

    match matches.as_slice() {
        [only] => Some(only.index.clone()),
        _ => None,
    }
}

fn duration_secs(remaining: Duration) -> u64 {
    let secs = remaining.as_secs();
    if remaining.subsec_millis() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

/// Leaves the utility a second to start inside the probe window.
fn probe_duration_secs(probe_timeout: Duration) -> u64 {
    probe_timeout.as_secs().saturating_sub(1).max(1)
}

fn exit_error(strategy: &str, status: ExitStatus, stderr: &str) -> SnifferError {
    let lowered = stderr.to_lowercase();
    let detail = stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("exited with {}", status));

    if lowered.contains("permission") || lowered.contains("privilege") {
        SnifferError::Permission(format!("{}: {}", strategy, detail))
    } else {
        SnifferError::probe(strategy, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::Protocol;

    const DEVICES: &str = "1. \\Device\\NPF_{6B3F0A5C} (Wi-Fi)\n\
                           2. \\Device\\NPF_{9A1D2E44} (Ethernet)\n\
                           3. \\Device\\NPF_Loopback (Adapter for loopback traffic capture)\n\
                           4. eth0\n\
                           5. any\n";

    #[test]
    fn test_parse_device_list() {
        let devices = parse_device_list(DEVICES);
        assert_eq!(devices.len(), 5);
        assert_eq!(devices[0].index, "1");
        assert_eq!(devices[0].description.as_deref(), Some("Wi-Fi"));
        assert_eq!(devices[3].name, "eth0");
        assert_eq!(devices[3].description, None);
    }

    #[test]
    fn test_match_device_by_name_or_description() {
        let devices = parse_device_list(DEVICES);
        assert_eq!(match_device(&devices, "Wi-Fi"), Some("1".to_string()));
        assert_eq!(match_device(&devices, "ethernet"), Some("2".to_string()));
        assert_eq!(match_device(&devices, "eth0"), Some("4".to_string()));
        assert_eq!(match_device(&devices, "wlan7"), None);
    }

    #[test]
    fn test_ambiguous_device_is_rejected() {
        let devices = parse_device_list("1. eth0 (LAN)\n2. eth1 (lan)\n");
        assert_eq!(match_device(&devices, "LAN"), None);
    }

    #[test]
    fn test_duration_rounding() {
        assert_eq!(duration_secs(Duration::from_millis(1500)), 2);
        assert_eq!(duration_secs(Duration::from_secs(3)), 3);
        assert_eq!(duration_secs(Duration::ZERO), 1);
        assert_eq!(probe_duration_secs(Duration::from_millis(4000)), 3);
        assert_eq!(probe_duration_secs(Duration::from_millis(500)), 1);
    }

    #[test]
    fn test_permission_errors_are_distinguished() {
        let status = fake_status();
        let err = exit_error("tshark-json", status, "tshark: You don't have permission to capture on that device");
        assert!(err.is_permission());
        let err = exit_error("tshark-json", status, "tshark: The capture session could not be initiated");
        assert!(!err.is_permission());
    }

    #[test]
    fn test_unparsable_row_still_yields_record() {
        let strategy = TsharkStrategy::fields(&StrategyConfig::default());

        let (record, ok) = strategy.row_record("1700000000.5|74|eth:ethertype:ip:udp:dns|10.0.0.1|8.8.8.8|||||53124|53".to_string());
        assert!(ok);
        assert_eq!(record.protocol, Protocol::Dns);

        let (record, ok) = strategy.row_record("not-a-time|98|eth:ethertype:ip:icmp|10.0.0.1|10.0.0.9".to_string());
        assert!(!ok);
        assert_eq!(record.protocol, Protocol::Unknown);
        assert_eq!(record.length, 98);
        assert_eq!(record.src_ip, None);
        assert_eq!(record.dst_port, None);
    }

    #[cfg(unix)]
    mod with_fake_binary {
        use super::*;
        use crate::config::{CaptureConfig, Config};
        use crate::network::orchestrator::CaptureOrchestrator;
        use crate::network::session::SessionState;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;
        use std::sync::Arc;
        use std::time::Instant;

        const DEVICE_LIST: &str = "case \" $* \" in *\" -D \"*) echo \"1. eth0\"; echo \"2. any\"; exit 0 ;; esac\n";

        fn fake_tshark(dir: &Path, body: &str) -> String {
            let path = dir.join("tshark");
            std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().into_owned()
        }

        fn settings(path: String, probe_timeout_ms: u64) -> StrategyConfig {
            StrategyConfig {
                tshark_path: Some(path),
                probe_timeout_ms,
                stop_grace_ms: 100,
                ..StrategyConfig::default()
            }
        }

        fn orchestrator(strategy: TsharkStrategy, settings: StrategyConfig) -> CaptureOrchestrator {
            let config = Config {
                strategies: settings,
                ..Config::default()
            };
            CaptureOrchestrator::with_strategies(vec![Arc::new(strategy)], &config)
        }

        #[test]
        fn test_fields_mode_keeps_count_parity() {
            let dir = tempfile::tempdir().unwrap();
            let body = format!(
                "{}{}",
                DEVICE_LIST,
                "echo '1700000000.100000|74|eth:ethertype:ip:udp:dns|10.0.0.1|8.8.8.8|||||53124|53'\n\
                 echo '1700000000.200000|60|eth:ethertype:ip:tcp|10.0.0.1|10.0.0.2|||40000|22||'\n\
                 echo '1700000000.300000|54|eth:ethertype:ip:tcp|10.0.0.2|10.0.0.1|||22|40000||'\n\
                 echo 'garbage|98|eth:ethertype:ip:icmp|10.0.0.1|10.0.0.9|||||'\n"
            );
            let settings = settings(fake_tshark(dir.path(), &body), 2000);
            let orchestrator = orchestrator(TsharkStrategy::fields(&settings), settings);

            let session = orchestrator.start(CaptureConfig::default().with_timeout_secs(10)).unwrap();
            assert!(session.wait(Duration::from_secs(15)));

            let status = session.status();
            assert_eq!(status.state, SessionState::Stopped);
            assert_eq!(status.strategy.as_deref(), Some("tshark-fields"));
            assert_eq!(status.stats.total_packets, 4);
            assert_eq!(status.stats.protocols.get("UNKNOWN"), Some(&1));
            let records = session.records(None);
            assert_eq!(records.last().map(|r| r.length), Some(98));
        }

        #[test]
        fn test_slow_json_startup_is_not_abandoned() {
            let dir = tempfile::tempdir().unwrap();
            let packet = r#"{"_source":{"layers":{"frame":{"frame.time_epoch":"1700000000.1","frame.len":"74","frame.protocols":"eth:ethertype:ip:udp:dns"},"ip":{"ip.src":"10.0.0.1","ip.dst":"8.8.8.8"},"udp":{"udp.srcport":"53124","udp.dstport":"53"}}}}"#;
            let body = format!(
                "{}sleep 0.2\necho \"Capturing on 'eth0'\" >&2\nsleep 1.5\necho '[{},{}]'\n",
                DEVICE_LIST, packet, packet
            );
            let settings = settings(fake_tshark(dir.path(), &body), 1000);
            let orchestrator = orchestrator(TsharkStrategy::json(&settings), settings);

            let session = orchestrator.start(CaptureConfig::default().with_timeout_secs(10)).unwrap();
            assert!(session.wait(Duration::from_secs(15)));

            let status = session.status();
            assert_eq!(status.state, SessionState::Stopped, "{:?}", status.error);
            assert_eq!(status.strategy.as_deref(), Some("tshark-json"));
            assert_eq!(status.stats.total_packets, 2);
        }

        #[test]
        fn test_hung_device_listing_is_bounded() {
            let dir = tempfile::tempdir().unwrap();
            let path = fake_tshark(dir.path(), "exec sleep 30\n");

            let started = Instant::now();
            let listed = list_devices(&path, Duration::from_millis(300));
            assert!(matches!(listed, Err(SnifferError::Timeout(_))));
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[test]
        fn test_hung_device_listing_does_not_stall_session() {
            let dir = tempfile::tempdir().unwrap();
            let settings = settings(fake_tshark(dir.path(), "exec sleep 30\n"), 300);
            let mut strategy = TsharkStrategy::fields(&settings);
            strategy.device_timeout = Duration::from_secs(1);
            let orchestrator = orchestrator(strategy, settings);

            let started = Instant::now();
            let session = orchestrator
                .start(CaptureConfig::default().with_interface("eth0").with_timeout_secs(2))
                .unwrap();
            assert!(session.wait(Duration::from_secs(6)), "session outlived its timeout");
            assert!(started.elapsed() < Duration::from_secs(6));
            assert_eq!(session.state(), SessionState::Failed);
        }

        #[test]
        fn test_device_listing_runs_once() {
            let dir = tempfile::tempdir().unwrap();
            let calls = dir.path().join("calls");
            let body = format!("echo x >> '{}'\n{}", calls.display(), DEVICE_LIST);
            let settings = settings(fake_tshark(dir.path(), &body), 1000);
            let strategy = TsharkStrategy::json(&settings);

            let eth0 = NetworkInterface::new("eth0", true, vec![]);
            assert_eq!(strategy.translate_interface(&eth0), Some("1".to_string()));
            let wlan = NetworkInterface::new("wlan9", true, vec![]);
            assert_eq!(strategy.translate_interface(&wlan), None);

            let recorded = std::fs::read_to_string(&calls).unwrap();
            assert_eq!(recorded.lines().count(), 1);
        }
    }

    #[cfg(unix)]
    fn fake_status() -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(256)
    }

    #[cfg(windows)]
    fn fake_status() -> ExitStatus {
        use std::os::windows::process::ExitStatusExt;
        ExitStatus::from_raw(1)
    }
}
