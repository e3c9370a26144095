use chrono::{Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::{IpAddr, Ipv4Addr};
use crate::config::StrategyConfig;
use crate::network::normalizer::PacketNormalizer;
use crate::network::packet::CapturedFrame;
use crate::network::strategy::{AttemptContext, CaptureStrategy};
use crate::Result;

const REMOTE_HOSTS: &[[u8; 4]] = &[
    [93, 184, 216, 34],
    [142, 250, 72, 14],
    [151, 101, 1, 69],
    [104, 16, 132, 229],
    [8, 8, 8, 8],
    [1, 1, 1, 1],
];

#[derive(Debug, Clone, Copy)]
enum Template {
    Dns,
    Https,
    Http,
    Icmp,
    Arp,
}

const TEMPLATES: &[Template] = &[
    Template::Https,
    Template::Https,
    Template::Https,
    Template::Dns,
    Template::Dns,
    Template::Http,
    Template::Icmp,
    Template::Arp,
];

/// Deterministic packet generator used when no live strategy produced a
/// record. Sessions fed by it are flagged as demo mode.
pub struct SyntheticStrategy {
    packets: usize,
    seed: u64,
    normalizer: PacketNormalizer,
}

impl SyntheticStrategy {
    pub fn new(settings: &StrategyConfig) -> Self {
        Self {
            packets: settings.synthetic_packets,
            seed: settings.synthetic_seed,
            normalizer: PacketNormalizer::new(),
        }
    }

    /// Builds `count` frames. Same seed, same frames.
    pub fn generate(&self, count: usize) -> Vec<CapturedFrame> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let local = Ipv4Addr::new(192, 168, 1, rng.gen_range(2..=254));
        let start = Utc::now();

        (0..count)
            .map(|i| {
                let timestamp = start + ChronoDuration::milliseconds(50 * i as i64);
                let template = TEMPLATES[rng.gen_range(0..TEMPLATES.len())];
                let remote = Ipv4Addr::from(REMOTE_HOSTS[rng.gen_range(0..REMOTE_HOSTS.len())]);
                build_frame(&mut rng, template, local, remote, timestamp)
            })
            .collect()
    }
}

fn build_frame(
    rng: &mut StdRng,
    template: Template,
    local: Ipv4Addr,
    remote: Ipv4Addr,
    timestamp: chrono::DateTime<Utc>,
) -> CapturedFrame {
    let outbound = rng.gen_bool(0.6);
    let ephemeral = rng.gen_range(49152..=65535);

    let (length, transport, service, app_tag) = match template {
        Template::Dns => (rng.gen_range(70..=180), "udp", Some(53), Some("dns")),
        Template::Https => (rng.gen_range(66..=1514), "tcp", Some(443), Some("tls")),
        Template::Http => (rng.gen_range(200..=1200), "tcp", Some(80), Some("http")),
        Template::Icmp => (98, "icmp", None, None),
        Template::Arp => (42, "arp", None, None),
    };

    let mut frame = CapturedFrame::new(timestamp, length);
    if matches!(template, Template::Arp) {
        let gateway = Ipv4Addr::new(192, 168, 1, 1);
        frame.layers.push("arp".to_string());
        frame.src_ip = Some(IpAddr::V4(local));
        frame.dst_ip = Some(IpAddr::V4(gateway));
        return frame;
    }

    frame.layers.push("ipv4".to_string());
    frame.layers.push(transport.to_string());
    let (src, dst) = if outbound { (local, remote) } else { (remote, local) };
    frame.src_ip = Some(IpAddr::V4(src));
    frame.dst_ip = Some(IpAddr::V4(dst));

    if let Some(service) = service {
        let (src_port, dst_port) = if outbound { (ephemeral, service) } else { (service, ephemeral) };
        frame.src_port = Some(src_port);
        frame.dst_port = Some(dst_port);
    }
    frame.app_tag = app_tag.map(str::to_string);
    frame
}

impl CaptureStrategy for SyntheticStrategy {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn is_fallback(&self) -> bool {
        true
    }

    fn attempt(&self, ctx: &AttemptContext) -> Result<usize> {
        let count = if ctx.packet_count > 0 { ctx.packet_count } else { self.packets };
        log::info!("Generating {} synthetic packets", count);

        let mut emitted = 0;
        for frame in self.generate(count) {
            if !ctx.should_continue(emitted) || !ctx.emit(self.normalizer.convert_frame(frame)) {
                break;
            }
            emitted += 1;
        }
        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::Protocol;

    fn strategy(seed: u64) -> SyntheticStrategy {
        let settings = StrategyConfig {
            synthetic_seed: seed,
            ..StrategyConfig::default()
        };
        SyntheticStrategy::new(&settings)
    }

    #[test]
    fn test_generation_is_deterministic() {
        let first = strategy(7).generate(30);
        let second = strategy(7).generate(30);
        assert_eq!(first.len(), 30);
        let shape = |frames: &[CapturedFrame]| {
            frames
                .iter()
                .map(|f| (f.src_ip, f.dst_ip, f.src_port, f.dst_port, f.length))
                .collect::<Vec<_>>()
        };
        assert_eq!(shape(&first), shape(&second));
    }

    #[test]
    fn test_frames_normalize_to_known_protocols() {
        let generator = strategy(11);
        let normalizer = PacketNormalizer::new();
        for frame in generator.generate(50) {
            let record = normalizer.convert_frame(frame);
            assert_ne!(record.protocol, Protocol::Unknown);
            assert!(record.src_ip.is_some());
            assert!(record.length > 0);
        }
    }

    #[test]
    fn test_is_fallback() {
        assert!(strategy(1).is_fallback());
        assert_eq!(strategy(1).name(), "synthetic");
    }
}
