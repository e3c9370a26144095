use chrono::Utc;
use serde_json::Value;
use crate::utils::parse_epoch;
use crate::{Result, SnifferError};
use super::packet::{endpoint, CapturedFrame, PacketRecord, Protocol, RawRecord};

/// Fields requested from the capture utility in delimited-text mode, in
/// column order.
pub const ROW_FIELDS: &[&str] = &[
    "frame.time_epoch",
    "frame.len",
    "frame.protocols",
    "ip.src",
    "ip.dst",
    "ipv6.src",
    "ipv6.dst",
    "tcp.srcport",
    "tcp.dstport",
    "udp.srcport",
    "udp.dstport",
];

pub const ROW_DELIMITER: char = '|';

const INFO_LIMIT: usize = 200;

const APP_LAYERS: &[&str] = &["http", "http2", "tls", "ssl", "dns", "mdns"];

/// Converts raw strategy output into canonical [`PacketRecord`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketNormalizer;

impl PacketNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Never fails: unparsable input becomes an `UNKNOWN` placeholder so the
    /// record count matches what the capture tool reported.
    pub fn normalize(&self, raw: RawRecord) -> PacketRecord {
        let kind = raw.kind();
        let hint = raw_hint(&raw);
        self.try_normalize(raw).unwrap_or_else(|e| {
            log::debug!("Unparsable {} record: {}", kind, e);
            Self::placeholder(0, &hint)
        })
    }

    pub fn try_normalize(&self, raw: RawRecord) -> Result<PacketRecord> {
        match raw {
            RawRecord::Frame(frame) => Ok(self.convert_frame(frame)),
            RawRecord::Layers(value) => self.convert_layers(&value),
            RawRecord::Row { line, delimiter } => self.convert_row(&line, delimiter),
        }
    }

    pub fn placeholder(length: usize, detail: &str) -> PacketRecord {
        let mut info = String::from("unparsed packet");
        if !detail.is_empty() {
            info.push_str(": ");
            info.push_str(detail);
        }
        PacketRecord {
            timestamp: Utc::now(),
            protocol: Protocol::Unknown,
            src_ip: None,
            dst_ip: None,
            src_port: None,
            dst_port: None,
            length,
            info: truncate(info),
        }
    }

    pub fn convert_frame(&self, frame: CapturedFrame) -> PacketRecord {
        let stack: Vec<&str> = frame.layers.iter().map(String::as_str).collect();
        let protocol = classify(frame.app_tag.as_deref(), frame.src_port, frame.dst_port, &stack);
        let src_ip = frame.src_ip.map(|ip| ip.to_string());
        let dst_ip = frame.dst_ip.map(|ip| ip.to_string());
        let info = summarize(protocol, &src_ip, frame.src_port, &dst_ip, frame.dst_port, frame.length);

        PacketRecord {
            timestamp: frame.timestamp,
            protocol,
            src_ip,
            dst_ip,
            src_port: frame.src_port,
            dst_port: frame.dst_port,
            length: frame.length,
            info,
        }
    }

    /// Reads one element of `tshark -T json` output.
    pub fn convert_layers(&self, packet: &Value) -> Result<PacketRecord> {
        let layers = packet
            .pointer("/_source/layers")
            .and_then(Value::as_object)
            .ok_or_else(|| SnifferError::Parse("missing _source.layers".to_string()))?;

        let frame = layers.get("frame");
        let timestamp = frame
            .and_then(|f| text_field(f, "frame.time_epoch"))
            .and_then(|t| parse_epoch(&t))
            .unwrap_or_else(Utc::now);
        let length = frame
            .and_then(|f| text_field(f, "frame.len"))
            .and_then(|l| l.parse().ok())
            .unwrap_or(0);
        let stack_text = frame
            .and_then(|f| text_field(f, "frame.protocols"))
            .unwrap_or_default();
        let stack: Vec<&str> = stack_text.split(':').filter(|s| !s.is_empty()).collect();

        let (src_ip, dst_ip) = if let Some(ip) = layers.get("ip") {
            (text_field(ip, "ip.src"), text_field(ip, "ip.dst"))
        } else if let Some(ipv6) = layers.get("ipv6") {
            (text_field(ipv6, "ipv6.src"), text_field(ipv6, "ipv6.dst"))
        } else if let Some(arp) = layers.get("arp") {
            (text_field(arp, "arp.src.proto_ipv4"), text_field(arp, "arp.dst.proto_ipv4"))
        } else {
            (None, None)
        };

        let (src_port, dst_port) = ["tcp", "udp"]
            .iter()
            .find_map(|proto| {
                layers.get(*proto).map(|layer| {
                    (
                        port_field(layer, &format!("{}.srcport", proto)),
                        port_field(layer, &format!("{}.dstport", proto)),
                    )
                })
            })
            .unwrap_or((None, None));

        let app_tag = APP_LAYERS
            .iter()
            .find(|name| layers.contains_key(**name) || stack.contains(*name))
            .copied();

        let protocol = classify(app_tag, src_port, dst_port, &stack);
        let info = summarize(protocol, &src_ip, src_port, &dst_ip, dst_port, length);

        Ok(PacketRecord {
            timestamp,
            protocol,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            length,
            info,
        })
    }

    /// Reads one `tshark -T fields` row laid out as [`ROW_FIELDS`].
    pub fn convert_row(&self, line: &str, delimiter: char) -> Result<PacketRecord> {
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        if line.trim().is_empty() {
            return Err(SnifferError::Parse("empty row".to_string()));
        }
        let mut fields: Vec<&str> = line.split(delimiter).map(str::trim).collect();
        if fields.len() < 2 {
            return Err(SnifferError::Parse(format!("row has no '{}' delimiters", delimiter)));
        }
        fields.resize(ROW_FIELDS.len().max(fields.len()), "");

        let timestamp = parse_epoch(fields[0])
            .ok_or_else(|| SnifferError::Parse(format!("bad timestamp '{}'", fields[0])))?;
        let length = fields[1].parse().unwrap_or(0);
        let stack: Vec<&str> = fields[2].split(':').filter(|s| !s.is_empty()).collect();

        let src_ip = non_empty(fields[3]).or_else(|| non_empty(fields[5]));
        let dst_ip = non_empty(fields[4]).or_else(|| non_empty(fields[6]));
        let src_port = first_port(fields[7]).or_else(|| first_port(fields[9]));
        let dst_port = first_port(fields[8]).or_else(|| first_port(fields[10]));

        let app_tag = APP_LAYERS.iter().find(|name| stack.contains(*name)).copied();
        let protocol = classify(app_tag, src_port, dst_port, &stack);
        let info = summarize(protocol, &src_ip, src_port, &dst_ip, dst_port, length);

        Ok(PacketRecord {
            timestamp,
            protocol,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            length,
            info,
        })
    }

    /// Parses the utility's JSON array, skipping any status banner printed
    /// ahead of it.
    pub fn parse_json_array(&self, output: &str) -> Result<Vec<Value>> {
        let trimmed = output.trim();
        let start = trimmed
            .find("[\n")
            .or_else(|| trimmed.find('['))
            .ok_or_else(|| SnifferError::Parse("no JSON array in capture output".to_string()))?;
        let body = &trimmed[start..];
        match serde_json::from_str::<Value>(body)? {
            Value::Array(items) => Ok(items),
            _ => Err(SnifferError::Parse("capture output is not a JSON array".to_string())),
        }
    }
}

/// Classification precedence: explicit application tag, then well-known
/// port (destination before source), then transport name, then UNKNOWN.
pub fn classify(app_tag: Option<&str>, src_port: Option<u16>, dst_port: Option<u16>, stack: &[&str]) -> Protocol {
    if let Some(protocol) = app_tag.and_then(Protocol::from_app_tag) {
        return protocol;
    }
    if let Some(protocol) = [dst_port, src_port].iter().flatten().find_map(|p| port_protocol(*p)) {
        return protocol;
    }
    stack
        .iter()
        .rev()
        .find_map(|name| Protocol::from_transport_name(name))
        .unwrap_or(Protocol::Unknown)
}

pub fn port_protocol(port: u16) -> Option<Protocol> {
    match port {
        80 | 8080 => Some(Protocol::Http),
        443 => Some(Protocol::Https),
        53 => Some(Protocol::Dns),
        _ => None,
    }
}

fn summarize(
    protocol: Protocol,
    src_ip: &Option<String>,
    src_port: Option<u16>,
    dst_ip: &Option<String>,
    dst_port: Option<u16>,
    length: usize,
) -> String {
    let src = endpoint(src_ip.as_deref(), src_port).unwrap_or_else(|| "?".to_string());
    let dst = endpoint(dst_ip.as_deref(), dst_port).unwrap_or_else(|| "?".to_string());
    truncate(format!("{} {} -> {} {} bytes", protocol, src, dst, length))
}

fn truncate(mut info: String) -> String {
    if info.len() > INFO_LIMIT {
        let mut cut = INFO_LIMIT;
        while !info.is_char_boundary(cut) {
            cut -= 1;
        }
        info.truncate(cut);
    }
    info
}

fn raw_hint(raw: &RawRecord) -> String {
    match raw {
        RawRecord::Frame(frame) => format!("frame of {} bytes", frame.length),
        RawRecord::Layers(_) => "malformed JSON packet".to_string(),
        RawRecord::Row { line, .. } => line.chars().take(60).collect(),
    }
}

/// tshark emits single values as strings and repeated fields as arrays.
fn text_field(layer: &Value, key: &str) -> Option<String> {
    match layer.get(key)? {
        Value::String(s) => non_empty(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => items.first().and_then(|v| v.as_str()).and_then(non_empty),
        _ => None,
    }
}

fn port_field(layer: &Value, key: &str) -> Option<u16> {
    text_field(layer, key).and_then(|p| p.parse().ok()).filter(|p| *p != 0)
}

fn first_port(field: &str) -> Option<u16> {
    field.split(',').next().and_then(|p| p.trim().parse().ok()).filter(|p| *p != 0)
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_explicit_tag_beats_port() {
        assert_eq!(classify(Some("dns"), Some(80), Some(53), &["eth", "ip", "udp", "dns"]), Protocol::Dns);
        assert_eq!(classify(Some("DNS"), Some(80), Some(53), &[]), Protocol::Dns);
    }

    #[test]
    fn test_port_beats_transport_name() {
        assert_eq!(classify(None, Some(80), Some(51000), &["eth", "ip", "tcp"]), Protocol::Http);
        assert_eq!(classify(None, Some(51000), Some(443), &["eth", "ip", "tcp"]), Protocol::Https);
        assert_eq!(classify(None, Some(5353), Some(53), &["udp"]), Protocol::Dns);
    }

    #[test]
    fn test_transport_then_unknown() {
        assert_eq!(classify(None, Some(40000), Some(40001), &["eth", "ip", "udp", "data"]), Protocol::Udp);
        assert_eq!(classify(None, None, None, &["eth", "arp"]), Protocol::Arp);
        assert_eq!(classify(None, None, None, &["eth", "llc"]), Protocol::Unknown);
    }

    #[test]
    fn test_convert_frame() {
        let mut frame = CapturedFrame::new(Utc::now(), 74);
        frame.layers = vec!["eth".into(), "ipv4".into(), "tcp".into()];
        frame.src_ip = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        frame.dst_ip = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        frame.src_port = Some(22);
        frame.dst_port = Some(50123);

        let record = PacketNormalizer::new().convert_frame(frame);
        assert_eq!(record.protocol, Protocol::Tcp);
        assert_eq!(record.src_ip.as_deref(), Some("10.0.0.2"));
        assert_eq!(record.length, 74);
        assert_eq!(record.info, "TCP 10.0.0.2:22 -> 10.0.0.1:50123 74 bytes");
    }

    #[test]
    fn test_convert_layers_with_dns() {
        let packet = json!({
            "_source": {"layers": {
                "frame": {
                    "frame.time_epoch": "1700000000.500000000",
                    "frame.len": "82",
                    "frame.protocols": "eth:ethertype:ip:udp:dns"
                },
                "ip": {"ip.src": "192.168.0.10", "ip.dst": "8.8.8.8"},
                "udp": {"udp.srcport": "53000", "udp.dstport": "53"},
                "dns": {}
            }}
        });
        let record = PacketNormalizer::new().convert_layers(&packet).unwrap();
        assert_eq!(record.protocol, Protocol::Dns);
        assert_eq!(record.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(record.length, 82);
        assert_eq!(record.dst_port, Some(53));
    }

    #[test]
    fn test_convert_layers_missing_keys_yield_none() {
        let packet = json!({"_source": {"layers": {"frame": {"frame.len": "60"}}}});
        let record = PacketNormalizer::new().convert_layers(&packet).unwrap();
        assert_eq!(record.protocol, Protocol::Unknown);
        assert_eq!(record.length, 60);
        assert!(record.src_ip.is_none());
        assert!(record.src_port.is_none());
    }

    #[test]
    fn test_convert_row_pads_short_rows() {
        let normalizer = PacketNormalizer::new();
        let record = normalizer
            .convert_row("1700000000.1|60|eth:ethertype:ip:icmp|10.0.0.1|10.0.0.2", ROW_DELIMITER)
            .unwrap();
        assert_eq!(record.protocol, Protocol::Icmp);
        assert_eq!(record.src_port, None);
        assert_eq!(record.info, "ICMP 10.0.0.1 -> 10.0.0.2 60 bytes");

        let record = normalizer
            .convert_row("1700000000.1|1514|eth:ethertype:ipv6:tcp:tls|||fe80::1|fe80::2|443|50000||", ROW_DELIMITER)
            .unwrap();
        assert_eq!(record.protocol, Protocol::Https);
        assert_eq!(record.src_ip.as_deref(), Some("fe80::1"));
        assert_eq!(record.info, "HTTPS [fe80::1]:443 -> [fe80::2]:50000 1514 bytes");
    }

    #[test]
    fn test_unparsable_input_becomes_placeholder() {
        let normalizer = PacketNormalizer::new();
        let record = normalizer.normalize(RawRecord::Row {
            line: "Capturing on 'eth0'".to_string(),
            delimiter: ROW_DELIMITER,
        });
        assert_eq!(record.protocol, Protocol::Unknown);
        assert!(record.src_ip.is_none());
        assert!(record.info.starts_with("unparsed packet"));

        let record = normalizer.normalize(RawRecord::Layers(json!({"unexpected": true})));
        assert_eq!(record.protocol, Protocol::Unknown);
    }

    #[test]
    fn test_parse_json_array_skips_banner() {
        let output = "Capturing on 'eth0'\n[\n  {\"_source\": {\"layers\": {}}}\n]\n";
        let items = PacketNormalizer::new().parse_json_array(output).unwrap();
        assert_eq!(items.len(), 1);
        assert!(PacketNormalizer::new().parse_json_array("no packets").is_err());
    }
}
