use serde::{Deserialize, Serialize};
use super::packet::{PacketRecord, Protocol};

/// Direction qualifier of a `port`/`host` primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Src,
    Dst,
    Either,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterTerm {
    Transport(Protocol),
    Port(Direction, u16),
    Host(Direction, String),
}

/// Conjunction of BPF-style primitives that can be evaluated against
/// normalized records. Used by strategies whose capture mechanism cannot
/// take a BPF program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFilter {
    pub expression: String,
    pub terms: Vec<FilterTerm>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterParse {
    Supported(CaptureFilter),
    Unsupported(String),
}

impl CaptureFilter {
    pub fn parse(expression: &str) -> FilterParse {
        let mut terms = Vec::new();
        let tokens: Vec<String> = expression.split_whitespace().map(|t| t.to_ascii_lowercase()).collect();
        let mut i = 0;

        while i < tokens.len() {
            let mut direction = Direction::Either;
            match tokens[i].as_str() {
                "and" | "&&" => {
                    i += 1;
                    continue;
                }
                "src" | "dst" => {
                    direction = if tokens[i] == "src" { Direction::Src } else { Direction::Dst };
                    i += 1;
                }
                _ => {}
            }

            let Some(keyword) = tokens.get(i) else {
                return FilterParse::Unsupported(format!("dangling qualifier in '{}'", expression));
            };
            match keyword.as_str() {
                "tcp" | "udp" | "icmp" | "arp" if direction == Direction::Either => {
                    if let Some(protocol) = Protocol::from_transport_name(keyword) {
                        terms.push(FilterTerm::Transport(protocol));
                    }
                    i += 1;
                }
                "port" => {
                    let Some(port) = tokens.get(i + 1).and_then(|p| p.parse::<u16>().ok()) else {
                        return FilterParse::Unsupported(format!("bad port in '{}'", expression));
                    };
                    terms.push(FilterTerm::Port(direction, port));
                    i += 2;
                }
                "host" => {
                    let Some(host) = tokens.get(i + 1) else {
                        return FilterParse::Unsupported(format!("missing host in '{}'", expression));
                    };
                    terms.push(FilterTerm::Host(direction, host.clone()));
                    i += 2;
                }
                other => {
                    return FilterParse::Unsupported(format!("'{}' is not supported", other));
                }
            }
        }

        FilterParse::Supported(CaptureFilter {
            expression: expression.to_string(),
            terms,
        })
    }

    pub fn matches(&self, record: &PacketRecord) -> bool {
        self.terms.iter().all(|term| term_matches(term, record))
    }
}

fn term_matches(term: &FilterTerm, record: &PacketRecord) -> bool {
    match term {
        FilterTerm::Transport(protocol) => transport_of(record) == Some(*protocol),
        FilterTerm::Port(direction, port) => match direction {
            Direction::Src => record.src_port == Some(*port),
            Direction::Dst => record.dst_port == Some(*port),
            Direction::Either => record.has_port(&[*port]),
        },
        FilterTerm::Host(direction, host) => {
            let src = record.src_ip.as_deref() == Some(host.as_str());
            let dst = record.dst_ip.as_deref() == Some(host.as_str());
            match direction {
                Direction::Src => src,
                Direction::Dst => dst,
                Direction::Either => src || dst,
            }
        }
    }
}

/// Transport carrying a record. Application-level protocols map to the
/// transport they normally use.
fn transport_of(record: &PacketRecord) -> Option<Protocol> {
    match record.protocol {
        Protocol::Tcp | Protocol::Udp | Protocol::Icmp | Protocol::Arp => Some(record.protocol),
        Protocol::Http | Protocol::Https => Some(Protocol::Tcp),
        Protocol::Dns => Some(Protocol::Udp),
        Protocol::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(protocol: Protocol, src: &str, dst: &str, sport: Option<u16>, dport: Option<u16>) -> PacketRecord {
        PacketRecord {
            timestamp: Utc::now(),
            protocol,
            src_ip: Some(src.to_string()),
            dst_ip: Some(dst.to_string()),
            src_port: sport,
            dst_port: dport,
            length: 60,
            info: String::new(),
        }
    }

    fn supported(expression: &str) -> CaptureFilter {
        match CaptureFilter::parse(expression) {
            FilterParse::Supported(filter) => filter,
            FilterParse::Unsupported(reason) => panic!("{} unsupported: {}", expression, reason),
        }
    }

    #[test]
    fn test_port_and_transport_filter() {
        let filter = supported("tcp and port 80");
        assert!(filter.matches(&record(Protocol::Http, "10.0.0.1", "10.0.0.2", Some(51000), Some(80))));
        assert!(!filter.matches(&record(Protocol::Udp, "10.0.0.1", "10.0.0.2", Some(51000), Some(80))));
        assert!(!filter.matches(&record(Protocol::Tcp, "10.0.0.1", "10.0.0.2", Some(51000), Some(22))));
    }

    #[test]
    fn test_directional_host_filter() {
        let filter = supported("src host 10.0.0.1 && dst port 53");
        assert!(filter.matches(&record(Protocol::Dns, "10.0.0.1", "8.8.8.8", Some(40000), Some(53))));
        assert!(!filter.matches(&record(Protocol::Dns, "8.8.8.8", "10.0.0.1", Some(53), Some(40000))));
    }

    #[test]
    fn test_unsupported_expressions() {
        assert!(matches!(CaptureFilter::parse("tcp or udp"), FilterParse::Unsupported(_)));
        assert!(matches!(CaptureFilter::parse("not port 22"), FilterParse::Unsupported(_)));
        assert!(matches!(CaptureFilter::parse("port http"), FilterParse::Unsupported(_)));
        assert!(matches!(CaptureFilter::parse("src"), FilterParse::Unsupported(_)));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = supported("");
        assert!(filter.matches(&record(Protocol::Unknown, "a", "b", None, None)));
    }
}
