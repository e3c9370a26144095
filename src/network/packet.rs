use pnet_packet::arp::ArpPacket;
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket;
use pnet_packet::Packet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use crate::{Result, SnifferError};

/// Canonical protocol label. Downstream grouping keys on the uppercase form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Http,
    Https,
    Dns,
    Tcp,
    Udp,
    Icmp,
    Arp,
    Unknown,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
            Protocol::Dns => "DNS",
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
            Protocol::Arp => "ARP",
            Protocol::Unknown => "UNKNOWN",
        }
    }

    /// Application-layer tags recognised as explicit classification.
    pub fn from_app_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "http" | "http2" => Some(Protocol::Http),
            "https" | "tls" | "ssl" => Some(Protocol::Https),
            "dns" | "mdns" => Some(Protocol::Dns),
            _ => None,
        }
    }

    /// Transport or network layer names found in a protocol stack.
    pub fn from_transport_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            "icmp" | "icmpv6" => Some(Protocol::Icmp),
            "arp" => Some(Protocol::Arp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = SnifferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HTTP" => Ok(Protocol::Http),
            "HTTPS" => Ok(Protocol::Https),
            "DNS" => Ok(Protocol::Dns),
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "ICMP" => Ok(Protocol::Icmp),
            "ARP" => Ok(Protocol::Arp),
            "UNKNOWN" => Ok(Protocol::Unknown),
            other => Err(SnifferError::Parse(format!("Unknown protocol: {}", other))),
        }
    }
}

/// One normalized packet. Field names are fixed for export compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketRecord {
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub length: usize,
    pub info: String,
}

impl PacketRecord {
    pub fn has_port(&self, ports: &[u16]) -> bool {
        [self.src_port, self.dst_port]
            .iter()
            .flatten()
            .any(|port| ports.contains(port))
    }

    pub fn source_endpoint(&self) -> Option<String> {
        endpoint(self.src_ip.as_deref(), self.src_port)
    }

    pub fn destination_endpoint(&self) -> Option<String> {
        endpoint(self.dst_ip.as_deref(), self.dst_port)
    }
}

/// `address:port` when a transport port is present, the bare address
/// otherwise. IPv6 addresses are bracketed: `[fe80::1]:443`.
pub fn endpoint(address: Option<&str>, port: Option<u16>) -> Option<String> {
    match (address, port) {
        (Some(addr), Some(port)) if addr.contains(':') => Some(format!("[{}]:{}", addr, port)),
        (Some(addr), Some(port)) => Some(format!("{}:{}", addr, port)),
        (Some(addr), None) => Some(addr.to_string()),
        (None, _) => None,
    }
}

/// Header-level view of a frame read from the native capture library.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub timestamp: DateTime<Utc>,
    pub length: usize,
    /// Protocol stack, outermost first, e.g. `["eth", "ipv4", "tcp"]`.
    pub layers: Vec<String>,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub app_tag: Option<String>,
}

const HTTP_PREFIXES: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ", b"HTTP/1.",
];

impl CapturedFrame {
    pub fn new(timestamp: DateTime<Utc>, length: usize) -> Self {
        Self {
            timestamp,
            length,
            layers: vec!["eth".to_string()],
            src_ip: None,
            dst_ip: None,
            src_port: None,
            dst_port: None,
            app_tag: None,
        }
    }

    /// Decodes an Ethernet frame down to the transport header.
    pub fn decode(packet: &[u8], timestamp: DateTime<Utc>) -> Result<Self> {
        let ethernet_packet = EthernetPacket::new(packet)
            .ok_or_else(|| SnifferError::Parse(format!("Truncated ethernet frame ({} bytes)", packet.len())))?;
        let mut frame = CapturedFrame::new(timestamp, packet.len());

        match ethernet_packet.get_ethertype() {
            EtherTypes::Ipv4 => {
                let ipv4_packet = Ipv4Packet::new(ethernet_packet.payload())
                    .ok_or_else(|| SnifferError::Parse("Truncated IPv4 header".to_string()))?;
                frame.layers.push("ipv4".to_string());
                frame.src_ip = Some(IpAddr::V4(ipv4_packet.get_source()));
                frame.dst_ip = Some(IpAddr::V4(ipv4_packet.get_destination()));
                frame.decode_transport(ipv4_packet.get_next_level_protocol(), ipv4_packet.payload());
            }
            EtherTypes::Ipv6 => {
                let ipv6_packet = Ipv6Packet::new(ethernet_packet.payload())
                    .ok_or_else(|| SnifferError::Parse("Truncated IPv6 header".to_string()))?;
                frame.layers.push("ipv6".to_string());
                frame.src_ip = Some(IpAddr::V6(ipv6_packet.get_source()));
                frame.dst_ip = Some(IpAddr::V6(ipv6_packet.get_destination()));
                frame.decode_transport(ipv6_packet.get_next_header(), ipv6_packet.payload());
            }
            EtherTypes::Arp => {
                let arp_packet = ArpPacket::new(ethernet_packet.payload())
                    .ok_or_else(|| SnifferError::Parse("Truncated ARP packet".to_string()))?;
                frame.layers.push("arp".to_string());
                frame.src_ip = Some(IpAddr::V4(arp_packet.get_sender_proto_addr()));
                frame.dst_ip = Some(IpAddr::V4(arp_packet.get_target_proto_addr()));
            }
            other => {
                frame.layers.push(format!("ethertype-{:04x}", other.0));
            }
        }

        Ok(frame)
    }

    fn decode_transport(&mut self, protocol: IpNextHeaderProtocol, payload: &[u8]) {
        match protocol {
            IpNextHeaderProtocols::Tcp => {
                self.layers.push("tcp".to_string());
                if let Some(tcp_packet) = TcpPacket::new(payload) {
                    self.src_port = Some(tcp_packet.get_source());
                    self.dst_port = Some(tcp_packet.get_destination());
                    let body = tcp_packet.payload();
                    if HTTP_PREFIXES.iter().any(|prefix| body.starts_with(prefix)) {
                        self.app_tag = Some("http".to_string());
                    }
                }
            }
            IpNextHeaderProtocols::Udp => {
                self.layers.push("udp".to_string());
                if let Some(udp_packet) = UdpPacket::new(payload) {
                    self.src_port = Some(udp_packet.get_source());
                    self.dst_port = Some(udp_packet.get_destination());
                }
            }
            IpNextHeaderProtocols::Icmp => self.layers.push("icmp".to_string()),
            IpNextHeaderProtocols::Icmpv6 => self.layers.push("icmpv6".to_string()),
            other => self.layers.push(format!("ip-proto-{}", other.0)),
        }
    }
}

/// Raw output of one capture strategy, before normalization.
#[derive(Debug, Clone)]
pub enum RawRecord {
    /// Structured object from the native capture library.
    Frame(CapturedFrame),
    /// One element of the capture utility's JSON array output.
    Layers(serde_json::Value),
    /// One field-delimited text row from the capture utility.
    Row { line: String, delimiter: char },
}

impl RawRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            RawRecord::Frame(_) => "frame",
            RawRecord::Layers(_) => "layers",
            RawRecord::Row { .. } => "row",
        }
    }
}
