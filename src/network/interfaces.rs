//! Host network interface discovery.
//!
//! Discovery never fails: each source is tried in turn and a wildcard
//! `any` interface is returned when none of them produce anything.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::process::Command;
use crate::{Result, SnifferError};

/// Name of the synthetic wildcard interface.
pub const ANY_INTERFACE: &str = "any";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Wifi,
    Ethernet,
    Loopback,
    Vpn,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    pub address: String,
    pub family: AddressFamily,
}

impl InterfaceAddress {
    pub fn from_ip(ip: IpAddr) -> Self {
        let family = match ip {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        };
        Self {
            address: ip.to_string(),
            family,
        }
    }

    /// Accepts `addr`, `addr/prefix` and `addr%scope` spellings.
    pub fn parse(text: &str) -> Option<Self> {
        let bare = text.split(|c: char| c == '/' || c == '%').next()?.trim();
        bare.parse::<IpAddr>().ok().map(Self::from_ip)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub kind: InterfaceKind,
    pub is_up: bool,
    pub addresses: Vec<InterfaceAddress>,
}

impl NetworkInterface {
    pub fn new(name: impl Into<String>, is_up: bool, addresses: Vec<InterfaceAddress>) -> Self {
        let name = name.into();
        Self {
            kind: classify(&name),
            name,
            is_up,
            addresses,
        }
    }

    pub fn any() -> Self {
        Self {
            name: ANY_INTERFACE.to_string(),
            kind: InterfaceKind::Other,
            is_up: true,
            addresses: Vec::new(),
        }
    }

    pub fn has_address(&self) -> bool {
        !self.addresses.is_empty()
    }
}

const LOOPBACK_TOKENS: &[&str] = &["loopback", "localhost"];
const VPN_TOKENS: &[&str] = &["vpn", "tun", "tap", "wg", "utun", "ppp", "tailscale", "wireguard", "zerotier"];
const WIFI_TOKENS: &[&str] = &["wi-fi", "wifi", "wlan", "wlp", "wireless", "airport", "802.11", "sem fio"];
const ETHERNET_TOKENS: &[&str] = &["ethernet", "eth", "enp", "eno", "ens", "enx"];

/// Substring heuristic over the interface name.
pub fn classify(name: &str) -> InterfaceKind {
    let lower = name.to_ascii_lowercase();
    let is_lo_device = lower.strip_prefix("lo").map_or(false, |rest| rest.chars().all(|c| c.is_ascii_digit()));

    if is_lo_device || LOOPBACK_TOKENS.iter().any(|t| lower.contains(t)) {
        InterfaceKind::Loopback
    } else if VPN_TOKENS.iter().any(|t| lower.contains(t)) {
        InterfaceKind::Vpn
    } else if WIFI_TOKENS.iter().any(|t| lower.contains(t)) {
        InterfaceKind::Wifi
    } else if ETHERNET_TOKENS.iter().any(|t| lower.contains(t)) {
        InterfaceKind::Ethernet
    } else {
        InterfaceKind::Other
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InterfaceRegistry;

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn discover(&self) -> Vec<NetworkInterface> {
        let sources: [(&str, fn() -> Result<Vec<NetworkInterface>>); 3] = [
            ("datalink", discover_datalink),
            ("os-command", discover_os_command),
            ("socket", discover_socket),
        ];

        for (source, discover) in sources {
            match discover() {
                Ok(interfaces) if !interfaces.is_empty() => {
                    log::debug!("Discovered {} interfaces via {}", interfaces.len(), source);
                    return interfaces;
                }
                Ok(_) => log::debug!("Interface source {} returned nothing", source),
                Err(e) => log::warn!("Interface source {} failed: {}", source, e),
            }
        }

        log::warn!("No interface source succeeded, using wildcard interface");
        vec![NetworkInterface::any()]
    }

    /// Looks up a requested name: exact, case-insensitive, then by kind
    /// (so "Wi-Fi" finds `wlan0`).
    pub fn find<'a>(interfaces: &'a [NetworkInterface], requested: &str) -> Option<&'a NetworkInterface> {
        interfaces
            .iter()
            .find(|iface| iface.name == requested)
            .or_else(|| interfaces.iter().find(|iface| iface.name.eq_ignore_ascii_case(requested)))
            .or_else(|| {
                let kind = classify(requested);
                if kind == InterfaceKind::Other {
                    return None;
                }
                interfaces
                    .iter()
                    .filter(|iface| iface.kind == kind)
                    .min_by_key(|iface| (!iface.is_up, !iface.has_address()))
            })
    }

    /// First up, non-loopback interface with an address; otherwise the
    /// first interface carrying any address.
    pub fn first_with_address(interfaces: &[NetworkInterface]) -> Option<&NetworkInterface> {
        interfaces
            .iter()
            .find(|iface| iface.is_up && iface.kind != InterfaceKind::Loopback && iface.has_address())
            .or_else(|| interfaces.iter().find(|iface| iface.has_address()))
    }
}

fn discover_datalink() -> Result<Vec<NetworkInterface>> {
    let interfaces = pnet_datalink::interfaces();
    Ok(interfaces
        .iter()
        .map(|iface| {
            let addresses = iface.ips.iter().map(|network| InterfaceAddress::from_ip(network.ip())).collect();
            let mut discovered = NetworkInterface::new(iface.name.clone(), iface.is_up(), addresses);
            if iface.is_loopback() {
                discovered.kind = InterfaceKind::Loopback;
            }
            discovered
        })
        .collect())
}

fn discover_os_command() -> Result<Vec<NetworkInterface>> {
    let (program, args): (&str, &[&str]) = if cfg!(windows) {
        ("ipconfig", &["/all"])
    } else {
        ("ifconfig", &[])
    };

    let output = Command::new(program).args(args).output()?;
    if !output.status.success() {
        return Err(SnifferError::Discovery(format!("{} exited with {}", program, output.status)));
    }
    let text = String::from_utf8_lossy(&output.stdout);

    Ok(if cfg!(windows) {
        parse_ipconfig(&text)
    } else {
        parse_ifconfig(&text)
    })
}

fn discover_socket() -> Result<Vec<NetworkInterface>> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    // No packets are sent; connect only selects the outbound route.
    socket.connect("8.8.8.8:80")?;
    let local = socket.local_addr()?.ip();
    if local.is_unspecified() {
        return Err(SnifferError::Discovery("no outbound route".to_string()));
    }

    Ok(vec![
        NetworkInterface::new("auto", true, vec![InterfaceAddress::from_ip(local)]),
        NetworkInterface::new("lo", true, vec![InterfaceAddress::from_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))]),
    ])
}

/// Parses BSD/Linux `ifconfig` output. Header lines start at column zero,
/// address lines are indented.
pub fn parse_ifconfig(text: &str) -> Vec<NetworkInterface> {
    let mut interfaces: Vec<NetworkInterface> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(' ') && !line.starts_with('\t') {
            let name = line.split(|c: char| c == ':' || c.is_whitespace()).next().unwrap_or("").trim();
            if name.is_empty() {
                continue;
            }
            let is_up = line.contains("UP");
            interfaces.push(NetworkInterface::new(name, is_up, Vec::new()));
            continue;
        }

        let Some(current) = interfaces.last_mut() else { continue };
        if line.trim_start().starts_with("UP ") {
            current.is_up = true;
        }
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "inet" || token == "inet6" {
                let value = tokens.next().unwrap_or("");
                let value = value.strip_prefix("addr:").unwrap_or(value);
                if let Some(address) = InterfaceAddress::parse(value) {
                    current.addresses.push(address);
                }
            }
        }
    }

    interfaces
}

/// Parses Windows `ipconfig /all` output, merging adapters that collapse to
/// the same friendly name.
pub fn parse_ipconfig(text: &str) -> Vec<NetworkInterface> {
    let mut interfaces: Vec<NetworkInterface> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lower = trimmed.to_ascii_lowercase();
        if !line.starts_with(' ') && (lower.contains("adapter") || lower.contains("adaptador")) && trimmed.ends_with(':') {
            let name = friendly_adapter_name(trimmed);
            if !interfaces.iter().any(|iface| iface.name == name) {
                interfaces.push(NetworkInterface::new(name.clone(), false, Vec::new()));
            }
            // Subsequent address lines belong to this adapter.
            if let Some(pos) = interfaces.iter().position(|iface| iface.name == name) {
                let iface = interfaces.remove(pos);
                interfaces.push(iface);
            }
            continue;
        }

        let Some(current) = interfaces.last_mut() else { continue };
        if (lower.contains("ipv4") || lower.contains("ipv6")) && trimmed.contains(':') {
            let value = trimmed
                .split_once(" : ")
                .map(|(_, v)| v)
                .unwrap_or_else(|| trimmed.rsplit(": ").next().unwrap_or(""));
            let value = value.split('(').next().unwrap_or("").trim();
            if let Some(address) = InterfaceAddress::parse(value) {
                if !current.addresses.contains(&address) {
                    current.addresses.push(address);
                }
                current.is_up = true;
            }
        }
    }

    interfaces
}

fn friendly_adapter_name(header: &str) -> String {
    let cleaned = header
        .trim_end_matches(':')
        .replace("Ethernet adapter", "Ethernet")
        .replace("Wireless LAN adapter", "Wi-Fi")
        .replace("Adaptador de Rede sem Fio", "Wi-Fi")
        .replace("Adaptador Ethernet", "Ethernet")
        .replace("Unknown adapter", "")
        .trim()
        .to_string();

    match classify(&cleaned) {
        InterfaceKind::Vpn => "VPN".to_string(),
        InterfaceKind::Wifi if cleaned.starts_with("Wi-Fi") => "Wi-Fi".to_string(),
        InterfaceKind::Ethernet if cleaned.starts_with("Ethernet") => "Ethernet".to_string(),
        _ => cleaned,
    }
}
