use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use crate::utils::format_clock;
use super::packet::{PacketRecord, Protocol};

const HTTP_PORTS: &[u16] = &[80, 443, 8080];
const DNS_PORTS: &[u16] = &[53];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalkerStats {
    pub address: String,
    pub bytes: u64,
    pub packets: u64,
}

/// Per 5-tuple aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStats {
    pub flow_id: String,
    pub protocol: Protocol,
    pub packet_count: usize,
    pub byte_count: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub avg_packet_size: f64,
    pub packets_per_second: f64,
}

/// Stateless queries over buffered records.
pub struct AnalyticsEngine;

impl AnalyticsEngine {
    pub fn filter_http(records: &[PacketRecord]) -> Vec<PacketRecord> {
        records
            .iter()
            .filter(|r| matches!(r.protocol, Protocol::Http | Protocol::Https) || r.has_port(HTTP_PORTS))
            .cloned()
            .collect()
    }

    pub fn filter_dns(records: &[PacketRecord]) -> Vec<PacketRecord> {
        records
            .iter()
            .filter(|r| r.protocol == Protocol::Dns || r.has_port(DNS_PORTS))
            .cloned()
            .collect()
    }

    /// Hosts ranked by bytes sent plus received. Each record's length is
    /// credited to both endpoints. Ties sort by address ascending.
    pub fn top_talkers(records: &[PacketRecord], limit: usize) -> Vec<TalkerStats> {
        let mut totals: HashMap<&str, (u64, u64)> = HashMap::new();

        for record in records {
            for address in [record.src_ip.as_deref(), record.dst_ip.as_deref()].into_iter().flatten() {
                let entry = totals.entry(address).or_insert((0, 0));
                entry.0 += record.length as u64;
                entry.1 += 1;
            }
        }

        let mut talkers: Vec<TalkerStats> = totals
            .into_iter()
            .map(|(address, (bytes, packets))| TalkerStats {
                address: address.to_string(),
                bytes,
                packets,
            })
            .collect();
        talkers.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.address.cmp(&b.address)));
        talkers.truncate(limit);
        talkers
    }

    pub fn protocol_distribution(records: &[PacketRecord]) -> BTreeMap<String, usize> {
        let mut distribution = BTreeMap::new();
        for record in records {
            *distribution.entry(record.protocol.to_string()).or_insert(0) += 1;
        }
        distribution
    }

    /// Flows keyed by protocol and both endpoints, busiest first.
    pub fn conversations(records: &[PacketRecord]) -> Vec<FlowStats> {
        let mut flows: HashMap<String, FlowStats> = HashMap::new();

        for record in records {
            let flow_id = format!(
                "{} {}:{} -> {}:{}",
                record.protocol,
                record.src_ip.as_deref().unwrap_or("?"),
                record.src_port.unwrap_or(0),
                record.dst_ip.as_deref().unwrap_or("?"),
                record.dst_port.unwrap_or(0)
            );

            let flow = flows.entry(flow_id.clone()).or_insert_with(|| FlowStats {
                flow_id,
                protocol: record.protocol,
                packet_count: 0,
                byte_count: 0,
                first_seen: record.timestamp,
                last_seen: record.timestamp,
                avg_packet_size: 0.0,
                packets_per_second: 0.0,
            });

            flow.packet_count += 1;
            flow.byte_count += record.length;
            flow.first_seen = flow.first_seen.min(record.timestamp);
            flow.last_seen = flow.last_seen.max(record.timestamp);
        }

        let mut flows: Vec<FlowStats> = flows
            .into_values()
            .map(|mut flow| {
                flow.avg_packet_size = flow.byte_count as f64 / flow.packet_count as f64;
                let span = (flow.last_seen - flow.first_seen).num_milliseconds() as f64 / 1000.0;
                flow.packets_per_second = flow.packet_count as f64 / span.max(1.0);
                flow
            })
            .collect();
        flows.sort_by(|a, b| b.byte_count.cmp(&a.byte_count).then_with(|| a.flow_id.cmp(&b.flow_id)));
        flows
    }

    /// `[HH:MM:SS.mmm] PROTO src -> dst (N bytes)`
    pub fn format_record(record: &PacketRecord) -> String {
        format!(
            "[{}] {} {} -> {} ({} bytes)",
            format_clock(&record.timestamp),
            record.protocol,
            record.source_endpoint().unwrap_or_else(|| "?".to_string()),
            record.destination_endpoint().unwrap_or_else(|| "?".to_string()),
            record.length
        )
    }
}
