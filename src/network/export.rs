use chrono::{SecondsFormat, Utc};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use crate::{Result, SnifferError};
use super::packet::PacketRecord;

pub const CSV_HEADER: &[&str] = &[
    "timestamp", "protocol", "src_ip", "dst_ip", "src_port", "dst_port", "length", "info",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = SnifferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(SnifferError::Export(format!("unsupported export format '{}'", other))),
        }
    }
}

pub fn to_json(records: &[PacketRecord]) -> Result<String> {
    Ok(serde_json::to_string_pretty(records)?)
}

pub fn from_json(text: &str) -> Result<Vec<PacketRecord>> {
    Ok(serde_json::from_str(text)?)
}

pub fn to_csv(records: &[PacketRecord]) -> Result<String> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;

    for record in records {
        let src_port = record.src_port.map(|p| p.to_string()).unwrap_or_default();
        let dst_port = record.dst_port.map(|p| p.to_string()).unwrap_or_default();
        let length = record.length.to_string();
        writer.write_record([
            record.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true).as_str(),
            record.protocol.as_str(),
            record.src_ip.as_deref().unwrap_or(""),
            record.dst_ip.as_deref().unwrap_or(""),
            src_port.as_str(),
            dst_port.as_str(),
            length.as_str(),
            record.info.as_str(),
        ])?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| SnifferError::Export(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| SnifferError::Export(e.to_string()))
}

/// Writes records to `path`. Refuses an empty record set.
pub fn export_to_file(records: &[PacketRecord], format: ExportFormat, path: &Path) -> Result<()> {
    if records.is_empty() {
        return Err(SnifferError::Export("no packets to export".to_string()));
    }

    let contents = match format {
        ExportFormat::Json => to_json(records)?,
        ExportFormat::Csv => to_csv(records)?,
    };
    fs::write(path, contents)?;
    log::info!("Exported {} packets to {}", records.len(), path.display());
    Ok(())
}

/// `packets_YYYYmmdd_HHMMSS.<ext>`
pub fn default_export_name(format: ExportFormat) -> String {
    format!("packets_{}.{}", Utc::now().format("%Y%m%d_%H%M%S"), format.extension())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::Protocol;

    fn sample() -> Vec<PacketRecord> {
        vec![
            PacketRecord {
                timestamp: Utc::now(),
                protocol: Protocol::Dns,
                src_ip: Some("192.168.1.10".to_string()),
                dst_ip: Some("8.8.8.8".to_string()),
                src_port: Some(53124),
                dst_port: Some(53),
                length: 74,
                info: "DNS 192.168.1.10:53124 -> 8.8.8.8:53 74 bytes".to_string(),
            },
            PacketRecord {
                timestamp: Utc::now(),
                protocol: Protocol::Arp,
                src_ip: Some("192.168.1.10".to_string()),
                dst_ip: Some("192.168.1.1".to_string()),
                src_port: None,
                dst_port: None,
                length: 42,
                info: "who-has, with a comma".to_string(),
            },
        ]
    }

    #[test]
    fn test_json_round_trip() {
        let records = sample();
        let parsed = from_json(&to_json(&records).unwrap()).unwrap();
        assert_eq!(parsed, records);
    }

    #[test]
    fn test_json_uses_fixed_field_names() {
        let json: serde_json::Value = serde_json::from_str(&to_json(&sample()).unwrap()).unwrap();
        let first = &json[0];
        for key in ["timestamp", "protocol", "src_ip", "dst_ip", "src_port", "dst_port", "length", "info"] {
            assert!(first.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(first["protocol"], "DNS");
        assert!(first["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_csv_layout() {
        let csv = to_csv(&sample()).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("timestamp,protocol,src_ip,dst_ip,src_port,dst_port,length,info")
        );
        let dns = lines.next().unwrap();
        assert!(dns.contains(",DNS,192.168.1.10,8.8.8.8,53124,53,74,"));
        let arp = lines.next().unwrap();
        assert!(arp.contains(",ARP,192.168.1.10,192.168.1.1,,,42,\"who-has, with a comma\""));
    }

    #[test]
    fn test_export_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.csv");
        export_to_file(&sample(), ExportFormat::Csv, &path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 3);

        let empty = dir.path().join("empty.json");
        assert!(matches!(
            export_to_file(&[], ExportFormat::Json, &empty),
            Err(SnifferError::Export(_))
        ));
        assert!(!empty.exists());
    }

    #[test]
    fn test_format_parsing_and_names() {
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("csv".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("xml".parse::<ExportFormat>().is_err());

        let name = default_export_name(ExportFormat::Csv);
        assert!(name.starts_with("packets_"));
        assert!(name.ends_with(".csv"));
        assert_eq!(name.len(), "packets_20240101_120000.csv".len());
    }
}
