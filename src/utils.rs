use std::path::Path;
use std::process::{Command, Stdio};
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn format_clock(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%H:%M:%S%.3f").to_string()
}

/// Converts a fractional epoch string such as `"1700000000.123456789"`.
pub fn parse_epoch(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let (secs, frac) = match value.split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (value, ""),
    };
    let secs: i64 = secs.parse().ok()?;
    let nanos = if frac.is_empty() {
        0
    } else {
        let digits: String = frac.chars().take(9).collect();
        let scale = 10u32.pow(9 - digits.len() as u32);
        digits.parse::<u32>().ok()? * scale
    };
    Utc.timestamp_opt(secs, nanos).single()
}

const TSHARK_UNIX_PATHS: &[&str] = &[
    "/usr/bin/tshark",
    "/usr/local/bin/tshark",
    "/opt/homebrew/bin/tshark",
];

const TSHARK_WINDOWS_PATHS: &[&str] = &[
    "C:\\Program Files\\Wireshark\\tshark.exe",
    "C:\\Program Files (x86)\\Wireshark\\tshark.exe",
];

/// Locates the `tshark` binary: configured path, well-known install
/// locations, then whatever `PATH` resolves.
pub fn find_tshark(configured: Option<&str>) -> Option<String> {
    if let Some(path) = configured {
        if Path::new(path).exists() || responds_to_version(path) {
            return Some(path.to_string());
        }
        log::warn!("Configured tshark path {} is not usable", path);
    }

    let known = if cfg!(windows) { TSHARK_WINDOWS_PATHS } else { TSHARK_UNIX_PATHS };
    if let Some(path) = known.iter().find(|p| Path::new(p).exists()) {
        return Some(path.to_string());
    }

    let on_path = if cfg!(windows) { "tshark.exe" } else { "tshark" };
    if responds_to_version(on_path) {
        return Some(on_path.to_string());
    }
    None
}

/// True when running as root (Unix) or as an Administrator (Windows).
#[cfg(unix)]
pub fn is_elevated() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// True when running as root (Unix) or as an Administrator (Windows).
#[cfg(windows)]
pub fn is_elevated() -> bool {
    // `net session` is refused without administrative rights.
    Command::new("net")
        .arg("session")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
pub fn is_elevated() -> bool {
    false
}

fn responds_to_version(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_generation() {
        let id1 = generate_session_id();
        let id2 = generate_session_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 36); // UUID length
    }

    #[test]
    fn test_epoch_parsing() {
        let ts = parse_epoch("1700000000.250000000").unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_millis(), 250);

        let ts = parse_epoch("1700000000.5").unwrap();
        assert_eq!(ts.timestamp_subsec_millis(), 500);

        assert!(parse_epoch("1700000000").is_some());
        assert!(parse_epoch("not-a-time").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_elevation_matches_effective_uid() {
        let uid = Command::new("id").arg("-u").output().unwrap();
        let uid = String::from_utf8_lossy(&uid.stdout).trim().to_string();
        assert_eq!(is_elevated(), uid == "0");
    }

    #[test]
    fn test_clock_format() {
        let ts = parse_epoch("1700000000.123").unwrap();
        assert_eq!(format_clock(&ts), "22:13:20.123");
    }
}
