use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::types::{Category, Target, TargetTag};

/// Parse a ports file content into a deduplicated list of TCP ports (1..=65535).
///
/// Supported formats per line:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - comments: everything after `#` is ignored
/// - whitespace and blank lines are ignored
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }

        if let Some((a, b)) = line.split_once('-') {
            let (start, end) = parse_range(a, b)
                .with_context(|| format!("line {line_no}: invalid range: {line}"))?;
            for p in start..=end {
                if seen.insert(p) {
                    out.push(p);
                }
            }
            continue;
        }

        let p = parse_port_str(line)
            .with_context(|| format!("line {line_no}: invalid port value: {line}"))?;
        if seen.insert(p) {
            out.push(p);
        }
    }

    Ok(out)
}

/// Load a ports list from a file path. Errors if the file cannot be read or parsed.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> Result<Vec<u16>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    parse_ports_str(&content)
}

/// Validate an inclusive `start..=end` port range.
pub fn validate_range(start: u16, end: u16) -> Result<()> {
    if start == 0 {
        bail!("port out of range: 0");
    }
    if start > end {
        bail!("invalid range {start}-{end} (start > end)");
    }
    Ok(())
}

fn parse_range(a: &str, b: &str) -> Result<(u16, u16)> {
    let start = parse_port_str(a.trim()).with_context(|| format!("invalid start: {a}"))?;
    let end = parse_port_str(b.trim()).with_context(|| format!("invalid end: {b}"))?;
    validate_range(start, end)?;
    Ok((start, end))
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

/// Ports the audited host is supposed to expose.
pub const EXPECTED_PORTS: &[(u16, &str)] = &[
    (22, "SSH"),
    (80, "HTTP"),
    (443, "HTTPS"),
    (3000, "API Server"),
    (3001, "Alt API"),
    (3306, "MySQL"),
    (4000, "Test Port 1"),
    (5000, "Test Port 2"),
    (5432, "PostgreSQL"),
    (6000, "Test Port 3"),
    (6379, "Redis"),
    (8000, "Django"),
    (8001, "Service"),
    (8080, "Admin"),
    (8081, "Admin Alt"),
    (8443, "HTTPS Alt"),
    (8888, "Jupyter"),
    (8889, "Custom"),
    (9090, "Dashboard"),
    (27017, "MongoDB"),
];

/// Well-known services that are recognisable but not expected on the host.
pub const COMMON_PORTS: &[(u16, &str)] = &[
    (21, "FTP"),
    (23, "Telnet"),
    (25, "SMTP"),
    (53, "DNS"),
    (110, "POP3"),
    (111, "RPC"),
    (135, "Windows RPC"),
    (139, "NetBIOS"),
    (143, "IMAP"),
    (445, "SMB"),
    (993, "IMAPS"),
    (995, "POP3S"),
    (1433, "MSSQL"),
    (1521, "Oracle"),
    (1723, "PPTP"),
    (3389, "RDP"),
    (5900, "VNC"),
    (5984, "CouchDB"),
    (8008, "HTTP Alt"),
    (8086, "InfluxDB"),
    (8090, "Confluence"),
    (9200, "Elasticsearch"),
    (11211, "Memcached"),
    (27018, "MongoDB Alt"),
    (27019, "MongoDB Alt2"),
    (50000, "DB2"),
];

/// Sub-ranges a full 1-65535 sweep is split into, run one after another.
pub const SWEEP_CHUNKS: &[(u16, u16, &str)] = &[
    (1, 1000, "System Ports"),
    (1001, 5000, "User Ports"),
    (5001, 10000, "Dynamic Ports"),
    (10001, 30000, "High Ports"),
    (30001, 65535, "Ephemeral Ports"),
];

/// Reference sets used to classify probed ports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownPorts {
    pub expected: BTreeMap<u16, String>,
    pub common: BTreeMap<u16, String>,
}

impl KnownPorts {
    /// The built-in expected and common tables.
    pub fn builtin() -> Self {
        Self {
            expected: to_map(EXPECTED_PORTS),
            common: to_map(COMMON_PORTS),
        }
    }

    /// Sets with no members; every untagged port classifies as rogue.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_expected(&self, port: u16) -> bool {
        self.expected.contains_key(&port)
    }

    pub fn is_common(&self, port: u16) -> bool {
        self.common.contains_key(&port)
    }

    pub fn label(&self, port: u16) -> Option<&str> {
        self.expected
            .get(&port)
            .or_else(|| self.common.get(&port))
            .map(String::as_str)
    }

    /// Expected wins over common, common wins over rogue. A target's own tag counts as
    /// membership in the matching set.
    pub fn classify(&self, target: &Target) -> Category {
        if target.tag == TargetTag::Expected || self.is_expected(target.port) {
            Category::Expected
        } else if target.tag == TargetTag::Common || self.is_common(target.port) {
            Category::CommonService
        } else {
            Category::Rogue
        }
    }

    /// Targets for a quick scan: every expected port followed by every common port not
    /// already listed, tagged accordingly.
    pub fn targets(&self) -> Vec<Target> {
        let mut out: Vec<Target> = self
            .expected
            .iter()
            .map(|(&p, l)| Target::labeled(p, l.clone(), TargetTag::Expected))
            .collect();
        out.extend(
            self.common
                .iter()
                .filter(|(p, _)| !self.expected.contains_key(*p))
                .map(|(&p, l)| Target::labeled(p, l.clone(), TargetTag::Common)),
        );
        out
    }
}

fn to_map(table: &[(u16, &str)]) -> BTreeMap<u16, String> {
    table.iter().map(|&(p, l)| (p, l.to_string())).collect()
}

/// Unlabeled, untagged targets for every port in `start..=end`.
pub fn range_targets(start: u16, end: u16) -> Vec<Target> {
    (start..=end).map(Target::new).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_ports() {
        let input = "80\n22\n   443  \n";
        let ports = parse_ports_str(input).unwrap();
        assert_eq!(ports, vec![80, 22, 443]);
    }

    #[test]
    fn parse_ranges_and_dedup() {
        let input = "8000-8002\n80\n8001\n";
        let ports = parse_ports_str(input).unwrap();
        assert_eq!(ports, vec![8000, 8001, 8002, 80]);
    }

    #[test]
    fn invalid_values_error() {
        assert!(parse_ports_str("70000\n").is_err());
        assert!(parse_ports_str("90-80\n").is_err());
    }

    #[test]
    fn classify_prefers_expected_then_common() {
        let known = KnownPorts::builtin();
        assert_eq!(known.classify(&Target::new(22)), Category::Expected);
        assert_eq!(known.classify(&Target::new(21)), Category::CommonService);
        assert_eq!(known.classify(&Target::new(31337)), Category::Rogue);
    }

    #[test]
    fn tag_counts_as_membership() {
        let known = KnownPorts::empty();
        let t = Target::labeled(31337, "Game", TargetTag::Common);
        assert_eq!(known.classify(&t), Category::CommonService);
        let t = Target::labeled(21, "FTP", TargetTag::Expected);
        assert_eq!(KnownPorts::builtin().classify(&t), Category::Expected);
    }

    #[test]
    fn builtin_tables_are_disjoint() {
        let known = KnownPorts::builtin();
        assert!(known.expected.keys().all(|p| !known.is_common(*p)));
        assert_eq!(known.targets().len(), EXPECTED_PORTS.len() + COMMON_PORTS.len());
    }

    #[test]
    fn sweep_chunks_cover_every_port_once() {
        let mut next = 1u32;
        for &(start, end, _) in SWEEP_CHUNKS {
            assert_eq!(start as u32, next);
            assert!(start <= end);
            next = end as u32 + 1;
        }
        assert_eq!(next, 65536);
    }
}
