//! Lease file readers.
//!
//! Both take `now` so activity is decided against an injected clock.

use std::net::Ipv4Addr;

use chrono::{DateTime, NaiveDateTime, Utc};

use sbc_netcfg_common::model::{normalize_mac, LeaseRecord};
use sbc_netcfg_common::ParseOutcome;

use crate::isc_syntax::{parse_statements_partial, Statement};

fn upsert(leases: &mut Vec<LeaseRecord>, lease: LeaseRecord) {
    match leases.iter_mut().find(|l| l.ip == lease.ip) {
        Some(slot) => *slot = lease,
        None => leases.push(lease),
    }
}

fn is_active(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.map_or(true, |at| now < at)
}

/// Parses a dnsmasq lease file: `<expiry> <mac> <ip> <hostname> <client-id>`.
///
/// Expiry `0` means the lease never ends; hostname `*` means none.
/// IPv6 entries and the `duid` line are skipped.
pub fn parse_dnsmasq_leases(text: &str, now: DateTime<Utc>) -> ParseOutcome<Vec<LeaseRecord>> {
    let mut outcome = ParseOutcome::new(Vec::new());

    for (idx, line) in text.lines().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() || fields[0] == "duid" {
            continue;
        }
        if fields.len() < 4 {
            outcome.warn(format!("line {}: truncated lease entry", idx + 1));
            continue;
        }
        if fields[2].contains(':') {
            continue;
        }

        let expires_at = match fields[0].parse::<i64>() {
            Ok(0) => None,
            Ok(secs) => match DateTime::<Utc>::from_timestamp(secs, 0) {
                Some(at) => Some(at),
                None => {
                    outcome.warn(format!("line {}: expiry {} out of range", idx + 1, secs));
                    continue;
                }
            },
            Err(_) => {
                outcome.warn(format!("line {}: bad expiry {}", idx + 1, fields[0]));
                continue;
            }
        };
        let (Ok(mac), Ok(ip)) = (normalize_mac(fields[1]), fields[2].parse::<Ipv4Addr>()) else {
            outcome.warn(format!("line {}: bad MAC or IPv4 address", idx + 1));
            continue;
        };
        let hostname = Some(fields[3]).filter(|h| *h != "*").map(str::to_string);

        upsert(
            &mut outcome.records,
            LeaseRecord {
                mac,
                ip,
                hostname,
                expires_at,
                active: is_active(expires_at, now),
            },
        );
    }
    outcome
}

/// Parses an ISC `ends` value: `never`, `epoch N;`, or `W YYYY/MM/DD HH:MM:SS` in UTC.
///
/// The outer option is `None` when the value is unusable.
fn parse_isc_time(words: &[String]) -> Option<Option<DateTime<Utc>>> {
    match words {
        [never] if never == "never" => Some(None),
        [epoch, secs, ..] if epoch == "epoch" => {
            DateTime::<Utc>::from_timestamp(secs.parse().ok()?, 0).map(Some)
        }
        [_weekday, date, time, ..] => {
            let naive =
                NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y/%m/%d %H:%M:%S")
                    .ok()?;
            Some(Some(naive.and_utc()))
        }
        _ => None,
    }
}

fn parse_isc_lease(stmt: &Statement, now: DateTime<Utc>) -> Result<LeaseRecord, String> {
    let ip: Ipv4Addr = stmt
        .args()
        .first()
        .and_then(|a| a.parse().ok())
        .ok_or_else(|| format!("line {}: lease without an IPv4 address", stmt.line))?;

    let mut mac = None;
    let mut hostname = None;
    let mut expires_at = None;

    for inner in stmt.block.iter().flatten() {
        if inner.starts_with(&["hardware", "ethernet"]) {
            mac = inner.words.get(2).and_then(|m| normalize_mac(m).ok());
        } else if inner.keyword() == "client-hostname" {
            hostname = inner.args().first().cloned();
        } else if inner.keyword() == "ends" {
            expires_at = Some(parse_isc_time(inner.args()).ok_or_else(|| {
                format!("line {}: unparsable ends time for {}", inner.line, ip)
            })?);
        }
    }

    let mac =
        mac.ok_or_else(|| format!("line {}: lease {} has no ethernet address", stmt.line, ip))?;
    // A lease without `ends` is treated as never expiring.
    let expires_at = expires_at.flatten();
    Ok(LeaseRecord {
        mac,
        ip,
        hostname: hostname.filter(|h| !h.is_empty()),
        expires_at,
        active: is_active(expires_at, now),
    })
}

/// Parses `dhcpd.leases`. The last block for an address wins.
///
/// dhcpd appends to the file, so a structural error only costs the blocks
/// from that point on; it is reported as a warning.
pub fn parse_isc_leases(text: &str, now: DateTime<Utc>) -> ParseOutcome<Vec<LeaseRecord>> {
    let (statements, error) = parse_statements_partial(text);
    let mut outcome = ParseOutcome::new(Vec::new());
    if let Some(e) = error {
        outcome.warn(format!("dhcpd.leases truncated: {}", e));
    }

    for stmt in statements.iter().filter(|s| s.keyword() == "lease" && s.block.is_some()) {
        match parse_isc_lease(stmt, now) {
            Ok(lease) => upsert(&mut outcome.records, lease),
            Err(e) => outcome.warn(e),
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_dnsmasq_leases() {
        let past = now().timestamp() - 60;
        let future = now().timestamp() + 3600;
        let text = format!(
            "{} aa:bb:cc:dd:ee:01 192.168.1.101 laptop 01:aa:bb:cc:dd:ee:01\n\
             {} AA:BB:CC:DD:EE:02 192.168.1.102 * *\n\
             0 aa:bb:cc:dd:ee:03 192.168.1.103 printer *\n\
             duid 00:01:00:01:2c:00:00:00\n\
             {} aa:bb:cc:dd:ee:04 fd00::4 phone *\n\
             garbage\n",
            future, past, future
        );
        let outcome = parse_dnsmasq_leases(&text, now());
        assert_eq!(outcome.warnings.len(), 1);

        let leases = outcome.records;
        assert_eq!(leases.len(), 3);
        assert_eq!(leases[0].hostname.as_deref(), Some("laptop"));
        assert!(leases[0].active);
        assert_eq!(leases[1].mac, "aa:bb:cc:dd:ee:02");
        assert_eq!(leases[1].hostname, None);
        assert!(!leases[1].active);
        assert_eq!(leases[2].expires_at, None);
        assert!(leases[2].active);
    }

    #[test]
    fn test_isc_leases_last_block_wins() {
        let text = r#"
# The format of this file is documented in the dhcpd.leases(5) manual page.
authoring-byte-order little-endian;

lease 192.168.1.120 {
  starts 5 2024/03/01 10:00:00;
  ends 5 2024/03/01 11:00:00;
  binding state free;
  hardware ethernet aa:bb:cc:dd:ee:10;
}
lease 192.168.1.120 {
  starts 5 2024/03/01 11:30:00;
  ends 5 2024/03/01 13:30:00;
  binding state active;
  hardware ethernet aa:bb:cc:dd:ee:10;
  client-hostname "tablet";
}
lease 192.168.1.121 {
  ends never;
  hardware ethernet aa:bb:cc:dd:ee:11;
}
lease 192.168.1.122 {
  ends epoch 1709290800; # 2024-03-01 11:00:00 UTC
  hardware ethernet aa:bb:cc:dd:ee:12;
}
lease 192.168.1.123 {
  ends 5 2024/03/01 13:00:00;
}
"#;
        let outcome = parse_isc_leases(text, now());
        assert_eq!(outcome.warnings.len(), 1);

        let leases = outcome.records;
        assert_eq!(leases.len(), 3);
        assert_eq!(leases[0].ip, Ipv4Addr::new(192, 168, 1, 120));
        assert_eq!(leases[0].hostname.as_deref(), Some("tablet"));
        assert_eq!(
            leases[0].expires_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 13, 30, 0).unwrap())
        );
        assert!(leases[0].active);
        assert_eq!(leases[1].expires_at, None);
        assert!(leases[1].active);
        assert!(!leases[2].active);
    }

    #[test]
    fn test_isc_leases_truncated_tail() {
        let text = "\
lease 192.168.1.120 {
  ends 5 2024/03/01 13:30:00;
  hardware ethernet aa:bb:cc:dd:ee:10;
  client-hostname \"tablet\";
}
lease 192.168.1.121 {
  starts 5 2024/03/01 11:30:00;
  hardware ethernet aa:bb:cc:dd:ee:11;
";
        let outcome = parse_isc_leases(text, now());
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].ip, Ipv4Addr::new(192, 168, 1, 120));
        assert_eq!(outcome.records[0].hostname.as_deref(), Some("tablet"));
        assert_eq!(outcome.warnings, vec!["dhcpd.leases truncated: unterminated block"]);
    }
}
