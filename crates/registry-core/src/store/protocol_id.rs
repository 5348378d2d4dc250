//! Protocol-ID allocation.
//!
//! Current format is `YYYY-NNNNNNNNNN` (ten-digit sequence per year). Legacy
//! rows may carry `SUB-YY-NNNN`; both are read so a new ID never collides with
//! either generation. Only the current format is ever written.

use crate::error::{RegistryError, Result};
use rusqlite::{params, Connection};

pub const MAX_SEQUENCE: u64 = 9_999_999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolId {
    Current { year: i32, sequence: u64 },
    Legacy { year_short: u8, sequence: u64 },
}

impl ProtocolId {
    pub fn parse(id: &str) -> Option<Self> {
        if let Some(rest) = id.strip_prefix("SUB-") {
            let (yy, seq) = rest.split_once('-')?;
            if yy.len() != 2 || !all_digits(yy) || !all_digits(seq) {
                return None;
            }
            return Some(ProtocolId::Legacy {
                year_short: yy.parse().ok()?,
                sequence: seq.parse().ok()?,
            });
        }
        let (year, seq) = id.split_once('-')?;
        if year.len() != 4 || !all_digits(year) || !all_digits(seq) {
            return None;
        }
        Some(ProtocolId::Current {
            year: year.parse().ok()?,
            sequence: seq.parse().ok()?,
        })
    }

    /// Sequence number if this ID belongs to `year`.
    pub fn sequence_in(&self, year: i32) -> Option<u64> {
        match *self {
            ProtocolId::Current { year: y, sequence } if y == year => Some(sequence),
            ProtocolId::Legacy { year_short, sequence } if i32::from(year_short) == year % 100 => {
                Some(sequence)
            }
            _ => None,
        }
    }
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Highest sequence across both formats for `year`, 0 if none.
pub fn highest_sequence<'a, I>(ids: I, year: i32) -> u64
where
    I: IntoIterator<Item = &'a str>,
{
    ids.into_iter()
        .filter_map(ProtocolId::parse)
        .filter_map(|id| id.sequence_in(year))
        .max()
        .unwrap_or(0)
}

pub fn format_id(year: i32, sequence: u64) -> Result<String> {
    if sequence == 0 || sequence > MAX_SEQUENCE {
        return Err(RegistryError::ProtocolIdExhausted(year));
    }
    Ok(format!("{year:04}-{sequence:010}"))
}

pub fn next_protocol_id<'a, I>(ids: I, year: i32) -> Result<String>
where
    I: IntoIterator<Item = &'a str>,
{
    format_id(year, highest_sequence(ids, year).saturating_add(1))
}

/// Scan stored IDs for `year`. Sequences are compared numerically, not lexically.
pub(crate) fn stored_highest_sequence(conn: &Connection, year: i32) -> Result<u64> {
    let current = format!("{year:04}-%");
    let legacy = format!("SUB-{:02}-%", year % 100);
    let mut stmt = conn.prepare(
        "SELECT protocol_id FROM subscriptions WHERE protocol_id LIKE ?1 OR protocol_id LIKE ?2",
    )?;
    let ids = stmt
        .query_map(params![current, legacy], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(highest_sequence(ids.iter().map(String::as_str), year))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_formats() {
        assert_eq!(
            ProtocolId::parse("2026-0000000005"),
            Some(ProtocolId::Current { year: 2026, sequence: 5 })
        );
        assert_eq!(
            ProtocolId::parse("SUB-26-0003"),
            Some(ProtocolId::Legacy { year_short: 26, sequence: 3 })
        );
        assert_eq!(ProtocolId::parse("2026-"), None);
        assert_eq!(ProtocolId::parse("SUB-2026-0003"), None);
        assert_eq!(ProtocolId::parse("garbage"), None);
    }

    #[test]
    fn next_id_takes_max_across_formats() {
        let ids = ["2026-0000000005", "SUB-26-0003"];
        assert_eq!(next_protocol_id(ids, 2026).unwrap(), "2026-0000000006");

        let legacy_ahead = ["2026-0000000002", "SUB-26-0040"];
        assert_eq!(next_protocol_id(legacy_ahead, 2026).unwrap(), "2026-0000000041");
    }

    #[test]
    fn other_years_are_ignored_and_default_is_one() {
        let ids = ["2025-0000000099", "SUB-25-0100"];
        assert_eq!(next_protocol_id(ids, 2026).unwrap(), "2026-0000000001");
        assert_eq!(next_protocol_id(std::iter::empty(), 2026).unwrap(), "2026-0000000001");
    }

    #[test]
    fn sequence_is_numeric_not_lexical() {
        let ids = ["2026-999", "2026-0000001000"];
        assert_eq!(highest_sequence(ids, 2026), 1000);
    }

    #[test]
    fn exhausted_sequence_is_an_error() {
        let ids = ["2026-9999999999"];
        assert!(matches!(
            next_protocol_id(ids, 2026),
            Err(RegistryError::ProtocolIdExhausted(2026))
        ));
    }
}
