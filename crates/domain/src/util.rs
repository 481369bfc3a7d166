use sha2::{Digest, Sha256};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

pub fn uuid_v7_without_dashes() -> String {
    Uuid::now_v7().simple().to_string()
}

pub fn format_ms_rfc3339(epoch_ms: i64) -> String {
    let fallback = OffsetDateTime::from_unix_timestamp(0).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    let value =
        OffsetDateTime::from_unix_timestamp_nanos(epoch_ms as i128 * 1_000_000).unwrap_or(fallback);
    value
        .format(&Rfc3339)
        .unwrap_or("1970-01-01T00:00:00Z".to_string())
}

/// `YYYY-MM-DD HH:MM` in UTC, for human-facing reports.
pub fn format_ms_short(epoch_ms: i64) -> String {
    let Ok(format) = time::format_description::parse("[year]-[month]-[day] [hour]:[minute]") else {
        return format_ms_rfc3339(epoch_ms);
    };
    OffsetDateTime::from_unix_timestamp_nanos(epoch_ms as i128 * 1_000_000)
        .ok()
        .and_then(|value| value.format(&format).ok())
        .unwrap_or_else(|| format_ms_rfc3339(epoch_ms))
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// `part / whole * 100`, or zero when the whole is empty.
pub fn percentage(part: f64, whole: f64) -> f64 {
    if whole > 0.0 { part / whole * 100.0 } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_matches_known_digest() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn round3_rounds_half_away_from_zero() {
        assert_eq!(round3(33.33333), 33.333);
        assert_eq!(round3(66.6666), 66.667);
    }

    #[test]
    fn short_format_is_minute_precision_utc() {
        assert_eq!(format_ms_short(1_700_000_000_000), "2023-11-14 22:13");
    }

    #[test]
    fn percentage_of_empty_whole_is_zero() {
        assert_eq!(percentage(10.0, 0.0), 0.0);
        assert_eq!(percentage(10.0, 40.0), 25.0);
    }
}
