//! Decoder for message body blobs and store timestamps.
//!
//! The message database stores body text in two shapes: a plain `text`
//! column (older rows) and an `attributedBody` binary blob (newer rows).
//! The blob is either an NSKeyedArchiver binary plist or the older
//! streamtyped serialization, and in practice arrives truncated or
//! corrupted often enough that every parse path must be best-effort.
//!
//! Decoding is total: any byte input, including empty, truncated, and
//! random bytes, produces either extracted text or the explicit
//! "unavailable" sentinel. The decoder never fabricates content.

use chrono::{DateTime, LocalResult, TimeZone, Utc};

/// Returned when no parse strategy can recover the message body.
pub const UNAVAILABLE: &str = "[message content not available]";

/// Unix seconds at the store's reference instant, 2001-01-01T00:00:00Z.
pub const REFERENCE_EPOCH_UNIX_SECS: i64 = 978_307_200;

/// Ordered parse strategies. The decoder commits to the first success,
/// which keeps the fragile heuristic path isolated and independently
/// testable.
const STRATEGIES: &[fn(&[u8]) -> Option<String>] =
    &[parse_keyed_archive, parse_streamtyped, scan_printable];

/// Resolve a row's body text: the plain column wins when populated,
/// then the blob strategies, then the sentinel.
pub fn message_text(text: Option<&str>, blob: Option<&[u8]>) -> String {
    if let Some(t) = text {
        if !t.is_empty() {
            return t.to_string();
        }
    }
    blob.and_then(extract_text)
        .unwrap_or_else(|| UNAVAILABLE.to_string())
}

/// Run the strategy chain over a raw blob.
pub fn extract_text(blob: &[u8]) -> Option<String> {
    if blob.is_empty() {
        return None;
    }
    STRATEGIES.iter().find_map(|parse| parse(blob))
}

/// Convert a raw store timestamp (integer nanoseconds since the
/// reference instant) to UTC. Zero and negative values are valid and map
/// to the reference instant or earlier.
pub fn store_timestamp_to_utc(raw_ns: i64) -> DateTime<Utc> {
    let secs = raw_ns.div_euclid(1_000_000_000);
    let nanos = raw_ns.rem_euclid(1_000_000_000) as u32;
    match Utc.timestamp_opt(REFERENCE_EPOCH_UNIX_SECS.saturating_add(secs), nanos) {
        LocalResult::Single(dt) => dt,
        _ => DateTime::<Utc>::MIN_UTC,
    }
}

/// Convert a UTC instant to the store's nanosecond representation.
pub fn utc_to_store_timestamp(dt: DateTime<Utc>) -> i64 {
    let secs = dt.timestamp() - REFERENCE_EPOCH_UNIX_SECS;
    secs.saturating_mul(1_000_000_000)
        .saturating_add(i64::from(dt.timestamp_subsec_nanos()))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Strategy 1: NSKeyedArchiver binary plist.
///
/// The archive stores payload strings in a `$objects` array alongside
/// class names and bookkeeping entries, which are skipped.
fn parse_keyed_archive(blob: &[u8]) -> Option<String> {
    let start = find(blob, b"bplist")?;
    let value: plist::Value = plist::from_bytes(&blob[start..]).ok()?;
    let dict = value.as_dictionary()?;
    let objects = dict.get("$objects")?.as_array()?;

    for obj in objects {
        match obj {
            plist::Value::String(s) => {
                if !s.starts_with("NS") && !s.starts_with('$') && !s.trim().is_empty() {
                    return Some(s.trim().to_string());
                }
            }
            plist::Value::Dictionary(d) => {
                if let Some(plist::Value::String(s)) = d.get("NS.string") {
                    if !s.trim().is_empty() {
                        return Some(s.trim().to_string());
                    }
                }
                if let Some(plist::Value::Data(data)) = d.get("NS.bytes") {
                    if let Ok(s) = std::str::from_utf8(data) {
                        if !s.trim().is_empty() {
                            return Some(s.trim().to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Strategy 2: streamtyped serialization.
///
/// Layout after an `NSString`/`NSMutableString` marker: control bytes,
/// a `+`, a length byte, then the UTF-8 payload terminated by control
/// sequences (0x86, 0x84, 0x00).
fn parse_streamtyped(blob: &[u8]) -> Option<String> {
    for marker in [b"NSString".as_slice(), b"NSMutableString".as_slice()] {
        if let Some(text) = streamtyped_payload(blob, marker) {
            return Some(text);
        }
    }
    None
}

fn streamtyped_payload(blob: &[u8], marker: &[u8]) -> Option<String> {
    let marker_idx = find(blob, marker)?;
    let plus = find(&blob[marker_idx..], b"+")?;
    // The '+' sits within a few control bytes of the marker; a distant
    // '+' is message content, not framing.
    if plus >= 20 {
        return None;
    }
    // Skip the '+' and the length byte.
    let start = marker_idx + plus + 2;
    if start >= blob.len() {
        return None;
    }
    let payload = take_until_control(&blob[start..]);
    let text = match std::str::from_utf8(payload) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(payload).into_owned(),
    };
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn take_until_control(bytes: &[u8]) -> &[u8] {
    let mut end = 0;
    while end < bytes.len() {
        let b = bytes[end];
        if b == 0x86 || b == 0x84 || b == 0x00 {
            break;
        }
        // 'i' followed by 'I' or 'N' marks the trailing attribute run.
        if b == b'i' && matches!(bytes.get(end + 1), Some(&0x49) | Some(&0x4e)) {
            break;
        }
        end += 1;
    }
    &bytes[..end]
}

/// Markers that identify serialization metadata rather than content.
const METADATA_MARKERS: &[&str] = &[
    "NSString",
    "NSObject",
    "NSMutable",
    "NSDictionary",
    "NSAttributed",
    "streamtyped",
    "__kIM",
    "NSNumber",
    "NSValue",
];

/// Strategy 3: heuristic scan for the longest printable run that is not
/// a known metadata marker.
fn scan_printable(blob: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(blob);
    let mut best: Option<String> = None;
    let mut run = String::new();

    for ch in text.chars().chain(std::iter::once('\u{0}')) {
        if ch.is_ascii_graphic() || ch == ' ' {
            run.push(ch);
            continue;
        }
        if run.len() >= 3 && !METADATA_MARKERS.iter().any(|m| run.contains(m)) {
            let cleaned = run.trim_matches('+').trim();
            if cleaned.len() >= 2 && best.as_ref().map_or(true, |b| cleaned.len() > b.len()) {
                best = Some(cleaned.to_string());
            }
        }
        run.clear();
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    fn streamtyped_blob(text: &str) -> Vec<u8> {
        let mut blob: Vec<u8> = b"streamtyped".to_vec();
        blob.extend_from_slice(b"NSString");
        blob.extend_from_slice(&[0x01, 0x94, 0x84, 0x01, b'+']);
        blob.push(text.len() as u8);
        blob.extend_from_slice(text.as_bytes());
        blob.extend_from_slice(&[0x86, 0x84]);
        blob
    }

    fn keyed_archive_blob(text: &str) -> Vec<u8> {
        let objects = vec![
            plist::Value::String("$null".into()),
            plist::Value::String(text.into()),
            plist::Value::String("NSString".into()),
        ];
        let mut root = plist::Dictionary::new();
        root.insert("$objects".into(), plist::Value::Array(objects));
        let mut buf = Vec::new();
        plist::Value::Dictionary(root)
            .to_writer_binary(&mut buf)
            .expect("serialize test archive");
        buf
    }

    #[test]
    fn plain_text_column_wins() {
        let blob = streamtyped_blob("from the blob");
        assert_eq!(message_text(Some("from the column"), Some(&blob)), "from the column");
    }

    #[test]
    fn empty_text_falls_through_to_blob() {
        let blob = streamtyped_blob("Hello");
        assert_eq!(message_text(Some(""), Some(&blob)), "Hello");
    }

    #[test]
    fn streamtyped_extraction() {
        assert_eq!(extract_text(&streamtyped_blob("Hello")), Some("Hello".to_string()));
    }

    #[test]
    fn keyed_archive_extraction() {
        // The magic may sit mid-blob; prepend junk to exercise the scan.
        let mut blob = vec![0x04, 0x0b, 0xff];
        blob.extend_from_slice(&keyed_archive_blob("Dinner at 7?"));
        assert_eq!(extract_text(&blob), Some("Dinner at 7?".to_string()));
    }

    #[test]
    fn empty_blob_is_unavailable() {
        assert_eq!(message_text(None, Some(&[])), UNAVAILABLE);
        assert_eq!(message_text(None, None), UNAVAILABLE);
    }

    #[test]
    fn garbage_never_panics() {
        let garbage: Vec<u8> = (0u16..512).map(|i| (i.wrapping_mul(31) % 256) as u8).collect();
        let _ = message_text(None, Some(&garbage));
        let _ = extract_text(&[0xff, 0xfe, 0x00, 0x01]);
        let _ = extract_text(&[0x00]);
    }

    #[test]
    fn truncated_streamtyped_never_panics() {
        let blob = streamtyped_blob("Hello there");
        for end in 0..blob.len() {
            let _ = extract_text(&blob[..end]);
        }
    }

    #[test]
    fn printable_scan_recovers_text() {
        let mut blob = vec![0x01, 0x02];
        blob.extend_from_slice(b"NSDictionary");
        blob.push(0x00);
        blob.extend_from_slice(b"see you tomorrow at noon");
        blob.push(0x07);
        assert_eq!(extract_text(&blob), Some("see you tomorrow at noon".to_string()));
    }

    #[test]
    fn zero_timestamp_is_reference_instant() {
        let dt = store_timestamp_to_utc(0);
        assert_eq!(dt.to_rfc3339(), "2001-01-01T00:00:00+00:00");
    }

    #[test]
    fn one_year_of_nanoseconds() {
        // 31_556_952 seconds is one mean Gregorian year; the result lands
        // on 2002-01-01 within a day of calendar variation.
        let dt = store_timestamp_to_utc(31_556_952 * 1_000_000_000);
        assert_eq!(dt.date_naive().year_ce(), (true, 2002));
        assert!(dt.date_naive().ordinal() <= 2);
    }

    #[test]
    fn negative_timestamp_accepted() {
        let dt = store_timestamp_to_utc(-1_000_000_000);
        assert_eq!(dt.to_rfc3339(), "2000-12-31T23:59:59+00:00");
    }

    #[test]
    fn timestamp_round_trip() {
        let raw = 700_000_123_456_789_000i64;
        assert_eq!(utc_to_store_timestamp(store_timestamp_to_utc(raw)), raw);
    }
}
