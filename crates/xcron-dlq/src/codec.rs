//! DLQ message codec (module C8): builds a DLQ-bound record that preserves
//! original-topic provenance across multiple retry hops, and parses that
//! provenance back into a metadata struct for stats/logging.
//!
//! Grounded on the teacher's `rdkafka` header usage throughout
//! `crates/ingress-rpc`/`crates/builder` (`FutureRecord`, `BorrowedMessage`),
//! generalized to the seven-header wire format this system specifies rather
//! than a serialized envelope.

use chrono::{DateTime, Utc};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use serde::Serialize;

pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
pub const HEADER_ORIGINAL_TOPIC: &str = "x-original-topic";
pub const HEADER_ORIGINAL_PARTITION: &str = "x-original-partition";
pub const HEADER_ORIGINAL_OFFSET: &str = "x-original-offset";
pub const HEADER_FIRST_FAIL_TIME: &str = "x-first-fail-time";
pub const HEADER_LAST_FAIL_TIME: &str = "x-last-fail-time";
pub const HEADER_FAILURE_REASON: &str = "x-failure-reason";

const RESERVED_HEADERS: [&str; 7] = [
    HEADER_RETRY_COUNT,
    HEADER_ORIGINAL_TOPIC,
    HEADER_ORIGINAL_PARTITION,
    HEADER_ORIGINAL_OFFSET,
    HEADER_FIRST_FAIL_TIME,
    HEADER_LAST_FAIL_TIME,
    HEADER_FAILURE_REASON,
];

const TRUNCATE_LIMIT: usize = 1024;
const TRUNCATE_SUFFIX: &str = "...(truncated)";

fn header_str<'a, H: Headers>(headers: Option<&'a H>, key: &str) -> Option<&'a str> {
    let headers = headers?;
    for idx in 0..headers.count() {
        let header = headers.get(idx);
        if header.key == key {
            return header.value.and_then(|v| std::str::from_utf8(v).ok());
        }
    }
    None
}

/// Resolved provenance: the topic/partition/offset a message's failure
/// should be attributed to, following multi-hop-preserves-origin rules.
#[derive(Debug, Clone)]
struct Origin {
    topic: String,
    partition: i32,
    offset: i64,
}

fn resolve_origin(msg: &impl Message) -> Origin {
    let headers = msg.headers();
    let topic = header_str(headers, HEADER_ORIGINAL_TOPIC)
        .map(str::to_string)
        .unwrap_or_else(|| msg.topic().to_string());
    let partition = header_str(headers, HEADER_ORIGINAL_PARTITION)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| msg.partition());
    let offset = header_str(headers, HEADER_ORIGINAL_OFFSET)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| msg.offset());
    Origin { topic, partition, offset }
}

fn resolve_first_fail_time(msg: &impl Message) -> DateTime<Utc> {
    header_str(msg.headers(), HEADER_FIRST_FAIL_TIME)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// Truncates `reason` to 1024 bytes, appending `...(truncated)` when it
/// was cut. Operates on char boundaries so the result is valid UTF-8.
pub fn truncate_reason(reason: &str) -> String {
    if reason.len() <= TRUNCATE_LIMIT {
        return reason.to_string();
    }
    let mut end = TRUNCATE_LIMIT;
    while end > 0 && !reason.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &reason[..end], TRUNCATE_SUFFIX)
}

/// `err.Error()` truncated to 1024 bytes with the `...(truncated)` suffix;
/// `None` maps to an empty string. Callers may substitute their own
/// formatter (e.g. to keep full text in a private network).
pub fn default_reason_formatter(err: Option<&anyhow::Error>) -> String {
    match err {
        Some(err) => truncate_reason(&err.to_string()),
        None => String::new(),
    }
}

/// A DLQ-bound (or retry-topic-bound) record. Borrows the original
/// message's key/value payload by reference rather than copying it, per
/// spec; only the headers are newly built.
#[derive(Debug)]
pub struct DlqRecord<'a> {
    pub topic: String,
    pub key: Option<&'a [u8]>,
    pub payload: Option<&'a [u8]>,
    pub headers: OwnedHeaders,
}

/// Builds the DLQ-bound message for `original`, preserving provenance and
/// copying all non-reserved headers verbatim (§4.7).
pub fn build_dlq_message<'a>(
    original: &'a (impl Message + 'a),
    dlq_topic: &str,
    reason: &str,
    retry_count: u64,
) -> DlqRecord<'a> {
    let origin = resolve_origin(original);
    let first_fail_time = resolve_first_fail_time(original);
    let now = Utc::now();

    let mut headers = OwnedHeaders::new()
        .insert(Header {
            key: HEADER_ORIGINAL_TOPIC,
            value: Some(origin.topic.as_bytes()),
        })
        .insert(Header {
            key: HEADER_ORIGINAL_PARTITION,
            value: Some(origin.partition.to_string().as_bytes()),
        })
        .insert(Header {
            key: HEADER_ORIGINAL_OFFSET,
            value: Some(origin.offset.to_string().as_bytes()),
        })
        .insert(Header {
            key: HEADER_RETRY_COUNT,
            value: Some(retry_count.to_string().as_bytes()),
        })
        .insert(Header {
            key: HEADER_FAILURE_REASON,
            value: Some(truncate_reason(reason).as_bytes()),
        })
        .insert(Header {
            key: HEADER_FIRST_FAIL_TIME,
            value: Some(first_fail_time.to_rfc3339().as_bytes()),
        })
        .insert(Header {
            key: HEADER_LAST_FAIL_TIME,
            value: Some(now.to_rfc3339().as_bytes()),
        });

    if let Some(original_headers) = original.headers() {
        for idx in 0..original_headers.count() {
            let header = original_headers.get(idx);
            if RESERVED_HEADERS.contains(&header.key) {
                continue;
            }
            headers = headers.insert(Header {
                key: header.key,
                value: header.value,
            });
        }
    }

    DlqRecord {
        topic: dlq_topic.to_string(),
        key: original.key(),
        payload: original.payload(),
        headers,
    }
}

/// Owned provenance/failure summary parsed back out of a message, used by
/// DLQ statistics and logging. Malformed integer/time headers fall back to
/// the message's own coordinates/now, same as `build_dlq_message`.
#[derive(Debug, Clone, Serialize)]
pub struct DlqMetadata {
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    pub failure_reason: String,
    pub failure_count: u64,
    pub first_fail_time: DateTime<Utc>,
    pub last_fail_time: DateTime<Utc>,
}

pub fn build_dlq_metadata(msg: &impl Message, reason: &str, retry_count: u64) -> DlqMetadata {
    let origin = resolve_origin(msg);
    let first_fail_time = resolve_first_fail_time(msg);
    DlqMetadata {
        original_topic: origin.topic,
        original_partition: origin.partition,
        original_offset: origin.offset,
        failure_reason: truncate_reason(reason),
        failure_count: retry_count + 1,
        first_fail_time,
        last_fail_time: Utc::now(),
    }
}

/// Builds the header set for a retry-topic redelivery: increments
/// `x-retry-count`, refreshes `x-last-fail-time`/`x-failure-reason`, and on
/// the first failure (count becomes 1) additionally stamps the origin and
/// `x-first-fail-time` so later hops can recover them.
pub fn update_retry_headers(msg: &impl Message, reason: &str) -> OwnedHeaders {
    let previous_count = header_str(msg.headers(), HEADER_RETRY_COUNT)
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    let new_count = previous_count + 1;

    let mut headers = OwnedHeaders::new()
        .insert(Header {
            key: HEADER_RETRY_COUNT,
            value: Some(new_count.to_string().as_bytes()),
        })
        .insert(Header {
            key: HEADER_FAILURE_REASON,
            value: Some(truncate_reason(reason).as_bytes()),
        })
        .insert(Header {
            key: HEADER_LAST_FAIL_TIME,
            value: Some(Utc::now().to_rfc3339().as_bytes()),
        });

    let origin = resolve_origin(msg);
    let first_fail_time = resolve_first_fail_time(msg);
    headers = headers
        .insert(Header {
            key: HEADER_ORIGINAL_TOPIC,
            value: Some(origin.topic.as_bytes()),
        })
        .insert(Header {
            key: HEADER_ORIGINAL_PARTITION,
            value: Some(origin.partition.to_string().as_bytes()),
        })
        .insert(Header {
            key: HEADER_ORIGINAL_OFFSET,
            value: Some(origin.offset.to_string().as_bytes()),
        })
        .insert(Header {
            key: HEADER_FIRST_FAIL_TIME,
            value: Some(first_fail_time.to_rfc3339().as_bytes()),
        });

    if let Some(original_headers) = msg.headers() {
        for idx in 0..original_headers.count() {
            let header = original_headers.get(idx);
            if RESERVED_HEADERS.contains(&header.key) {
                continue;
            }
            headers = headers.insert(Header {
                key: header.key,
                value: header.value,
            });
        }
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::OwnedMessage;

    fn message_with_headers(
        topic: &str,
        partition: i32,
        offset: i64,
        headers: Option<OwnedHeaders>,
    ) -> OwnedMessage {
        OwnedMessage::new(
            Some(b"payload".to_vec()),
            Some(b"key".to_vec()),
            topic.to_string(),
            rdkafka::Timestamp::now(),
            partition,
            offset,
            headers,
        )
    }

    #[test]
    fn truncate_reason_leaves_short_strings_untouched() {
        assert_eq!(truncate_reason("boom"), "boom");
    }

    #[test]
    fn truncate_reason_appends_suffix_past_limit() {
        let long = "x".repeat(2000);
        let truncated = truncate_reason(&long);
        assert_eq!(truncated.len(), TRUNCATE_LIMIT + TRUNCATE_SUFFIX.len());
        assert!(truncated.ends_with(TRUNCATE_SUFFIX));
    }

    #[test]
    fn default_reason_formatter_handles_none() {
        assert_eq!(default_reason_formatter(None), "");
    }

    #[test]
    fn dlq_message_preserves_origin_across_multi_hop() {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: HEADER_ORIGINAL_TOPIC,
                value: Some(b"orders".as_slice()),
            })
            .insert(Header {
                key: HEADER_ORIGINAL_PARTITION,
                value: Some(b"2".as_slice()),
            })
            .insert(Header {
                key: HEADER_ORIGINAL_OFFSET,
                value: Some(b"200".as_slice()),
            })
            .insert(Header {
                key: HEADER_FIRST_FAIL_TIME,
                value: Some(b"2024-01-01T00:00:00Z".as_slice()),
            });
        let msg = message_with_headers("retry-topic", 0, 50, Some(headers));

        let dlq = build_dlq_message(&msg, "orders.dlq", "handler exploded", 5);
        assert_eq!(dlq.topic, "orders.dlq");

        let rebuilt = header_str(Some(&dlq.headers.as_borrowed()), HEADER_ORIGINAL_TOPIC);
        assert_eq!(rebuilt, Some("orders"));
    }

    #[test]
    fn dlq_metadata_falls_back_to_own_coordinates_without_origin_headers() {
        let msg = message_with_headers("orders", 3, 42, None);
        let meta = build_dlq_metadata(&msg, "boom", 0);
        assert_eq!(meta.original_topic, "orders");
        assert_eq!(meta.original_partition, 3);
        assert_eq!(meta.original_offset, 42);
        assert_eq!(meta.failure_count, 1);
    }

    #[test]
    fn update_retry_headers_increments_count_and_stamps_origin_on_first_failure() {
        let msg = message_with_headers("orders", 1, 10, None);
        let headers = update_retry_headers(&msg, "transient error");
        assert_eq!(header_str(Some(&headers.as_borrowed()), HEADER_RETRY_COUNT), Some("1"));
        assert_eq!(header_str(Some(&headers.as_borrowed()), HEADER_ORIGINAL_TOPIC), Some("orders"));
    }

    #[test]
    fn malformed_retry_count_header_treated_as_zero() {
        let headers = OwnedHeaders::new().insert(Header {
            key: HEADER_RETRY_COUNT,
            value: Some(b"not-a-number".as_slice()),
        });
        let msg = message_with_headers("orders", 0, 0, Some(headers));
        let updated = update_retry_headers(&msg, "boom");
        assert_eq!(header_str(Some(&updated.as_borrowed()), HEADER_RETRY_COUNT), Some("1"));
    }
}
