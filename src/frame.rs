//! Telemetry frame decoding.
//!
//! One UDP datagram carries one frame: an optional prelude line
//! (`msg=<u64>,tm=<u64>,v=<u32>`) followed by metric lines of the form
//! `<name> <payload…> <offset_ms>`. Decoding never panics and never
//! returns an error to the caller: a payload that cannot be decoded
//! produces a [`Packet`] with `error` set and an empty metric list.
//!
//! # UTF-8 requirement
//!
//! Payloads are expected to be UTF-8 text. Invalid UTF-8 is reported as a
//! decode error on the packet; the raw bytes are preserved lossily for
//! diagnostics.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Scalar
// ---------------------------------------------------------------------------

/// A metric value: integer, float, or text.
///
/// Integers are tagged with an `i` suffix on the wire (`25i`); an unsuffixed
/// token that parses as a number is a float; anything else is text (with
/// surrounding double quotes stripped).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Parse a wire scalar token.
    pub fn parse(token: &str) -> Scalar {
        if let Some(digits) = token.strip_suffix('i') {
            if let Ok(n) = digits.parse::<i64>() {
                return Scalar::Int(n);
            }
        }
        if let Ok(f) = token.parse::<f64>() {
            return Scalar::Float(f);
        }
        Scalar::Text(strip_quotes(token).to_owned())
    }
}

/// Strip one pair of surrounding double quotes, if present.
pub fn strip_quotes(s: &str) -> &str {
    let trimmed = s.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    }
}

// ---------------------------------------------------------------------------
// FieldMap: insertion-ordered key -> Scalar mapping
// ---------------------------------------------------------------------------

/// The fields of a structured metric, in wire order.
///
/// Serializes as a JSON object; insertion order is preserved on both
/// serialize and deserialize so archived records round-trip byte-for-byte.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap(Vec<(String, Scalar)>);

impl FieldMap {
    pub fn new() -> FieldMap {
        FieldMap(Vec::new())
    }

    /// Insert a key, replacing the value in place if the key repeats.
    pub fn insert(&mut self, key: String, value: Scalar) {
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Scalar> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (String, Scalar)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Scalar)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (String, Scalar)>>(iter: I) -> FieldMap {
        let mut map = FieldMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl Serialize for FieldMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FieldMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<FieldMap, D::Error> {
        struct FieldMapVisitor;

        impl<'de> Visitor<'de> for FieldMapVisitor {
            type Value = FieldMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of field name to scalar value")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<FieldMap, A::Error> {
                let mut map = FieldMap::new();
                while let Some((key, value)) = access.next_entry::<String, Scalar>()? {
                    map.insert(key, value);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(FieldMapVisitor)
    }
}

// ---------------------------------------------------------------------------
// Metric
// ---------------------------------------------------------------------------

/// Kind-specific payload of a metric, discriminated by a `kind` field on
/// the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricPayload {
    Numeric { value: Scalar },
    Error { error: String },
    Structured { fields: FieldMap },
    Unknown { raw: String },
}

/// One parsed metric line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(flatten)]
    pub payload: MetricPayload,
    /// Signed millisecond offset from the packet's `tm`; MAY be negative
    /// when the metric was captured before the packet was assembled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset_ms: Option<i64>,
    /// Absolute device time in microseconds (`tm + offset_ms * 1000`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_time_us: Option<i64>,
    /// `MM:SS.mmm` rendering of `device_time_us`; filled by enrichment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_time_str: Option<String>,
}

impl Metric {
    fn unknown(name: String, raw: String) -> Metric {
        Metric {
            name,
            payload: MetricPayload::Unknown { raw },
            offset_ms: None,
            device_time_us: None,
            device_time_str: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Prelude and Packet
// ---------------------------------------------------------------------------

/// The leading header line of a frame. Any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prelude {
    #[serde(rename = "msg", skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    /// Base device time in microseconds.
    #[serde(rename = "tm", skip_serializing_if = "Option::is_none")]
    pub base_time_us: Option<u64>,
    #[serde(rename = "v", skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

/// Provenance key for a packet: stable for the packet's lifetime and cheap
/// to carry alongside individual metrics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketId {
    pub msg_id: Option<u64>,
    pub sender: String,
    pub received_at_ms: i64,
}

/// One UDP datagram's worth of telemetry, post-decode.
///
/// Created by [`decode`], mutated only by the enrichment stages, and
/// immutable thereafter as it flows through the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Remote endpoint in `host:port` form.
    pub sender: String,
    /// Wall-clock instant captured when the datagram left the socket.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub received_at: DateTime<Utc>,
    pub prelude: Prelude,
    /// `HH:MM:SS.mmm` local rendering of `received_at`; filled by enrichment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wall_time_str: Option<String>,
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub display_lines: Vec<String>,
    /// Original text, kept for diagnostics only; never serialized.
    #[serde(skip)]
    pub raw: Option<String>,
    /// Decode failure; mutually exclusive with a non-empty metric list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Packet {
    pub fn id(&self) -> PacketId {
        PacketId {
            msg_id: self.prelude.msg_id,
            sender: self.sender.clone(),
            received_at_ms: self.received_at.timestamp_millis(),
        }
    }

    fn empty(sender: &str, received_at: DateTime<Utc>) -> Packet {
        Packet {
            sender: sender.to_owned(),
            received_at,
            prelude: Prelude::default(),
            wall_time_str: None,
            metrics: Vec::new(),
            display_lines: Vec::new(),
            raw: None,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn full_prelude_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)msg=\d+,\s*tm=\d+,\s*v=\d+").expect("prelude regex"))
}

fn msg_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)msg=(\d+)").expect("msg regex"))
}

fn tm_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)tm=(\d+)").expect("tm regex"))
}

fn v_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)v=(\d+)").expect("v regex"))
}

fn error_msg_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"error="([^"]*)""#).expect("error regex"))
}

/// Decode one datagram payload into a [`Packet`].
///
/// Never panics and never fails: undecodable payloads yield a packet with
/// `error` set and no metrics.
pub fn decode(payload: &[u8], sender: &str, received_at: DateTime<Utc>) -> Packet {
    let text = match std::str::from_utf8(payload) {
        Ok(t) => t,
        Err(e) => {
            let mut packet = Packet::empty(sender, received_at);
            packet.raw = Some(String::from_utf8_lossy(payload).into_owned());
            packet.error = Some(format!("payload is not valid UTF-8: {}", e));
            return packet;
        }
    };

    let mut packet = Packet::empty(sender, received_at);
    packet.raw = Some(text.to_owned());

    let mut lines = text.split('\n').map(|l| l.trim_end_matches('\r'));

    // The first line may carry the prelude. A line whose first token
    // contains '=' cannot be a metric line (metric lines start with a bare
    // name), so it is consumed as a prelude even when fields are missing.
    let mut pending_first_metric_line: Option<&str> = None;
    if let Some(first) = lines.next() {
        if is_prelude_line(first) {
            packet.prelude = parse_prelude(first);
        } else {
            pending_first_metric_line = Some(first);
        }
    }

    let base_time_us = packet.prelude.base_time_us;
    for line in pending_first_metric_line.into_iter().chain(lines) {
        if line.trim().is_empty() {
            continue;
        }
        packet.metrics.push(parse_metric_line(line, base_time_us));
    }

    packet
}

fn is_prelude_line(line: &str) -> bool {
    if full_prelude_re().is_match(line) {
        return true;
    }
    line.split_whitespace()
        .next()
        .map_or(false, |tok| tok.contains('='))
}

fn parse_prelude(line: &str) -> Prelude {
    let capture_u64 = |re: &Regex| {
        re.captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
    };
    Prelude {
        msg_id: capture_u64(msg_re()),
        base_time_us: capture_u64(tm_re()),
        version: capture_u64(v_re()).and_then(|v| u32::try_from(v).ok()),
    }
}

/// Parse one metric line. Infallible: lines that do not fit the grammar
/// come back as `Unknown` metrics carrying the raw text.
fn parse_metric_line(line: &str, base_time_us: Option<u64>) -> Metric {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let name = tokens.first().copied().unwrap_or_default().to_owned();

    // <name> <payload…> <offset_ms> needs at least three tokens.
    if tokens.len() < 3 {
        return Metric::unknown(name, line.trim().to_owned());
    }

    let offset_ms: i64 = match tokens[tokens.len() - 1].parse() {
        Ok(v) => v,
        Err(_) => return Metric::unknown(name, line.trim().to_owned()),
    };

    // Payload tokens may contain quoted strings with embedded whitespace;
    // reassemble them with single spaces before classifying.
    let payload_text = tokens[1..tokens.len() - 1].join(" ");

    let payload = if let Some(tail) = payload_text.strip_prefix("v=") {
        MetricPayload::Numeric {
            value: Scalar::parse(tail),
        }
    } else if payload_text.starts_with("error=") {
        let message = match error_msg_re().captures(&payload_text) {
            Some(caps) => caps[1].to_owned(),
            // Unquoted message: take everything after `error=`.
            None => strip_quotes(&payload_text["error=".len()..]).to_owned(),
        };
        MetricPayload::Error { error: message }
    } else {
        match parse_structured_fields(&payload_text) {
            Some(fields) => MetricPayload::Structured { fields },
            None => return Metric::unknown(name, line.trim().to_owned()),
        }
    };

    let device_time_us = base_time_us.map(|base| base as i64 + offset_ms * 1000);
    Metric {
        name,
        payload,
        offset_ms: Some(offset_ms),
        device_time_us,
        device_time_str: None,
    }
}

/// Parse `k=v[,k=v…]` with comma splits suppressed inside double quotes.
/// Returns `None` when no pair parses.
fn parse_structured_fields(payload: &str) -> Option<FieldMap> {
    let mut fields = FieldMap::new();
    for pair in split_outside_quotes(payload, ',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        if let Some((key, value)) = pair.split_once('=') {
            fields.insert(key.trim().to_owned(), Scalar::parse(value.trim()));
        }
    }
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

fn split_outside_quotes(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c == sep && !in_quotes => {
                parts.push(&s[start..i]);
                start = i + sep.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap()
    }

    #[test]
    fn numeric_int_with_prelude() {
        let packet = decode(b"msg=7,tm=9000,v=2\ntemp v=25i 1\n", "10.0.0.1:5000", at());
        assert!(packet.error.is_none());
        assert_eq!(packet.prelude.msg_id, Some(7));
        assert_eq!(packet.prelude.base_time_us, Some(9000));
        assert_eq!(packet.prelude.version, Some(2));
        assert_eq!(packet.metrics.len(), 1);

        let m = &packet.metrics[0];
        assert_eq!(m.name, "temp");
        assert_eq!(
            m.payload,
            MetricPayload::Numeric {
                value: Scalar::Int(25)
            }
        );
        assert_eq!(m.offset_ms, Some(1));
        assert_eq!(m.device_time_us, Some(10_000));
    }

    #[test]
    fn numeric_float_and_string_values() {
        let packet = decode(
            b"msg=1,tm=0,v=1\nfan v=0.35 2\nstate v=\"printing\" 3\nmode v=auto 4\n",
            "10.0.0.1:5000",
            at(),
        );
        assert_eq!(packet.metrics.len(), 3);
        assert_eq!(
            packet.metrics[0].payload,
            MetricPayload::Numeric {
                value: Scalar::Float(0.35)
            }
        );
        assert_eq!(
            packet.metrics[1].payload,
            MetricPayload::Numeric {
                value: Scalar::Text("printing".to_owned())
            }
        );
        assert_eq!(
            packet.metrics[2].payload,
            MetricPayload::Numeric {
                value: Scalar::Text("auto".to_owned())
            }
        );
    }

    #[test]
    fn unsuffixed_integer_token_is_float() {
        let packet = decode(b"msg=1,tm=0,v=1\ntemp v=25 1\n", "10.0.0.1:5000", at());
        assert_eq!(
            packet.metrics[0].payload,
            MetricPayload::Numeric {
                value: Scalar::Float(25.0)
            }
        );
    }

    #[test]
    fn error_line() {
        let packet = decode(
            b"msg=2,tm=1000,v=1\nheater error=\"thermal runaway\" 3\n",
            "10.0.0.1:5000",
            at(),
        );
        let m = &packet.metrics[0];
        assert_eq!(m.name, "heater");
        assert_eq!(
            m.payload,
            MetricPayload::Error {
                error: "thermal runaway".to_owned()
            }
        );
        assert_eq!(m.device_time_us, Some(1_003_000));
    }

    #[test]
    fn structured_with_quoted_spaces() {
        let packet = decode(
            b"msg=1,tm=0,v=1\nnet ip=\"192.168.0.1\",ssid=\"my home\" 5\n",
            "10.0.0.1:5000",
            at(),
        );
        let m = &packet.metrics[0];
        assert_eq!(m.offset_ms, Some(5));
        match &m.payload {
            MetricPayload::Structured { fields } => {
                assert_eq!(
                    fields.get("ip"),
                    Some(&Scalar::Text("192.168.0.1".to_owned()))
                );
                assert_eq!(fields.get("ssid"), Some(&Scalar::Text("my home".to_owned())));
            }
            other => panic!("expected structured payload, got {:?}", other),
        }
    }

    #[test]
    fn structured_field_order_is_wire_order() {
        let packet = decode(
            b"msg=1,tm=0,v=1\nstats z=1i,a=2i,m=3i 0\n",
            "10.0.0.1:5000",
            at(),
        );
        match &packet.metrics[0].payload {
            MetricPayload::Structured { fields } => {
                let keys: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
                assert_eq!(keys, ["z", "a", "m"]);
            }
            other => panic!("expected structured payload, got {:?}", other),
        }
    }

    #[test]
    fn unparseable_offset_becomes_unknown() {
        let packet = decode(b"msg=1,tm=0,v=1\ntemp v=25i later\n", "10.0.0.1:5000", at());
        let m = &packet.metrics[0];
        assert_eq!(m.name, "temp");
        assert_eq!(
            m.payload,
            MetricPayload::Unknown {
                raw: "temp v=25i later".to_owned()
            }
        );
        assert_eq!(m.offset_ms, None);
        assert_eq!(m.device_time_us, None);
    }

    #[test]
    fn missing_prelude_leaves_device_time_absent() {
        let packet = decode(b"temp v=25i 1\n", "10.0.0.1:5000", at());
        assert!(packet.prelude.base_time_us.is_none());
        assert_eq!(packet.metrics.len(), 1);
        assert_eq!(packet.metrics[0].offset_ms, Some(1));
        assert_eq!(packet.metrics[0].device_time_us, None);
    }

    #[test]
    fn partial_prelude_fills_only_present_slots() {
        let packet = decode(b"msg=3, v=1\ntemp v=25i 1\n", "10.0.0.1:5000", at());
        assert_eq!(packet.prelude.msg_id, Some(3));
        assert_eq!(packet.prelude.base_time_us, None);
        assert_eq!(packet.prelude.version, Some(1));
        assert_eq!(packet.metrics.len(), 1);
    }

    #[test]
    fn negative_offset_is_preserved() {
        let packet = decode(b"msg=1,tm=2000000,v=1\nb v=2i -500\n", "10.0.0.1:5000", at());
        let m = &packet.metrics[0];
        assert_eq!(m.offset_ms, Some(-500));
        assert_eq!(m.device_time_us, Some(1_500_000));
    }

    #[test]
    fn invalid_utf8_yields_errored_packet() {
        let packet = decode(&[0x74, 0xff, 0xfe, 0x6d], "10.0.0.1:5000", at());
        assert!(packet.error.is_some());
        assert!(packet.metrics.is_empty());
        assert!(packet.raw.is_some());
    }

    #[test]
    fn blank_lines_are_skipped() {
        let packet = decode(
            b"msg=1,tm=0,v=1\n\ntemp v=1i 0\n\r\nfan v=2i 1\n",
            "10.0.0.1:5000",
            at(),
        );
        assert_eq!(packet.metrics.len(), 2);
    }

    #[test]
    fn decode_is_idempotent() {
        let payload: &[u8] = b"msg=9,tm=500,v=1\ntemp v=21.5 0\nnet ip=\"10.0.0.9\" 2\n";
        let a = decode(payload, "10.0.0.1:5000", at());
        let b = decode(payload, "10.0.0.1:5000", at());
        assert_eq!(a, b);
    }

    #[test]
    fn packet_id_is_derived_from_prelude_sender_and_receive_time() {
        let packet = decode(b"msg=7,tm=9000,v=2\ntemp v=25i 1\n", "10.0.0.1:5000", at());
        let id = packet.id();
        assert_eq!(id.msg_id, Some(7));
        assert_eq!(id.sender, "10.0.0.1:5000");
        assert_eq!(id.received_at_ms, at().timestamp_millis());
    }

    #[test]
    fn packets_without_metrics_still_serialize_list_fields() {
        let packet = decode(b"msg=1,tm=0,v=1\n", "10.0.0.1:5000", at());
        assert!(packet.metrics.is_empty());
        let doc: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&packet).expect("encode"))
                .expect("decode");
        assert_eq!(doc["metrics"], serde_json::json!([]));
        assert_eq!(doc["display_lines"], serde_json::json!([]));
    }

    #[test]
    fn field_map_round_trips_through_json_preserving_order() {
        let fields: FieldMap = [
            ("z".to_owned(), Scalar::Int(1)),
            ("a".to_owned(), Scalar::Text("x y".to_owned())),
        ]
        .into_iter()
        .collect();
        let json = serde_json::to_string(&fields).expect("serialize fields");
        assert_eq!(json, r#"{"z":1,"a":"x y"}"#);
        let back: FieldMap = serde_json::from_str(&json).expect("deserialize fields");
        assert_eq!(back, fields);
    }

    #[test]
    fn scalar_parse_covers_wire_grammar() {
        assert_eq!(Scalar::parse("25i"), Scalar::Int(25));
        assert_eq!(Scalar::parse("-4i"), Scalar::Int(-4));
        assert_eq!(Scalar::parse("1.5"), Scalar::Float(1.5));
        assert_eq!(Scalar::parse("1e3"), Scalar::Float(1000.0));
        assert_eq!(Scalar::parse("\"hi there\""), Scalar::Text("hi there".to_owned()));
        assert_eq!(Scalar::parse("bare"), Scalar::Text("bare".to_owned()));
    }
}
