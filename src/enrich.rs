//! Per-packet enrichment stages.
//!
//! Three pure stages applied in order: sort metrics by device time, format
//! time strings, build display lines. Given the same input packet
//! (including `received_at`), the output is bit-identical.

use crate::frame::{Metric, MetricPayload, Packet, Scalar};
use chrono::{Local, Timelike};

/// Placeholder shown in the device-time column when a metric carries no
/// device time; fixed width keeps the columns aligned.
const NO_DEVICE_TIME: &str = "--:--.---";

/// Apply all three enrichment stages to a packet.
pub fn enrich(packet: &mut Packet) {
    sort_metrics(&mut packet.metrics);
    format_times(packet);
    build_display_lines(packet);
}

// ---------------------------------------------------------------------------
// Stage 1: sort
// ---------------------------------------------------------------------------

/// Stable sort by `device_time_us` ascending; metrics without a device time
/// sort last and keep their input order, as do ties.
pub fn sort_metrics(metrics: &mut [Metric]) {
    metrics.sort_by_key(|m| (m.device_time_us.is_none(), m.device_time_us));
}

// ---------------------------------------------------------------------------
// Stage 2: time formatting
// ---------------------------------------------------------------------------

/// Fill `wall_time_str` on the packet and `device_time_str` on each metric.
pub fn format_times(packet: &mut Packet) {
    let local = packet.received_at.with_timezone(&Local);
    packet.wall_time_str = Some(format!(
        "{:02}:{:02}:{:02}.{:03}",
        local.hour(),
        local.minute(),
        local.second(),
        packet.received_at.timestamp_subsec_millis()
    ));
    for metric in &mut packet.metrics {
        metric.device_time_str = metric.device_time_us.map(device_time_string);
    }
}

/// Render absolute device microseconds as `MM:SS.mmm`.
///
/// Negative device times (a large negative offset against a small `tm`)
/// render with a leading `-`.
pub fn device_time_string(us: i64) -> String {
    let total_ms = us.abs() / 1000;
    let minutes = total_ms / 60_000;
    let seconds = (total_ms / 1000) % 60;
    let millis = total_ms % 1000;
    format!(
        "{}{:02}:{:02}.{:03}",
        if us < 0 { "-" } else { "" },
        minutes,
        seconds,
        millis
    )
}

// ---------------------------------------------------------------------------
// Stage 3: display lines
// ---------------------------------------------------------------------------

/// Produce one display line per metric:
/// `[<wall> | <dev>] <name padded to 20> = <value>`.
pub fn build_display_lines(packet: &mut Packet) {
    let wall = packet.wall_time_str.as_deref().unwrap_or(NO_DEVICE_TIME);
    packet.display_lines = packet
        .metrics
        .iter()
        .map(|m| {
            let dev = m.device_time_str.as_deref().unwrap_or(NO_DEVICE_TIME);
            format!("[{} | {}] {:<20} = {}", wall, dev, m.name, render_value(&m.payload))
        })
        .collect();
}

/// Render a metric payload for display.
pub fn render_value(payload: &MetricPayload) -> String {
    match payload {
        MetricPayload::Numeric { value } => render_scalar(value),
        MetricPayload::Error { error } => format!("ERROR: {}", error),
        MetricPayload::Structured { fields } => fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, render_scalar(v)))
            .collect::<Vec<_>>()
            .join(", "),
        MetricPayload::Unknown { raw } => raw.clone(),
    }
}

fn render_scalar(value: &Scalar) -> String {
    match value {
        Scalar::Int(n) => n.to_string(),
        Scalar::Float(f) => format!("{:.3}", f),
        Scalar::Text(s) => s.clone(),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode;
    use chrono::{TimeZone, Utc};

    fn at() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap()
    }

    #[test]
    fn metrics_sort_by_device_time_with_absent_last() {
        let mut packet = decode(
            b"msg=1,tm=10000,v=1\nlate v=1i 5\nearly v=2i -5\nuntimed v=3i x\nmid v=4i 0\n",
            "10.0.0.1:5000",
            at(),
        );
        enrich(&mut packet);
        let names: Vec<&str> = packet.metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["early", "mid", "late", "untimed"]);
        let mut last = i64::MIN;
        for m in packet.metrics.iter().filter(|m| m.device_time_us.is_some()) {
            let us = m.device_time_us.expect("timed metric");
            assert!(us >= last, "device times must be non-decreasing");
            last = us;
        }
    }

    #[test]
    fn ties_and_untimed_metrics_keep_input_order() {
        let mut packet = decode(
            b"msg=1,tm=1000,v=1\na v=1i 0\nb v=2i 0\nc v=3i x\nd v=4i y\n",
            "10.0.0.1:5000",
            at(),
        );
        enrich(&mut packet);
        let names: Vec<&str> = packet.metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c", "d"]);
    }

    #[test]
    fn device_time_string_formats_minutes_seconds_millis() {
        assert_eq!(device_time_string(10_000), "00:00.010");
        assert_eq!(device_time_string(1_003_000), "00:01.003");
        assert_eq!(device_time_string(61_500_000), "01:01.500");
        assert_eq!(device_time_string(-499_000), "-00:00.499");
    }

    #[test]
    fn scenario_single_numeric() {
        let mut packet = decode(b"msg=7,tm=9000,v=2\ntemp v=25i 1\n", "10.0.0.1:5000", at());
        enrich(&mut packet);
        let m = &packet.metrics[0];
        assert_eq!(m.device_time_us, Some(10_000));
        assert_eq!(m.device_time_str.as_deref(), Some("00:00.010"));
        assert!(packet.wall_time_str.is_some());
        assert_eq!(packet.display_lines.len(), 1);
    }

    #[test]
    fn enrichment_is_pure() {
        let payload: &[u8] =
            b"msg=1,tm=5000,v=1\ntemp v=21.5 0\nheater error=\"overrun\" 2\nnet ip=\"10.0.0.9\" 1\n";
        let mut a = decode(payload, "10.0.0.1:5000", at());
        let mut b = decode(payload, "10.0.0.1:5000", at());
        enrich(&mut a);
        enrich(&mut b);
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).expect("serialize"),
            serde_json::to_string(&b).expect("serialize")
        );
    }

    #[test]
    fn display_lines_render_each_kind() {
        let mut packet = decode(
            b"msg=1,tm=0,v=1\ncount v=3i 0\nratio v=0.5 1\nstate v=\"idle\" 2\nheater error=\"bad\" 3\nnet ip=\"10.0.0.9\",up=1i 4\njunk v=1i x\n",
            "10.0.0.1:5000",
            at(),
        );
        enrich(&mut packet);
        let by_name = |name: &str| {
            packet
                .display_lines
                .iter()
                .find(|l| l.contains(&format!("{:<20}", name)))
                .unwrap_or_else(|| panic!("no display line for {}", name))
        };
        assert!(by_name("count").ends_with("= 3"));
        assert!(by_name("ratio").ends_with("= 0.500"));
        assert!(by_name("state").ends_with("= idle"));
        assert!(by_name("heater").ends_with("= ERROR: bad"));
        assert!(by_name("net").ends_with("= ip=10.0.0.9, up=1"));
        assert!(by_name("junk").contains(NO_DEVICE_TIME));
    }

    #[test]
    fn wall_time_str_has_fixed_width() {
        let mut packet = decode(b"msg=1,tm=0,v=1\ntemp v=1i 0\n", "10.0.0.1:5000", at());
        enrich(&mut packet);
        let wall = packet.wall_time_str.expect("wall time set");
        assert_eq!(wall.len(), "HH:MM:SS.mmm".len());
        assert_eq!(&wall[2..3], ":");
        assert_eq!(&wall[8..9], ".");
    }
}
