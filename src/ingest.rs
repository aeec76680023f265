//! Host-side ingestion of the node's serial stream.
//!
//! Accepts NDJSON telemetry lines and the legacy `CAN,...` pass-through
//! lines, skips status output, and keeps a merged view of the latest value of
//! every key. [`RunLog`] records every accepted packet as raw NDJSON and as a
//! fixed-column CSV row.

use std::io::{self, Write};

use log::{debug, warn};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
    an400::{Decoder, DecoderConfig, DecoderVariant, MessageId},
    frame::{parse_csv_line, FrameParseError},
    ndjson::{snapshot_record, NdjsonError},
    sequence::{SequenceEvent, SequenceTracker},
    snapshot::Snapshot,
};

/// A `{` line longer than this without its closing `}` is discarded.
pub const MAX_PARTIAL_LEN: usize = 8192;

/// Node ID reported for lines synthesized from legacy CAN lines
const LEGACY_NODE_ID: u8 = 1;

/// Column order of the per-run CSV. `pi_ts_ms` is the host receive time,
/// every other column is the packet key of the same name.
pub const CSV_COLUMNS: [&str; 20] = [
    "ts_ms", "pi_ts_ms", "pkt", "src", "node_id", "rpm", "tps_pct", "fot_ms", "ign_deg",
    "baro_kpa", "map_kpa", "lambda", "batt_v", "coolant_c", "air_c", "oil_psi", "ws_fl_hz",
    "ws_fr_hz", "ws_bl_hz", "ws_br_hz",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestConfig {
    /// Width of the `pkt` counter the node emits
    pub counter_bits: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { counter_bits: 32 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Malformed telemetry line")]
    Json(#[from] serde_json::Error),
    #[error("Malformed CAN line ({0})")]
    Frame(#[from] FrameParseError),
    #[error("Unable to render a legacy CAN line ({0})")]
    Render(#[from] NdjsonError),
    #[error("Line is neither telemetry nor status ({0:?})")]
    Unrecognized(String),
}

/// What happened to one input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    /// Empty, `#` status or `DBG` debug output
    Status,
    /// Start of a JSON object split across reads; held until the rest arrives
    Partial,
    /// Merged into the latest values
    Packet,
    /// Same `pkt` as the previous line, dropped
    Duplicate,
    /// A legacy CAN line for a frame that carries no telemetry
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestStats {
    pub total_packets: u64,
    /// Packets missing according to `pkt` gaps
    pub dropped: u64,
    pub duplicates: u64,
    pub malformed: u64,
    /// Times the node's counter restarted, e.g. after a reset
    pub restarts: u64,
    pub last_pkt: Option<u64>,
    pub last_host_ts_ms: Option<u64>,
}

/// One NDJSON telemetry object. Every key besides the envelope lands in
/// `fields`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TelemetryLine {
    pub ts_ms: Option<u64>,
    /// Accepted as integer or float
    pub pkt: Option<f64>,
    pub src: Option<String>,
    pub node_id: Option<u64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TelemetryLine {
    pub fn packet_id(&self) -> Option<u64> {
        self.pkt
            .filter(|pkt| pkt.is_finite() && *pkt >= 0.0)
            .map(|pkt| pkt as u64)
    }

    fn into_map(self) -> Map<String, Value> {
        let mut map = Map::new();

        if let Some(ts) = self.ts_ms {
            map.insert("ts_ms".into(), ts.into());
        }
        if let Some(pkt) = self.packet_id() {
            map.insert("pkt".into(), pkt.into());
        }
        if let Some(src) = self.src {
            map.insert("src".into(), src.into());
        }
        if let Some(node_id) = self.node_id {
            map.insert("node_id".into(), node_id.into());
        }

        map.extend(self.fields);
        map
    }
}

/// Keys a legacy CAN line contributes for each message the host decodes.
fn message_keys(message: MessageId) -> &'static [&'static str] {
    match message {
        MessageId::Pe1 => &["rpm", "tps_pct", "fot_ms", "ign_deg"],
        MessageId::Pe2 => &["baro_kpa", "map_kpa", "lambda"],
        MessageId::Pe3 => &["oil_psi"],
        MessageId::Pe5 => &["ws_fr_hz", "ws_fl_hz", "ws_br_hz", "ws_bl_hz"],
        MessageId::Pe6 => &["batt_v", "air_c", "coolant_c"],
        MessageId::Pe9 => &["lambda"],
        _ => &[],
    }
}

pub struct Ingestor {
    tracker: SequenceTracker,
    decoder: Decoder,
    partial: String,
    legacy_pkt: u32,
    last_packet: Map<String, Value>,
    latest: Map<String, Value>,
    stats: IngestStats,
}

impl Ingestor {
    pub fn new(config: IngestConfig) -> Self {
        Self {
            tracker: SequenceTracker::new(config.counter_bits),
            decoder: Decoder::new(DecoderConfig {
                variant: DecoderVariant::Basic,
                ..DecoderConfig::default()
            }),
            partial: String::new(),
            legacy_pkt: 0,
            last_packet: Map::new(),
            latest: Map::new(),
            stats: IngestStats::default(),
        }
    }

    /// Latest value of every key seen so far
    pub fn latest(&self) -> &Map<String, Value> {
        &self.latest
    }

    /// Keys of the most recently accepted packet only, as it would be
    /// recorded in a [`RunLog`]
    pub fn last_packet(&self) -> &Map<String, Value> {
        &self.last_packet
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.latest.get(key).and_then(Value::as_f64)
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Feeds one line read from the serial port. `host_ts_ms` is the local
    /// receive time.
    pub fn ingest_line(&mut self, raw: &str, host_ts_ms: u64) -> Result<LineOutcome, IngestError> {
        let trimmed = raw.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("DBG") {
            if !trimmed.is_empty() {
                debug!("Status: {trimmed}");
            }
            return Ok(LineOutcome::Status);
        }

        // A fresh object means the held one was cut short, not continued
        if !self.partial.is_empty() && trimmed.starts_with('{') {
            warn!("Discarding unterminated line: {:.120}", self.partial);
            self.stats.malformed += 1;
            self.partial.clear();
        }

        let line = if self.partial.is_empty() {
            trimmed.to_owned()
        } else {
            let mut joined = std::mem::take(&mut self.partial);
            joined.push_str(trimmed);
            joined
        };

        if line.starts_with('{') && !line.ends_with('}') {
            return Ok(self.hold_partial(line));
        }

        if line.starts_with("CAN,") {
            return self.ingest_can_line(&line, host_ts_ms);
        }

        match serde_json::from_str::<TelemetryLine>(&line) {
            Ok(telemetry) => Ok(self.handle_packet(telemetry, host_ts_ms)),
            Err(e) if line.starts_with('{') && e.is_eof() => Ok(self.hold_partial(line)),
            Err(e) => {
                warn!("Bad telemetry line: {:.120}", line);
                self.stats.malformed += 1;

                if line.starts_with('{') || line.starts_with('[') {
                    Err(IngestError::Json(e))
                } else {
                    Err(IngestError::Unrecognized(line))
                }
            }
        }
    }

    fn hold_partial(&mut self, line: String) -> LineOutcome {
        if line.len() > MAX_PARTIAL_LEN {
            warn!("Discarding unterminated line of {} bytes", line.len());
            self.stats.malformed += 1;
            return LineOutcome::Status;
        }

        self.partial = line;
        LineOutcome::Partial
    }

    fn ingest_can_line(&mut self, line: &str, host_ts_ms: u64) -> Result<LineOutcome, IngestError> {
        let (ts_ms, frame) = parse_csv_line(line).inspect_err(|e| {
            warn!("Bad CAN line ({e}): {line:.120}");
            self.stats.malformed += 1;
        })?;

        let mut snapshot = Snapshot::new();
        let Some(message) = self.decoder.decode(&frame, &mut snapshot) else {
            return Ok(LineOutcome::Ignored);
        };

        self.legacy_pkt = self.legacy_pkt.wrapping_add(1);
        let record = snapshot_record(
            ts_ms,
            self.legacy_pkt,
            LEGACY_NODE_ID,
            DecoderVariant::Basic,
            &snapshot,
        )?;

        let keys = message_keys(message);
        let mut map = record.to_json_map();
        map.retain(|key, _| {
            matches!(key.as_str(), "ts_ms" | "pkt" | "src" | "node_id") || keys.contains(&key.as_str())
        });

        let telemetry = TelemetryLine::deserialize(Value::Object(map))?;
        Ok(self.handle_packet(telemetry, host_ts_ms))
    }

    fn handle_packet(&mut self, telemetry: TelemetryLine, host_ts_ms: u64) -> LineOutcome {
        if let Some(pkt) = telemetry.packet_id() {
            match self.tracker.observe(pkt as u32) {
                SequenceEvent::Duplicate => {
                    debug!("Duplicate packet {pkt}");
                    self.stats.duplicates += 1;
                    return LineOutcome::Duplicate;
                }
                SequenceEvent::Gap { lost } => {
                    warn!("{lost} packet(s) lost before {pkt}");
                    self.stats.dropped += u64::from(lost);
                }
                SequenceEvent::Stale => {
                    warn!(
                        "Packet counter went back from {:?} to {pkt}, assuming node restart",
                        self.stats.last_pkt
                    );
                    self.stats.restarts += 1;
                    self.tracker.reset();
                    self.tracker.observe(pkt as u32);
                }
                SequenceEvent::First | SequenceEvent::Next => {}
            }

            self.stats.last_pkt = Some(pkt);
        }

        self.stats.total_packets += 1;
        self.stats.last_host_ts_ms = Some(host_ts_ms);
        self.last_packet = telemetry.into_map();
        self.latest
            .extend(self.last_packet.iter().map(|(k, v)| (k.clone(), v.clone())));

        LineOutcome::Packet
    }
}

impl Default for Ingestor {
    fn default() -> Self {
        Self::new(IngestConfig::default())
    }
}

/// Per-run recording of accepted packets: one NDJSON line per packet on
/// `raw` and one [`CSV_COLUMNS`] row on `csv`. Keys a packet lacks are left
/// empty.
pub struct RunLog<R, C> {
    raw: R,
    csv: C,
    rows: u64,
}

impl<R: Write, C: Write> RunLog<R, C> {
    /// Starts a run, writing the CSV header.
    pub fn new(raw: R, mut csv: C) -> io::Result<Self> {
        writeln!(csv, "{}", CSV_COLUMNS.join(","))?;
        Ok(Self { raw, csv, rows: 0 })
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn record(&mut self, packet: &Map<String, Value>, host_ts_ms: u64) -> io::Result<()> {
        serde_json::to_writer(&mut self.raw, packet)?;
        self.raw.write_all(b"\n")?;

        let row = CSV_COLUMNS
            .iter()
            .map(|column| match *column {
                "pi_ts_ms" => host_ts_ms.to_string(),
                key => packet.get(key).map(csv_cell).unwrap_or_default(),
            })
            .collect::<Vec<_>>()
            .join(",");
        writeln!(self.csv, "{row}")?;

        self.rows += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.raw.flush()?;
        self.csv.flush()
    }

    pub fn into_inner(self) -> (R, C) {
        (self.raw, self.csv)
    }
}

fn csv_cell(value: &Value) -> String {
    let text = match value {
        Value::Null => return String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };

    if text.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn line(pkt: u64, rpm: u64) -> String {
        format!(
            "{{\"ts_ms\":{},\"pkt\":{pkt},\"src\":\"can\",\"node_id\":1,\"rpm\":{rpm},\"map_kpa\":98.30}}\n",
            pkt * 50
        )
    }

    #[test]
    fn status_lines_are_ignored() {
        let mut ingestor = Ingestor::default();

        assert_eq!(ingestor.ingest_line("# CAN init ok\n", 0).unwrap(), LineOutcome::Status);
        assert_eq!(ingestor.ingest_line("DBG rx=3", 0).unwrap(), LineOutcome::Status);
        assert_eq!(ingestor.ingest_line("   \r\n", 0).unwrap(), LineOutcome::Status);

        assert!(ingestor.latest().is_empty());
        assert_eq!(ingestor.stats().total_packets, 0);
    }

    #[test]
    fn telemetry_is_merged() {
        let mut ingestor = Ingestor::default();

        ingestor.ingest_line(&line(0, 5000), 10).unwrap();
        ingestor
            .ingest_line("{\"pkt\":1,\"oil_psi\":52.1}", 20)
            .unwrap();

        assert_eq!(ingestor.latest()["rpm"], json!(5000));
        assert!((ingestor.get_f64("oil_psi").unwrap() - 52.1).abs() < 1e-9);
        assert!((ingestor.get_f64("map_kpa").unwrap() - 98.3).abs() < 1e-9);
        assert_eq!(ingestor.latest()["src"], json!("can"));

        let stats = ingestor.stats();
        assert_eq!(stats.total_packets, 2);
        assert_eq!(stats.last_pkt, Some(1));
        assert_eq!(stats.last_host_ts_ms, Some(20));
    }

    #[test]
    fn gaps_and_duplicates() {
        let mut ingestor = Ingestor::default();

        ingestor.ingest_line(&line(10, 1), 0).unwrap();
        assert_eq!(ingestor.ingest_line(&line(10, 2), 0).unwrap(), LineOutcome::Duplicate);
        ingestor.ingest_line(&line(14, 3), 0).unwrap();

        let stats = ingestor.stats();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.total_packets, 2);
        assert_eq!(ingestor.latest()["rpm"], json!(3));
    }

    #[test]
    fn sixteen_bit_counters_wrap() {
        let mut ingestor = Ingestor::new(IngestConfig { counter_bits: 16 });

        for pkt in [65534, 65535, 0, 1] {
            ingestor.ingest_line(&line(pkt, 1), 0).unwrap();
        }

        assert_eq!(ingestor.stats().dropped, 0);
        assert_eq!(ingestor.stats().restarts, 0);
    }

    #[test]
    fn node_restart_is_not_loss() {
        let mut ingestor = Ingestor::default();

        ingestor.ingest_line(&line(5000, 1), 0).unwrap();
        ingestor.ingest_line(&line(0, 1), 0).unwrap();
        ingestor.ingest_line(&line(1, 1), 0).unwrap();

        let stats = ingestor.stats();
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.total_packets, 3);
    }

    #[test]
    fn split_lines_are_joined() {
        let mut ingestor = Ingestor::default();

        assert_eq!(
            ingestor.ingest_line("{\"pkt\":3,\"rpm\":", 0).unwrap(),
            LineOutcome::Partial
        );
        assert_eq!(ingestor.ingest_line("4100}", 0).unwrap(), LineOutcome::Packet);
        assert_eq!(ingestor.latest()["rpm"], json!(4100));
    }

    #[test]
    fn cut_off_line_does_not_swallow_the_next() {
        let mut ingestor = Ingestor::default();

        assert_eq!(
            ingestor
                .ingest_line("{\"ts_ms\":0,\"pkt\":3,\"rpm\":50", 0)
                .unwrap(),
            LineOutcome::Partial
        );
        assert_eq!(ingestor.ingest_line(&line(4, 5000), 50).unwrap(), LineOutcome::Packet);

        assert_eq!(ingestor.latest()["rpm"], json!(5000));
        assert_eq!(ingestor.stats().malformed, 1);
        assert_eq!(ingestor.stats().last_pkt, Some(4));
    }

    #[test]
    fn run_log_writes_fixed_columns() {
        let mut ingestor = Ingestor::default();
        let mut log = RunLog::new(Vec::new(), Vec::new()).unwrap();

        let lines = [
            (line(1, 5000), 1_700),
            ("{\"pkt\":2,\"oil_psi\":52.1}".to_owned(), 1_750),
        ];
        for (text, host_ts) in lines {
            assert_eq!(ingestor.ingest_line(&text, host_ts).unwrap(), LineOutcome::Packet);
            log.record(ingestor.last_packet(), host_ts).unwrap();
        }
        assert_eq!(log.rows(), 2);

        let (raw, csv) = log.into_inner();
        let raw = String::from_utf8(raw).unwrap();
        let csv = String::from_utf8(csv).unwrap();
        let rows: Vec<&str> = csv.lines().collect();

        assert_eq!(raw.lines().count(), 2);
        let first: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(first["rpm"], json!(5000));

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], CSV_COLUMNS.join(","));
        assert_eq!(rows[1], "50,1700,1,can,1,5000,,,,,98.3,,,,,,,,,");
        // Only the second packet's own keys, not the merged view
        assert_eq!(rows[2], ",1750,2,,,,,,,,,,,,,52.1,,,,");
    }

    #[test]
    fn csv_cells_are_quoted_when_needed() {
        assert_eq!(csv_cell(&json!("can")), "can");
        assert_eq!(csv_cell(&json!("a,b")), "\"a,b\"");
        assert_eq!(csv_cell(&json!(null)), "");
        assert_eq!(csv_cell(&json!(12.0)), "12.0");
    }

    #[test]
    fn garbage_is_reported() {
        let mut ingestor = Ingestor::default();

        assert!(matches!(
            ingestor.ingest_line("hello", 0),
            Err(IngestError::Unrecognized(_))
        ));
        assert!(matches!(
            ingestor.ingest_line("{\"rpm\": nope}", 0),
            Err(IngestError::Json(_))
        ));
        assert!(matches!(
            ingestor.ingest_line("CAN,1,zz,1,8,0,0,0,0,0,0,0,0", 0),
            Err(IngestError::Frame(_))
        ));
        assert_eq!(ingestor.stats().malformed, 3);
    }

    #[test]
    fn legacy_can_lines() {
        let mut ingestor = Ingestor::default();

        let outcome = ingestor
            .ingest_line("CAN,123456,CFFF048,1,8,136,19,0,0,22,0,120,0", 7)
            .unwrap();
        assert_eq!(outcome, LineOutcome::Packet);

        let latest = ingestor.latest();
        assert_eq!(latest["ts_ms"], json!(123456));
        assert_eq!(latest["pkt"], json!(1));
        assert_eq!(latest["rpm"], json!(5000));
        assert_eq!(latest["fot_ms"], json!(2.2));
        assert_eq!(latest["ign_deg"], json!(12.0));
        assert!(!latest.contains_key("map_kpa"));

        // Lambda from PE2 with the kPa flag set
        ingestor
            .ingest_line("CAN,123500,CFFF148,1,8,16,39,0,0,98,0,1,0", 8)
            .unwrap();
        assert_eq!(ingestor.get_f64("lambda"), Some(0.98));
        assert_eq!(ingestor.get_f64("baro_kpa"), Some(100.0));
        assert_eq!(ingestor.get_f64("rpm"), Some(5000.0));
    }

    #[test]
    fn legacy_lines_for_other_traffic() {
        let mut ingestor = Ingestor::default();

        assert_eq!(
            ingestor
                .ingest_line("CAN,1,123,0,8,0,0,0,0,0,0,0,0", 0)
                .unwrap(),
            LineOutcome::Ignored
        );
        assert_eq!(
            ingestor
                .ingest_line("CAN,1,CFFF948,1,8,0,0,0,0,0,0,0,0", 0)
                .unwrap(),
            LineOutcome::Ignored
        );
        assert!(ingestor.latest().is_empty());
    }
}
