use core::fmt::{self, Write};

use heapless::{String, Vec};

use crate::{an400::DecoderVariant, snapshot::Snapshot};

/// Fixed `src` tag of lines produced from CAN data.
pub const SOURCE: &str = "can";

/// Upper bound on the number of keys in one record.
pub const MAX_FIELDS: usize = 72;

/// Capacity of one rendered telemetry line, newline included.
pub const LINE_CAPACITY: usize = 2048;

pub const STATUS_CAPACITY: usize = 128;

pub type Line = String<LINE_CAPACITY>;
pub type StatusLine = String<STATUS_CAPACITY>;

const ANALOG_INPUT_KEYS: [&str; 8] = [
    "ai1_v", "ai2_v", "ai3_v", "ai4_v", "ai5_v", "ai6_v", "ai7_v", "ai8_v",
];

const PWM_DUTY_KEYS: [&str; 8] = [
    "pwm_duty_pct_1",
    "pwm_duty_pct_2",
    "pwm_duty_pct_3",
    "pwm_duty_pct_4",
    "pwm_duty_pct_5",
    "pwm_duty_pct_6",
    "pwm_duty_pct_7",
    "pwm_duty_pct_8",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NdjsonError {
    #[error("Record has no room for another field ({0:?})")]
    TooManyFields(&'static str),
    #[error("Rendered line does not fit in the output buffer")]
    LineTooLong,
}

/// A JSON scalar with its rendering rule.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Value {
    Int(i64),
    /// Rendered with exactly `places` decimals. Non-finite values render as
    /// `null`.
    Fixed { value: f32, places: u8 },
    Str(&'static str),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Fixed { value, .. } if !value.is_finite() => f.write_str("null"),
            Self::Fixed { value, places } => write!(f, "{:.*}", *places as usize, value),
            // Keys and tags are plain ASCII identifiers, nothing to escape
            Self::Str(text) => write!(f, "\"{text}\""),
        }
    }
}

/// Ordered key/value mapping for one telemetry line.
///
/// Built first and rendered second so field coverage and precision can be
/// checked without parsing text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(&'static str, Value), MAX_FIELDS>,
}

impl Record {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn push(&mut self, key: &'static str, value: Value) -> Result<(), NdjsonError> {
        self.fields
            .push((key, value))
            .map_err(|_| NdjsonError::TooManyFields(key))
    }

    fn int(&mut self, key: &'static str, value: impl Into<i64>) -> Result<(), NdjsonError> {
        self.push(key, Value::Int(value.into()))
    }

    fn fixed(&mut self, key: &'static str, value: f32, places: u8) -> Result<(), NdjsonError> {
        self.push(key, Value::Fixed { value, places })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value)
    }

    /// Drops every field whose key `keep` rejects, preserving order.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.fields.retain(|(key, _)| keep(key));
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.fields.iter().map(|(key, value)| (*key, value))
    }

    /// One JSON object followed by `\n`.
    pub fn render(&self) -> Result<Line, NdjsonError> {
        let mut line = Line::new();
        writeln!(line, "{self}").map_err(|_| NdjsonError::LineTooLong)?;
        Ok(line)
    }

    /// Mapping with the same keys and the rendered numbers, for host tools.
    #[cfg(feature = "std")]
    pub fn to_json_map(&self) -> serde_json::Map<std::string::String, serde_json::Value> {
        self.iter()
            .map(|(key, value)| {
                let json = match value {
                    Value::Int(value) => serde_json::Value::from(*value),
                    Value::Str(text) => serde_json::Value::from(*text),
                    Value::Fixed { .. } => value
                        .to_string()
                        .parse::<f64>()
                        .map(serde_json::Value::from)
                        .unwrap_or(serde_json::Value::Null),
                };
                (key.to_string(), json)
            })
            .collect()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_char('{')?;

        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_char(',')?;
            }
            write!(f, "\"{key}\":{value}")?;
        }

        f.write_char('}')
    }
}

/// Builds the record for one emitted line.
///
/// `Basic` carries the core engine channels. `Extended` adds every auxiliary
/// channel decoded from the extended message set.
pub fn snapshot_record(
    timestamp_ms: u32,
    pkt: u32,
    node_id: u8,
    variant: DecoderVariant,
    snapshot: &Snapshot,
) -> Result<Record, NdjsonError> {
    let mut r = Record::new();
    let ws = &snapshot.wheel_speed_hz;

    r.int("ts_ms", timestamp_ms)?;
    r.int("pkt", pkt)?;
    r.push("src", Value::Str(SOURCE))?;
    r.int("node_id", node_id)?;

    r.int("rpm", snapshot.rpm)?;
    r.fixed("tps_pct", snapshot.throttle_position_pct, 1)?;
    r.fixed("fot_ms", snapshot.fuel_open_time_ms, 1)?;
    r.fixed("ign_deg", snapshot.ignition_angle_deg, 1)?;
    r.fixed("baro_kpa", snapshot.barometric_pressure_kpa, 2)?;
    r.fixed("map_kpa", snapshot.manifold_pressure_kpa, 2)?;
    r.fixed("lambda", snapshot.lambda, 3)?;
    r.fixed("batt_v", snapshot.battery_voltage, 2)?;
    r.fixed("coolant_c", snapshot.coolant_temp_c, 1)?;
    r.fixed("air_c", snapshot.air_temp_c, 1)?;
    r.fixed("oil_psi", snapshot.oil_pressure_psi, 1)?;
    r.fixed("ws_fl_hz", ws.front_left, 1)?;
    r.fixed("ws_fr_hz", ws.front_right, 1)?;
    r.fixed("ws_bl_hz", ws.rear_left, 1)?;
    r.fixed("ws_br_hz", ws.rear_right, 1)?;

    if variant == DecoderVariant::Extended {
        push_aux(&mut r, snapshot)?;
    }

    Ok(r)
}

fn push_aux(r: &mut Record, snapshot: &Snapshot) -> Result<(), NdjsonError> {
    let aux = &snapshot.aux;

    r.fixed("rpm_rate_rps", aux.rpm_rate_rps, 0)?;
    r.fixed("tps_rate_pct_s", aux.tps_rate_pct_s, 0)?;
    r.fixed("map_rate", aux.map_rate, 0)?;
    r.fixed("maf_load_rate", aux.maf_load_rate, 1)?;
    r.fixed("lambda2", snapshot.lambda2, 3)?;
    r.fixed("lambda_target", snapshot.lambda_target, 3)?;
    r.fixed("therm5_temp", aux.thermistor5_temp, 1)?;
    r.fixed("therm7_temp", aux.thermistor7_temp, 1)?;

    for (key, volts) in ANALOG_INPUT_KEYS.into_iter().zip(aux.analog_input_v) {
        r.fixed(key, volts, 3)?;
    }

    for (key, duty) in PWM_DUTY_KEYS.into_iter().zip(aux.pwm_duty_pct) {
        r.fixed(key, duty, 1)?;
    }

    r.fixed("percent_slip", aux.percent_slip, 1)?;
    r.fixed("driven_wheel_roc", aux.driven_wheel_roc, 1)?;
    r.fixed("traction_desired_pct", aux.traction_desired_pct, 1)?;
    r.fixed("driven_avg_ws_ft_s", aux.driven_avg_ws_ft_s, 1)?;
    r.fixed("nondriven_avg_ws_ft_s", aux.nondriven_avg_ws_ft_s, 1)?;
    r.fixed("ign_comp_deg", aux.ign_comp_deg, 1)?;
    r.fixed("ign_cut_pct", aux.ign_cut_pct, 1)?;
    r.fixed("driven_ws1_ft_s", aux.driven_ws_ft_s[0], 1)?;
    r.fixed("driven_ws2_ft_s", aux.driven_ws_ft_s[1], 1)?;
    r.fixed("nondriven_ws1_ft_s", aux.nondriven_ws_ft_s[0], 1)?;
    r.fixed("nondriven_ws2_ft_s", aux.nondriven_ws_ft_s[1], 1)?;

    r.fixed("fuel_comp_accel_pct", aux.fuel_comp_accel_pct, 1)?;
    r.fixed("fuel_comp_start_pct", aux.fuel_comp_start_pct, 1)?;
    r.fixed("fuel_comp_air_pct", aux.fuel_comp_air_pct, 1)?;
    r.fixed("fuel_comp_coolant_pct", aux.fuel_comp_coolant_pct, 1)?;
    r.fixed("fuel_comp_baro_pct", aux.fuel_comp_baro_pct, 1)?;
    r.fixed("fuel_comp_map_pct", aux.fuel_comp_map_pct, 1)?;

    r.fixed("ign_comp_air_deg", aux.ign_comp_air_deg, 1)?;
    r.fixed("ign_comp_coolant_deg", aux.ign_comp_coolant_deg, 1)?;
    r.fixed("ign_comp_baro_deg", aux.ign_comp_baro_deg, 1)?;
    r.fixed("ign_comp_map_deg", aux.ign_comp_map_deg, 1)
}

/// Emits NDJSON lines with a wrapping 32-bit `pkt` counter. The counter is
/// incremented before each line, so the first line carries 1.
#[derive(Debug, Clone, Copy)]
pub struct NdjsonEncoder {
    pkt: u32,
    node_id: u8,
    variant: DecoderVariant,
}

impl NdjsonEncoder {
    pub const fn new(node_id: u8, variant: DecoderVariant) -> Self {
        Self {
            pkt: 0,
            node_id,
            variant,
        }
    }

    /// Counter of the last line produced, 0 before the first.
    pub fn pkt(&self) -> u32 {
        self.pkt
    }

    /// Renders the snapshot as the next line. `Ok(None)` until a frame has
    /// been decoded into the snapshot; the counter only advances when a line
    /// is produced.
    pub fn encode(&mut self, timestamp_ms: u32, snapshot: &Snapshot) -> Result<Option<Line>, NdjsonError> {
        if !snapshot.has_received_any_frame() {
            return Ok(None);
        }

        let pkt = self.pkt.wrapping_add(1);
        let line =
            snapshot_record(timestamp_ms, pkt, self.node_id, self.variant, snapshot)?.render()?;
        self.pkt = pkt;

        Ok(Some(line))
    }
}

impl Default for NdjsonEncoder {
    fn default() -> Self {
        Self::new(1, DecoderVariant::default())
    }
}

/// A human-readable side-channel line. Always starts with `#` so NDJSON
/// consumers skip it.
pub fn status_line(args: fmt::Arguments<'_>) -> Result<StatusLine, NdjsonError> {
    let mut line = StatusLine::new();
    writeln!(line, "# {args}").map_err(|_| NdjsonError::LineTooLong)?;
    Ok(line)
}
