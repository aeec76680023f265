use crate::{
    codec::{quantize_i16, quantize_u16},
    snapshot::{Snapshot, WheelSpeeds},
};

pub const PREAMBLE: u8 = 0xAA;
pub const VERSION: u8 = 0x01;

const HEADER_LEN: usize = 4;
pub const PAYLOAD_LEN: usize = 34;
pub const ENVELOPE_LEN: usize = HEADER_LEN + PAYLOAD_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EnvelopeError {
    #[error("Datagram is not 38 bytes long ({0:?})")]
    Length(usize),
    #[error("Datagram does not start with the telemetry preamble ({0:#04x})")]
    Preamble(u8),
    #[error("Unsupported protocol version ({0:?})")]
    Version(u8),
    #[error("Declared payload length does not match ({0:?})")]
    PayloadLength(u8),
}

/// Telemetry carried by the framed datagram format.
///
/// Header: preamble `0xAA`, version `0x01`, 8-bit sequence, payload length 34.
/// Payload (little endian): u32 timestamp, u16 rpm, then tps i16 (0.1 %),
/// fot u16 (0.1 ms), ign i16 (0.1 deg), map u16 (0.01 kPa), baro u16
/// (0.01 kPa), lambda u16 (0.001), oil i16 (0.1 psi), battery u16 (0.01 V),
/// coolant i16 (0.1 C), air i16 (0.1 C) and four wheel speeds u16 (0.1 Hz).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FramedTelemetry {
    pub sequence: u8,
    pub timestamp_ms: u32,
    pub rpm: u16,
    pub throttle_position_pct: f32,
    pub fuel_open_time_ms: f32,
    pub ignition_angle_deg: f32,
    pub manifold_pressure_kpa: f32,
    pub barometric_pressure_kpa: f32,
    pub lambda: f32,
    pub oil_pressure_psi: f32,
    pub battery_voltage: f32,
    pub coolant_temp_c: f32,
    pub air_temp_c: f32,
    pub wheel_speed_hz: WheelSpeeds,
}

/// Little-endian payload writer over a fixed buffer
struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn u16(&mut self, value: f32, scale: f32) {
        self.put(&quantize_u16(value, scale).to_le_bytes());
    }

    fn i16(&mut self, value: f32, scale: f32) {
        self.put(&quantize_i16(value, scale).to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u16(&mut self, scale: f32) -> f32 {
        f32::from(u16::from_le_bytes(self.take())) * scale
    }

    fn i16(&mut self, scale: f32) -> f32 {
        f32::from(i16::from_le_bytes(self.take())) * scale
    }
}

impl FramedTelemetry {
    pub fn from_snapshot(sequence: u8, timestamp_ms: u32, snapshot: &Snapshot) -> Self {
        Self {
            sequence,
            timestamp_ms,
            rpm: snapshot.rpm,
            throttle_position_pct: snapshot.throttle_position_pct,
            fuel_open_time_ms: snapshot.fuel_open_time_ms,
            ignition_angle_deg: snapshot.ignition_angle_deg,
            manifold_pressure_kpa: snapshot.manifold_pressure_kpa,
            barometric_pressure_kpa: snapshot.barometric_pressure_kpa,
            lambda: snapshot.lambda,
            oil_pressure_psi: snapshot.oil_pressure_psi,
            battery_voltage: snapshot.battery_voltage,
            coolant_temp_c: snapshot.coolant_temp_c,
            air_temp_c: snapshot.air_temp_c,
            wheel_speed_hz: snapshot.wheel_speed_hz,
        }
    }

    pub fn to_bytes(&self) -> [u8; ENVELOPE_LEN] {
        let mut bytes = [0u8; ENVELOPE_LEN];
        bytes[..HEADER_LEN].copy_from_slice(&[PREAMBLE, VERSION, self.sequence, PAYLOAD_LEN as u8]);

        let mut w = Writer {
            buf: &mut bytes[HEADER_LEN..],
            pos: 0,
        };
        let ws = &self.wheel_speed_hz;

        w.put(&self.timestamp_ms.to_le_bytes());
        w.put(&self.rpm.to_le_bytes());
        w.i16(self.throttle_position_pct, 0.1);
        w.u16(self.fuel_open_time_ms, 0.1);
        w.i16(self.ignition_angle_deg, 0.1);
        w.u16(self.manifold_pressure_kpa, 0.01);
        w.u16(self.barometric_pressure_kpa, 0.01);
        w.u16(self.lambda, 0.001);
        w.i16(self.oil_pressure_psi, 0.1);
        w.u16(self.battery_voltage, 0.01);
        w.i16(self.coolant_temp_c, 0.1);
        w.i16(self.air_temp_c, 0.1);
        for speed in [ws.front_left, ws.front_right, ws.rear_left, ws.rear_right] {
            w.u16(speed, 0.1);
        }

        bytes
    }

    /// Validates the header before touching the payload. Anything that is
    /// not our telemetry is reported so the caller can drop it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() != ENVELOPE_LEN {
            return Err(EnvelopeError::Length(bytes.len()));
        }

        if bytes[0] != PREAMBLE {
            return Err(EnvelopeError::Preamble(bytes[0]));
        }

        if bytes[1] != VERSION {
            return Err(EnvelopeError::Version(bytes[1]));
        }

        if bytes[3] as usize != PAYLOAD_LEN {
            return Err(EnvelopeError::PayloadLength(bytes[3]));
        }

        let mut r = Reader {
            buf: &bytes[HEADER_LEN..],
            pos: 0,
        };

        Ok(Self {
            sequence: bytes[2],
            timestamp_ms: u32::from_le_bytes(r.take()),
            rpm: u16::from_le_bytes(r.take()),
            throttle_position_pct: r.i16(0.1),
            fuel_open_time_ms: r.u16(0.1),
            ignition_angle_deg: r.i16(0.1),
            manifold_pressure_kpa: r.u16(0.01),
            barometric_pressure_kpa: r.u16(0.01),
            lambda: r.u16(0.001),
            oil_pressure_psi: r.i16(0.1),
            battery_voltage: r.u16(0.01),
            coolant_temp_c: r.i16(0.1),
            air_temp_c: r.i16(0.1),
            wheel_speed_hz: WheelSpeeds {
                front_left: r.u16(0.1),
                front_right: r.u16(0.1),
                rear_left: r.u16(0.1),
                rear_right: r.u16(0.1),
            },
        })
    }

    pub fn to_snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();

        snapshot.rpm = self.rpm;
        snapshot.throttle_position_pct = self.throttle_position_pct;
        snapshot.fuel_open_time_ms = self.fuel_open_time_ms;
        snapshot.ignition_angle_deg = self.ignition_angle_deg;
        snapshot.manifold_pressure_kpa = self.manifold_pressure_kpa;
        snapshot.barometric_pressure_kpa = self.barometric_pressure_kpa;
        snapshot.lambda = self.lambda;
        snapshot.oil_pressure_psi = self.oil_pressure_psi;
        snapshot.battery_voltage = self.battery_voltage;
        snapshot.coolant_temp_c = self.coolant_temp_c;
        snapshot.air_temp_c = self.air_temp_c;
        snapshot.wheel_speed_hz = self.wheel_speed_hz;
        snapshot.mark_received();

        snapshot
    }
}

/// Produces framed datagrams with an 8-bit sequence that wraps at 256.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeEncoder {
    next_sequence: u8,
}

impl EnvelopeEncoder {
    pub const fn new() -> Self {
        Self { next_sequence: 0 }
    }

    pub fn next_sequence(&self) -> u8 {
        self.next_sequence
    }

    /// `None` until a frame has been decoded into the snapshot.
    pub fn encode(&mut self, timestamp_ms: u32, snapshot: &Snapshot) -> Option<[u8; ENVELOPE_LEN]> {
        if !snapshot.has_received_any_frame() {
            return None;
        }

        let framed = FramedTelemetry::from_snapshot(self.next_sequence, timestamp_ms, snapshot);
        self.next_sequence = self.next_sequence.wrapping_add(1);

        Some(framed.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32, tolerance: f32) -> bool {
        (a - b).abs() <= tolerance
    }

    fn sample() -> Snapshot {
        let mut snapshot = Snapshot::new();
        snapshot.rpm = 6100;
        snapshot.throttle_position_pct = -1.5;
        snapshot.fuel_open_time_ms = 3.4;
        snapshot.ignition_angle_deg = -2.0;
        snapshot.manifold_pressure_kpa = 101.32;
        snapshot.barometric_pressure_kpa = 99.87;
        snapshot.lambda = 0.874;
        snapshot.oil_pressure_psi = 48.2;
        snapshot.battery_voltage = 13.84;
        snapshot.coolant_temp_c = 91.3;
        snapshot.air_temp_c = -3.0;
        snapshot.wheel_speed_hz.rear_right = 42.7;
        snapshot.mark_received();
        snapshot
    }

    #[test]
    fn header_layout() {
        let bytes = FramedTelemetry::from_snapshot(9, 0x0403_0201, &sample()).to_bytes();

        assert_eq!(bytes.len(), 38);
        assert_eq!(&bytes[..4], &[0xAA, 0x01, 9, 34]);
        assert_eq!(&bytes[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(u16::from_le_bytes([bytes[8], bytes[9]]), 6100);
        assert_eq!(i16::from_le_bytes([bytes[10], bytes[11]]), -15);
        assert_eq!(u16::from_le_bytes([bytes[20], bytes[21]]), 874);
    }

    #[test]
    fn payload_survives_the_link() {
        let bytes = FramedTelemetry::from_snapshot(200, 123_456, &sample()).to_bytes();
        let framed = FramedTelemetry::from_bytes(&bytes).unwrap();

        assert_eq!(framed.sequence, 200);
        assert_eq!(framed.timestamp_ms, 123_456);
        assert_eq!(framed.rpm, 6100);
        assert!(close(framed.throttle_position_pct, -1.5, 0.05));
        assert!(close(framed.fuel_open_time_ms, 3.4, 0.05));
        assert!(close(framed.ignition_angle_deg, -2.0, 0.05));
        assert!(close(framed.manifold_pressure_kpa, 101.32, 0.005));
        assert!(close(framed.barometric_pressure_kpa, 99.87, 0.005));
        assert!(close(framed.lambda, 0.874, 0.0005));
        assert!(close(framed.oil_pressure_psi, 48.2, 0.05));
        assert!(close(framed.battery_voltage, 13.84, 0.005));
        assert!(close(framed.coolant_temp_c, 91.3, 0.05));
        assert!(close(framed.air_temp_c, -3.0, 0.05));
        assert!(close(framed.wheel_speed_hz.rear_right, 42.7, 0.05));

        let snapshot = framed.to_snapshot();
        assert!(snapshot.has_received_any_frame());
        assert_eq!(snapshot.rpm, 6100);
    }

    #[test]
    fn foreign_datagrams_are_rejected() {
        let good = FramedTelemetry::from_snapshot(1, 0, &sample()).to_bytes();

        assert_eq!(
            FramedTelemetry::from_bytes(&good[..22]),
            Err(EnvelopeError::Length(22))
        );

        let mut bad = good;
        bad[0] = 0x55;
        assert_eq!(
            FramedTelemetry::from_bytes(&bad),
            Err(EnvelopeError::Preamble(0x55))
        );

        let mut bad = good;
        bad[1] = 2;
        assert_eq!(FramedTelemetry::from_bytes(&bad), Err(EnvelopeError::Version(2)));

        let mut bad = good;
        bad[3] = 18;
        assert_eq!(
            FramedTelemetry::from_bytes(&bad),
            Err(EnvelopeError::PayloadLength(18))
        );
    }

    #[test]
    fn unsigned_fields_clamp_at_zero() {
        let mut snapshot = sample();
        snapshot.fuel_open_time_ms = -4.0;
        snapshot.battery_voltage = 900.0;

        let framed =
            FramedTelemetry::from_bytes(&FramedTelemetry::from_snapshot(0, 0, &snapshot).to_bytes())
                .unwrap();

        assert_eq!(framed.fuel_open_time_ms, 0.0);
        assert!(close(framed.battery_voltage, 655.35, 0.01));
    }

    #[test]
    fn sequence_wraps_at_256() {
        let mut encoder = EnvelopeEncoder::new();
        assert!(encoder.encode(0, &Snapshot::new()).is_none());

        for expected in 0..=255u8 {
            let bytes = encoder.encode(0, &sample()).unwrap();
            assert_eq!(bytes[2], expected);
        }

        assert_eq!(encoder.next_sequence(), 0);
    }
}
