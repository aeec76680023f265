use crate::{
    codec::{quantize_i16, quantize_u16, quantize_u8},
    snapshot::{Snapshot, WheelSpeeds},
};

/// Size of a radio telemetry packet on the wire.
pub const PACKET_LEN: usize = 22;

/* Per-bit scales */

const PRESSURE_SCALE: f32 = 0.1;
const THROTTLE_SCALE: f32 = 0.1;
const OIL_SCALE: f32 = 0.1;
const TEMPERATURE_SCALE: f32 = 0.1;
const LAMBDA_SCALE: f32 = 0.01;
const BATTERY_SCALE: f32 = 0.1;
const WHEEL_SPEED_SCALE: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("Telemetry packets are exactly 22 bytes but received ({0:?})")]
pub struct PacketLengthError(pub usize);

/// The reduced snapshot sent over the radio link.
///
/// Layout (little endian):
///
/// | Offset | Type | Field | Scale |
/// |---|---|---|---|
/// | 0 | u16 | counter | 1 |
/// | 2 | u16 | rpm | 1 |
/// | 4 | u16 | manifold pressure | 0.1 kPa |
/// | 6 | u16 | throttle position | 0.1 % |
/// | 8 | i16 | oil pressure | 0.1 psi |
/// | 10 | i16 | coolant temperature | 0.1 C |
/// | 12 | u8 | lambda | 0.01 |
/// | 13 | u8 | battery voltage | 0.1 V |
/// | 14 | u16 x4 | wheel speeds FL, FR, BL, BR | 0.5 Hz |
///
/// There is no checksum. Any 22 bytes decode to some packet.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TelemetryPacket {
    pub counter: u16,
    pub rpm: u16,
    pub manifold_pressure_kpa: f32,
    pub throttle_position_pct: f32,
    pub oil_pressure_psi: f32,
    pub coolant_temp_c: f32,
    pub lambda: f32,
    pub battery_voltage: f32,
    pub wheel_speed_hz: WheelSpeeds,
}

impl TelemetryPacket {
    pub fn from_snapshot(counter: u16, snapshot: &Snapshot) -> Self {
        Self {
            counter,
            rpm: snapshot.rpm,
            manifold_pressure_kpa: snapshot.manifold_pressure_kpa,
            throttle_position_pct: snapshot.throttle_position_pct,
            oil_pressure_psi: snapshot.oil_pressure_psi,
            coolant_temp_c: snapshot.coolant_temp_c,
            lambda: snapshot.lambda,
            battery_voltage: snapshot.battery_voltage,
            wheel_speed_hz: snapshot.wheel_speed_hz,
        }
    }

    /// Quantizes every field to its wire scale. Out-of-range values clamp
    /// to the nearest representable value.
    pub fn to_bytes(&self) -> [u8; PACKET_LEN] {
        let mut bytes = [0u8; PACKET_LEN];
        let ws = &self.wheel_speed_hz;

        bytes[0..2].copy_from_slice(&self.counter.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.rpm.to_le_bytes());
        bytes[4..6].copy_from_slice(
            &quantize_u16(self.manifold_pressure_kpa, PRESSURE_SCALE).to_le_bytes(),
        );
        bytes[6..8].copy_from_slice(
            &quantize_u16(self.throttle_position_pct, THROTTLE_SCALE).to_le_bytes(),
        );
        bytes[8..10].copy_from_slice(&quantize_i16(self.oil_pressure_psi, OIL_SCALE).to_le_bytes());
        bytes[10..12]
            .copy_from_slice(&quantize_i16(self.coolant_temp_c, TEMPERATURE_SCALE).to_le_bytes());
        bytes[12] = quantize_u8(self.lambda, LAMBDA_SCALE);
        bytes[13] = quantize_u8(self.battery_voltage, BATTERY_SCALE);

        let speeds = [ws.front_left, ws.front_right, ws.rear_left, ws.rear_right];
        for (chunk, speed) in bytes[14..].chunks_exact_mut(2).zip(speeds) {
            chunk.copy_from_slice(&quantize_u16(speed, WHEEL_SPEED_SCALE).to_le_bytes());
        }

        bytes
    }

    /// Only the length is checked. A corrupted packet of the right size decodes
    /// to plausible but wrong values.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketLengthError> {
        if bytes.len() != PACKET_LEN {
            return Err(PacketLengthError(bytes.len()));
        }

        let u16_at = |offset: usize| u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
        let i16_at = |offset: usize| i16::from_le_bytes([bytes[offset], bytes[offset + 1]]);

        Ok(Self {
            counter: u16_at(0),
            rpm: u16_at(2),
            manifold_pressure_kpa: f32::from(u16_at(4)) * PRESSURE_SCALE,
            throttle_position_pct: f32::from(u16_at(6)) * THROTTLE_SCALE,
            oil_pressure_psi: f32::from(i16_at(8)) * OIL_SCALE,
            coolant_temp_c: f32::from(i16_at(10)) * TEMPERATURE_SCALE,
            lambda: f32::from(bytes[12]) * LAMBDA_SCALE,
            battery_voltage: f32::from(bytes[13]) * BATTERY_SCALE,
            wheel_speed_hz: WheelSpeeds {
                front_left: f32::from(u16_at(14)) * WHEEL_SPEED_SCALE,
                front_right: f32::from(u16_at(16)) * WHEEL_SPEED_SCALE,
                rear_left: f32::from(u16_at(18)) * WHEEL_SPEED_SCALE,
                rear_right: f32::from(u16_at(20)) * WHEEL_SPEED_SCALE,
            },
        })
    }

    /// A snapshot holding only the fields this packet carries; all others
    /// are zero.
    pub fn to_snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();

        snapshot.rpm = self.rpm;
        snapshot.manifold_pressure_kpa = self.manifold_pressure_kpa;
        snapshot.throttle_position_pct = self.throttle_position_pct;
        snapshot.oil_pressure_psi = self.oil_pressure_psi;
        snapshot.coolant_temp_c = self.coolant_temp_c;
        snapshot.lambda = self.lambda;
        snapshot.battery_voltage = self.battery_voltage;
        snapshot.wheel_speed_hz = self.wheel_speed_hz;
        snapshot.mark_received();

        snapshot
    }
}

/// Produces packets with a 16-bit counter that wraps at 65536.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketEncoder {
    next_counter: u16,
}

impl PacketEncoder {
    pub const fn new() -> Self {
        Self { next_counter: 0 }
    }

    /// Counter the next emitted packet will carry
    pub fn next_counter(&self) -> u16 {
        self.next_counter
    }

    /// Encodes the snapshot and advances the counter. Returns `None`, without
    /// touching the counter, until a frame has been decoded into the snapshot.
    pub fn encode(&mut self, snapshot: &Snapshot) -> Option<[u8; PACKET_LEN]> {
        if !snapshot.has_received_any_frame() {
            return None;
        }

        let packet = TelemetryPacket::from_snapshot(self.next_counter, snapshot);
        self.next_counter = self.next_counter.wrapping_add(1);

        Some(packet.to_bytes())
    }
}
