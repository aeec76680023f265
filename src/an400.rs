//! Decoding of the AN400 broadcast protocol.
//!
//! The ECU transmits sixteen fixed 29-bit extended IDs ("PE1" to "PE16"), each
//! with a fixed layout of little-endian 16-bit fields. [`Decoder::decode`]
//! folds one frame at a time into a [`Snapshot`].

use embedded_can::{Frame, Id};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    codec::{s16_lohi, scaled_s16, u16_lohi},
    snapshot::Snapshot,
};

/// Multiplier from psi to kPa
pub const PSI_TO_KPA: f32 = 6.89476;

/// Flag bit in PE2/PE6 byte 6 selecting the unit system of the frame
const UNIT_FLAG: u8 = 0x01;

/// The AN400 message set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum MessageId {
    /// RPM, throttle position, fuel open time, ignition angle
    Pe1 = 0x0CFF_F048,
    /// Barometer, MAP, lambda, pressure unit flag
    Pe2 = 0x0CFF_F148,
    /// Analog inputs 1-4 (oil pressure sender on input 2)
    Pe3 = 0x0CFF_F248,
    /// Analog inputs 5-8
    Pe4 = 0x0CFF_F348,
    /// Frequency inputs 1-4 (wheel speeds)
    Pe5 = 0x0CFF_F448,
    /// Battery voltage, air temperature, coolant temperature, temperature unit flag
    Pe6 = 0x0CFF_F548,
    /// Thermistor inputs on analog 5 and 7, firmware version
    Pe7 = 0x0CFF_F648,
    /// RPM, TPS, MAP and MAF load rates of change
    Pe8 = 0x0CFF_F748,
    /// Measured lambda 1 and 2, target lambda
    Pe9 = 0x0CFF_F848,
    /// PWM duty cycles 1-8
    Pe10 = 0x0CFF_F948,
    /// Traction control slip, driven wheel rate of change, desired slip
    Pe11 = 0x0CFF_FA48,
    /// Traction control wheel speed averages and ignition intervention
    Pe12 = 0x0CFF_FB48,
    /// Traction control individual wheel speeds
    Pe13 = 0x0CFF_FC48,
    /// Fuel compensation: acceleration, starting, air temp, coolant temp
    Pe14 = 0x0CFF_FD48,
    /// Fuel compensation: barometer, MAP
    Pe15 = 0x0CFF_FE48,
    /// Ignition compensation: air temp, coolant temp, barometer, MAP
    Pe16 = 0x0CFF_D048,
}

impl MessageId {
    /// Number of payload bytes the message must carry for all of its fields
    /// to be present. Shorter frames are treated as absent data.
    pub const fn min_data_length(&self) -> usize {
        match self {
            Self::Pe1 => 8,
            Self::Pe2 => 7,
            Self::Pe3 => 8,
            Self::Pe4 => 8,
            Self::Pe5 => 8,
            Self::Pe6 => 7,
            Self::Pe7 => 4,
            Self::Pe8 => 8,
            Self::Pe9 => 6,
            Self::Pe10 => 8,
            Self::Pe11 => 6,
            Self::Pe12 => 8,
            Self::Pe13 => 8,
            Self::Pe14 => 8,
            Self::Pe15 => 4,
            Self::Pe16 => 8,
        }
    }

    /// Messages decoded by the basic variant
    pub const fn is_basic(&self) -> bool {
        matches!(
            self,
            Self::Pe1 | Self::Pe2 | Self::Pe3 | Self::Pe5 | Self::Pe6 | Self::Pe9
        )
    }

    /// Maps a frame ID onto the message set. Standard IDs never match, even
    /// when numerically equal to a known extended ID.
    pub fn from_id(id: Id) -> Option<Self> {
        match id {
            Id::Extended(id) => Self::try_from(id.as_raw()).ok(),
            Id::Standard(_) => None,
        }
    }
}

/// Which messages the decoder folds into the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecoderVariant {
    /// Core engine channels only (PE1, PE2, PE3 oil, PE5, PE6, PE9)
    Basic,
    /// Every message in the table, including auxiliary channels
    #[default]
    Extended,
}

/// Both PE2 and PE9 carry a lambda reading. This selects which of them is
/// allowed to write [`Snapshot::lambda`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LambdaArbitration {
    /// Whichever of PE2 or PE9 arrived most recently
    #[default]
    LastWriterWins,
    /// Only PE2's lambda field
    Pe2Only,
    /// Only PE9's measured lambda #1
    Pe9Only,
}

/// Linear transform from the raw PE3 analog input 2 reading to oil pressure:
/// `raw / divisor * gain + offset`.
///
/// The defaults describe the oil pressure sender fitted to this car and are
/// not part of AN400 itself.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OilPressureCalibration {
    pub divisor: f32,
    pub gain: f32,
    pub offset: f32,
}

impl OilPressureCalibration {
    pub const DEFAULT: Self = Self {
        divisor: 1000.0,
        gain: 25.0,
        offset: -12.5,
    };

    pub fn apply(&self, raw: i16) -> f32 {
        f32::from(raw) / self.divisor * self.gain + self.offset
    }
}

impl Default for OilPressureCalibration {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DecoderConfig {
    pub variant: DecoderVariant,
    pub lambda: LambdaArbitration,
    pub oil_pressure: OilPressureCalibration,
}

/// Folds AN400 frames into a [`Snapshot`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Decoder {
    config: DecoderConfig,
}

impl Decoder {
    pub const fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Applies one frame to the snapshot and returns the message it was
    /// decoded as.
    ///
    /// Standard and remote frames, unknown IDs, messages outside the
    /// configured variant and frames shorter than their message requires are
    /// ignored (`None`) and leave the snapshot untouched. Otherwise only the
    /// fields carried by that message are written.
    pub fn decode<F: Frame>(&self, frame: &F, snapshot: &mut Snapshot) -> Option<MessageId> {
        if !frame.is_extended() || frame.is_remote_frame() {
            return None;
        }

        let message = MessageId::from_id(frame.id())?;

        if self.config.variant == DecoderVariant::Basic && !message.is_basic() {
            return None;
        }

        let data = frame.data();
        if data.len() < message.min_data_length() {
            return None;
        }

        match message {
            MessageId::Pe1 => self.decode_engine(data, snapshot),
            MessageId::Pe2 => self.decode_pressures(data, snapshot),
            MessageId::Pe3 => self.decode_analog_low(data, snapshot),
            MessageId::Pe4 => decode_analog_high(data, snapshot),
            MessageId::Pe5 => decode_wheel_speeds(data, snapshot),
            MessageId::Pe6 => decode_electrical_and_temps(data, snapshot),
            MessageId::Pe7 => decode_thermistors(data, snapshot),
            MessageId::Pe8 => decode_rates(data, snapshot),
            MessageId::Pe9 => self.decode_lambda(data, snapshot),
            MessageId::Pe10 => decode_pwm_duty(data, snapshot),
            MessageId::Pe11 => decode_traction_slip(data, snapshot),
            MessageId::Pe12 => decode_traction_intervention(data, snapshot),
            MessageId::Pe13 => decode_traction_wheel_speeds(data, snapshot),
            MessageId::Pe14 => decode_fuel_compensation(data, snapshot),
            MessageId::Pe15 => decode_fuel_compensation_pressure(data, snapshot),
            MessageId::Pe16 => decode_ignition_compensation(data, snapshot),
        }

        snapshot.mark_received();

        Some(message)
    }

    fn decode_engine(&self, data: &[u8], snapshot: &mut Snapshot) {
        snapshot.rpm = u16_lohi(data, 0);
        snapshot.throttle_position_pct = scaled_s16(data, 2, 0.1);
        snapshot.fuel_open_time_ms = scaled_s16(data, 4, 0.1);
        snapshot.ignition_angle_deg = scaled_s16(data, 6, 0.1);
    }

    fn decode_pressures(&self, data: &[u8], snapshot: &mut Snapshot) {
        let baro = scaled_s16(data, 0, 0.01);
        let map = scaled_s16(data, 2, 0.01);

        if data[6] & UNIT_FLAG != 0 {
            snapshot.barometric_pressure_kpa = baro;
            snapshot.manifold_pressure_kpa = map;
        } else {
            snapshot.barometric_pressure_kpa = baro * PSI_TO_KPA;
            snapshot.manifold_pressure_kpa = map * PSI_TO_KPA;
        }

        if self.config.lambda != LambdaArbitration::Pe9Only {
            snapshot.lambda = scaled_s16(data, 4, 0.01);
        }
    }

    fn decode_analog_low(&self, data: &[u8], snapshot: &mut Snapshot) {
        snapshot.oil_pressure_psi = self.config.oil_pressure.apply(s16_lohi(data, 2));

        if self.config.variant == DecoderVariant::Extended {
            for (i, volts) in snapshot.aux.analog_input_v[..4].iter_mut().enumerate() {
                *volts = scaled_s16(data, i * 2, 0.001);
            }
        }
    }

    fn decode_lambda(&self, data: &[u8], snapshot: &mut Snapshot) {
        if self.config.lambda != LambdaArbitration::Pe2Only {
            snapshot.lambda = scaled_s16(data, 0, 0.01);
        }

        if self.config.variant == DecoderVariant::Extended {
            snapshot.lambda2 = scaled_s16(data, 2, 0.01);
            snapshot.lambda_target = scaled_s16(data, 4, 0.01);
        }
    }
}

fn fahrenheit_to_celsius(fahrenheit: f32) -> f32 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}

fn decode_analog_high(data: &[u8], snapshot: &mut Snapshot) {
    for (i, volts) in snapshot.aux.analog_input_v[4..].iter_mut().enumerate() {
        *volts = scaled_s16(data, i * 2, 0.001);
    }
}

fn decode_wheel_speeds(data: &[u8], snapshot: &mut Snapshot) {
    let wheels = &mut snapshot.wheel_speed_hz;

    wheels.front_right = scaled_s16(data, 0, 0.2);
    wheels.front_left = scaled_s16(data, 2, 0.2);
    wheels.rear_right = scaled_s16(data, 4, 0.2);
    wheels.rear_left = scaled_s16(data, 6, 0.2);
}

fn decode_electrical_and_temps(data: &[u8], snapshot: &mut Snapshot) {
    snapshot.battery_voltage = scaled_s16(data, 0, 0.01);

    let air = scaled_s16(data, 2, 0.1);
    let coolant = scaled_s16(data, 4, 0.1);

    if data[6] & UNIT_FLAG != 0 {
        snapshot.air_temp_c = air;
        snapshot.coolant_temp_c = coolant;
    } else {
        snapshot.air_temp_c = fahrenheit_to_celsius(air);
        snapshot.coolant_temp_c = fahrenheit_to_celsius(coolant);
    }
}

fn decode_thermistors(data: &[u8], snapshot: &mut Snapshot) {
    snapshot.aux.thermistor5_temp = scaled_s16(data, 0, 0.1);
    snapshot.aux.thermistor7_temp = scaled_s16(data, 2, 0.1);
}

fn decode_rates(data: &[u8], snapshot: &mut Snapshot) {
    let aux = &mut snapshot.aux;

    aux.rpm_rate_rps = scaled_s16(data, 0, 1.0);
    aux.tps_rate_pct_s = scaled_s16(data, 2, 1.0);
    aux.map_rate = scaled_s16(data, 4, 1.0);
    aux.maf_load_rate = scaled_s16(data, 6, 0.1);
}

fn decode_pwm_duty(data: &[u8], snapshot: &mut Snapshot) {
    for (duty, raw) in snapshot.aux.pwm_duty_pct.iter_mut().zip(data) {
        *duty = f32::from(*raw) * 0.5;
    }
}

fn decode_traction_slip(data: &[u8], snapshot: &mut Snapshot) {
    let aux = &mut snapshot.aux;

    aux.percent_slip = scaled_s16(data, 0, 0.1);
    aux.driven_wheel_roc = scaled_s16(data, 2, 0.1);
    aux.traction_desired_pct = scaled_s16(data, 4, 0.1);
}

fn decode_traction_intervention(data: &[u8], snapshot: &mut Snapshot) {
    let aux = &mut snapshot.aux;

    aux.driven_avg_ws_ft_s = scaled_s16(data, 0, 0.1);
    aux.nondriven_avg_ws_ft_s = scaled_s16(data, 2, 0.1);
    aux.ign_comp_deg = scaled_s16(data, 4, 0.1);
    aux.ign_cut_pct = scaled_s16(data, 6, 0.1);
}

fn decode_traction_wheel_speeds(data: &[u8], snapshot: &mut Snapshot) {
    let aux = &mut snapshot.aux;

    aux.driven_ws_ft_s = [scaled_s16(data, 0, 0.1), scaled_s16(data, 2, 0.1)];
    aux.nondriven_ws_ft_s = [scaled_s16(data, 4, 0.1), scaled_s16(data, 6, 0.1)];
}

fn decode_fuel_compensation(data: &[u8], snapshot: &mut Snapshot) {
    let aux = &mut snapshot.aux;

    aux.fuel_comp_accel_pct = scaled_s16(data, 0, 0.1);
    aux.fuel_comp_start_pct = scaled_s16(data, 2, 0.1);
    aux.fuel_comp_air_pct = scaled_s16(data, 4, 0.1);
    aux.fuel_comp_coolant_pct = scaled_s16(data, 6, 0.1);
}

fn decode_fuel_compensation_pressure(data: &[u8], snapshot: &mut Snapshot) {
    snapshot.aux.fuel_comp_baro_pct = scaled_s16(data, 0, 0.1);
    snapshot.aux.fuel_comp_map_pct = scaled_s16(data, 2, 0.1);
}

fn decode_ignition_compensation(data: &[u8], snapshot: &mut Snapshot) {
    let aux = &mut snapshot.aux;

    aux.ign_comp_air_deg = scaled_s16(data, 0, 0.1);
    aux.ign_comp_coolant_deg = scaled_s16(data, 2, 0.1);
    aux.ign_comp_baro_deg = scaled_s16(data, 4, 0.1);
    aux.ign_comp_map_deg = scaled_s16(data, 6, 0.1);
}
