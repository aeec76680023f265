/// Wheel speed sensor frequencies, in Hz.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WheelSpeeds {
    pub front_left: f32,
    pub front_right: f32,
    pub rear_left: f32,
    pub rear_right: f32,
}

/// Auxiliary channels only broadcast by the extended message set (PE3/PE4 and
/// PE7-PE16).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AuxChannels {
    /// Raw analog inputs 1-8, in volts
    pub analog_input_v: [f32; 8],
    /// PWM outputs 1-8, percent duty
    pub pwm_duty_pct: [f32; 8],
    pub thermistor5_temp: f32,
    pub thermistor7_temp: f32,

    pub rpm_rate_rps: f32,
    pub tps_rate_pct_s: f32,
    pub map_rate: f32,
    pub maf_load_rate: f32,

    pub percent_slip: f32,
    pub driven_wheel_roc: f32,
    pub traction_desired_pct: f32,
    pub driven_avg_ws_ft_s: f32,
    pub nondriven_avg_ws_ft_s: f32,
    pub ign_comp_deg: f32,
    pub ign_cut_pct: f32,
    pub driven_ws_ft_s: [f32; 2],
    pub nondriven_ws_ft_s: [f32; 2],

    pub fuel_comp_accel_pct: f32,
    pub fuel_comp_start_pct: f32,
    pub fuel_comp_air_pct: f32,
    pub fuel_comp_coolant_pct: f32,
    pub fuel_comp_baro_pct: f32,
    pub fuel_comp_map_pct: f32,

    pub ign_comp_air_deg: f32,
    pub ign_comp_coolant_deg: f32,
    pub ign_comp_baro_deg: f32,
    pub ign_comp_map_deg: f32,
}

/// Latest known engine and chassis state.
///
/// Every field holds the value from the most recent frame that carries it.
/// Pressures are always kPa and temperatures always Celsius; unit selection
/// happens while decoding. All fields start at zero and the snapshot is only
/// considered publishable once [`Snapshot::has_received_any_frame`] is set.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Snapshot {
    pub rpm: u16,
    pub throttle_position_pct: f32,
    pub fuel_open_time_ms: f32,
    pub ignition_angle_deg: f32,

    pub barometric_pressure_kpa: f32,
    pub manifold_pressure_kpa: f32,

    pub lambda: f32,
    pub lambda2: f32,
    pub lambda_target: f32,

    pub oil_pressure_psi: f32,
    pub battery_voltage: f32,
    pub coolant_temp_c: f32,
    pub air_temp_c: f32,

    pub wheel_speed_hz: WheelSpeeds,

    pub aux: AuxChannels,

    received_any_frame: bool,
}

impl Snapshot {
    pub const fn new() -> Self {
        Self {
            rpm: 0,
            throttle_position_pct: 0.0,
            fuel_open_time_ms: 0.0,
            ignition_angle_deg: 0.0,
            barometric_pressure_kpa: 0.0,
            manifold_pressure_kpa: 0.0,
            lambda: 0.0,
            lambda2: 0.0,
            lambda_target: 0.0,
            oil_pressure_psi: 0.0,
            battery_voltage: 0.0,
            coolant_temp_c: 0.0,
            air_temp_c: 0.0,
            wheel_speed_hz: WheelSpeeds {
                front_left: 0.0,
                front_right: 0.0,
                rear_left: 0.0,
                rear_right: 0.0,
            },
            aux: AuxChannels {
                analog_input_v: [0.0; 8],
                pwm_duty_pct: [0.0; 8],
                thermistor5_temp: 0.0,
                thermistor7_temp: 0.0,
                rpm_rate_rps: 0.0,
                tps_rate_pct_s: 0.0,
                map_rate: 0.0,
                maf_load_rate: 0.0,
                percent_slip: 0.0,
                driven_wheel_roc: 0.0,
                traction_desired_pct: 0.0,
                driven_avg_ws_ft_s: 0.0,
                nondriven_avg_ws_ft_s: 0.0,
                ign_comp_deg: 0.0,
                ign_cut_pct: 0.0,
                driven_ws_ft_s: [0.0; 2],
                nondriven_ws_ft_s: [0.0; 2],
                fuel_comp_accel_pct: 0.0,
                fuel_comp_start_pct: 0.0,
                fuel_comp_air_pct: 0.0,
                fuel_comp_coolant_pct: 0.0,
                fuel_comp_baro_pct: 0.0,
                fuel_comp_map_pct: 0.0,
                ign_comp_air_deg: 0.0,
                ign_comp_coolant_deg: 0.0,
                ign_comp_baro_deg: 0.0,
                ign_comp_map_deg: 0.0,
            },
            received_any_frame: false,
        }
    }

    /// Whether at least one recognized frame has updated this snapshot.
    /// Nothing may be emitted before this turns true.
    pub fn has_received_any_frame(&self) -> bool {
        self.received_any_frame
    }

    /// Marks the snapshot as carrying real data. Called by the frame decoder
    /// and by receivers reconstructing a snapshot from a packet.
    pub fn mark_received(&mut self) {
        self.received_any_frame = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_new_matches_default() {
        assert_eq!(Snapshot::new(), Snapshot::default());
        assert!(!Snapshot::new().has_received_any_frame());
    }

    #[test]
    fn mark_received_is_sticky() {
        let mut snapshot = Snapshot::new();
        snapshot.mark_received();
        snapshot.rpm = 0;

        assert!(snapshot.has_received_any_frame());
    }
}
