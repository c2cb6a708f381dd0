//! Threshold policy for automatic mode
//!
//! Two thresholds with a dead band between them. Below `low` a dark room
//! switches the lamp on at `auto_brightness`; above `high` a bright room
//! switches it off. Inside the band nothing happens, so readings hovering
//! near one threshold do not make the lamp flicker.

use crate::protocol::{DeviceCommand, PowerState};
use crate::store::{DeviceState, UserSettings};

/// Inputs the policy decides on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyInput {
    pub sensor_value: u32,
    pub is_on: bool,
    pub low: u32,
    pub high: u32,
    pub auto_brightness: u8,
}

impl PolicyInput {
    pub fn new(state: &DeviceState, settings: &UserSettings) -> Self {
        Self {
            sensor_value: state.sensor_value,
            is_on: state.is_on,
            low: settings.light_threshold_low,
            high: settings.light_threshold_high,
            auto_brightness: settings.auto_brightness,
        }
    }
}

/// Decide whether the lamp needs a command; at most one is returned
pub fn evaluate(input: PolicyInput) -> Option<DeviceCommand> {
    if input.sensor_value < input.low && !input.is_on {
        return Some(DeviceCommand::Manual {
            state: PowerState::On,
            brightness: input.auto_brightness,
        });
    }

    if input.sensor_value > input.high && input.is_on {
        return Some(DeviceCommand::Manual {
            state: PowerState::Off,
            brightness: 0,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn input(sensor_value: u32, is_on: bool) -> PolicyInput {
        PolicyInput {
            sensor_value,
            is_on,
            low: 300,
            high: 700,
            auto_brightness: 80,
        }
    }

    #[test]
    fn test_dark_and_off_switches_on() {
        assert_eq!(
            evaluate(input(250, false)),
            Some(DeviceCommand::Manual {
                state: PowerState::On,
                brightness: 80
            })
        );
    }

    #[test]
    fn test_dark_and_already_on_does_nothing() {
        assert_eq!(evaluate(input(250, true)), None);
    }

    #[test]
    fn test_bright_and_on_switches_off() {
        assert_eq!(
            evaluate(input(750, true)),
            Some(DeviceCommand::Manual {
                state: PowerState::Off,
                brightness: 0
            })
        );
    }

    #[test]
    fn test_bright_and_already_off_does_nothing() {
        assert_eq!(evaluate(input(750, false)), None);
    }

    #[test]
    fn test_band_edges_are_inside_the_band() {
        assert_eq!(evaluate(input(300, false)), None);
        assert_eq!(evaluate(input(700, true)), None);
    }

    #[test]
    fn test_mid_band_never_emits() {
        assert_eq!(evaluate(input(500, false)), None);
        assert_eq!(evaluate(input(500, true)), None);
    }

    #[test]
    fn test_input_from_entities() {
        let now = chrono::Utc::now();
        let mut state = DeviceState::initial(now);
        state.sensor_value = 120;
        let mut settings = UserSettings::defaults(now);
        settings.auto_brightness = 65;

        let input = PolicyInput::new(&state, &settings);
        assert_eq!(input.sensor_value, 120);
        assert!(!input.is_on);
        assert_eq!(input.auto_brightness, 65);
        assert_eq!(
            evaluate(input),
            Some(DeviceCommand::Manual {
                state: PowerState::On,
                brightness: 65
            })
        );
    }

    proptest! {
        #[test]
        fn prop_band_is_quiet(
            low in 0u32..10_000,
            width in 1u32..10_000,
            offset in 0u32..10_000,
            is_on in any::<bool>(),
            auto_brightness in 0u8..=100,
        ) {
            let high = low + width;
            let sensor_value = low + offset % (width + 1);
            let decision = evaluate(PolicyInput { sensor_value, is_on, low, high, auto_brightness });
            prop_assert_eq!(decision, None);
        }

        #[test]
        fn prop_command_always_changes_power(
            sensor_value in 0u32..20_000,
            is_on in any::<bool>(),
            low in 0u32..10_000,
            width in 1u32..10_000,
        ) {
            let input = PolicyInput { sensor_value, is_on, low, high: low + width, auto_brightness: 80 };
            if let Some(DeviceCommand::Manual { state, brightness }) = evaluate(input) {
                prop_assert_ne!(state.is_on(), is_on);
                if !state.is_on() {
                    prop_assert_eq!(brightness, 0);
                }
            }
        }
    }
}
