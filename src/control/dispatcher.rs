//! Command dispatcher: user intents into device commands
//!
//! A request is validated first, then the device state is updated
//! optimistically, then the command is handed to the transport. A dropped
//! command is not an error for the caller; a failed state write is.

use crate::error::{LightError, LightResult};
use crate::observability::metrics;
use crate::protocol::{ControlRequest, ControlResponse, DeviceCommand, PowerState};
use crate::store::{DeviceState, StateStore};
use crate::transport::Transport;
use std::sync::Arc;
use tracing::{info, warn, Instrument};

/// Brightness used when powering on a lamp with no remembered brightness
pub const FALLBACK_BRIGHTNESS: u8 = 50;

pub const ACTION_SET_BRIGHTNESS: &str = "SET_BRIGHTNESS";
pub const ACTION_TOGGLE_POWER: &str = "TOGGLE_POWER";
pub const ACTION_SET_AUTO: &str = "SET_AUTO";

/// A validated control request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    SetBrightness(u8),
    /// `None` flips the current power state
    TogglePower(Option<bool>),
    SetAuto(bool),
}

impl ControlAction {
    /// Validate a raw request (pure function)
    pub fn parse(request: &ControlRequest) -> LightResult<Self> {
        match request.action.as_str() {
            ACTION_SET_BRIGHTNESS => {
                let value = request.value.ok_or_else(|| {
                    LightError::invalid_argument("SET_BRIGHTNESS requires a value")
                })?;
                if !(0..=100).contains(&value) {
                    return Err(LightError::invalid_argument(format!(
                        "brightness {value} must be within 0..=100"
                    )));
                }
                Ok(ControlAction::SetBrightness(value as u8))
            }
            ACTION_TOGGLE_POWER => Ok(ControlAction::TogglePower(request.state)),
            ACTION_SET_AUTO => {
                let enable = request
                    .enable
                    .ok_or_else(|| LightError::invalid_argument("SET_AUTO requires enable"))?;
                Ok(ControlAction::SetAuto(enable))
            }
            other => Err(LightError::unknown_action(other)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlAction::SetBrightness(_) => ACTION_SET_BRIGHTNESS,
            ControlAction::TogglePower(_) => ACTION_TOGGLE_POWER,
            ControlAction::SetAuto(_) => ACTION_SET_AUTO,
        }
    }

    /// Apply the intent to `state` (pure function)
    pub fn apply(self, state: &mut DeviceState) {
        match self {
            // An off lamp stays dark in the store; the command still carries the value
            ControlAction::SetBrightness(value) => {
                if state.is_on {
                    state.brightness = value;
                }
            }
            ControlAction::TogglePower(explicit) => {
                let target = explicit.unwrap_or(!state.is_on);
                state.is_on = target;
                if !target {
                    state.brightness = 0;
                } else if state.brightness == 0 {
                    state.brightness = FALLBACK_BRIGHTNESS;
                }
            }
            ControlAction::SetAuto(enable) => state.is_auto_mode = enable,
        }
    }

    /// Command carrying the intent to the lamp, given the state after
    /// [`apply`](Self::apply) (pure function)
    pub fn command(self, state: &DeviceState) -> DeviceCommand {
        match self {
            ControlAction::SetAuto(enable) => DeviceCommand::Auto { enable },
            ControlAction::SetBrightness(brightness) => DeviceCommand::Manual {
                state: PowerState::from_is_on(state.is_on),
                brightness,
            },
            ControlAction::TogglePower(_) => {
                DeviceCommand::Manual {
                    state: PowerState::from_is_on(state.is_on),
                    brightness: state.brightness,
                }
            }
        }
    }
}

/// Turns control requests into optimistic state writes and published commands
pub struct CommandDispatcher<T: Transport> {
    store: Arc<dyn StateStore>,
    transport: Arc<T>,
}

impl<T: Transport> Clone for CommandDispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            transport: self.transport.clone(),
        }
    }
}

impl<T: Transport + 'static> CommandDispatcher<T> {
    pub fn new(store: Arc<dyn StateStore>, transport: Arc<T>) -> Self {
        Self { store, transport }
    }

    /// Validate and execute one control request
    pub async fn dispatch(&self, request: &ControlRequest) -> LightResult<ControlResponse> {
        let action = match ControlAction::parse(request) {
            Ok(action) => action,
            Err(e) => {
                metrics().control_request(&request.action, false);
                return Err(e);
            }
        };

        let result = self
            .execute(action)
            .instrument(crate::command_span!(action = action.name()))
            .await;
        metrics().control_request(action.name(), result.is_ok());
        result
    }

    pub async fn set_brightness(&self, value: i64) -> LightResult<ControlResponse> {
        self.dispatch(&ControlRequest {
            action: ACTION_SET_BRIGHTNESS.to_string(),
            value: Some(value),
            ..Default::default()
        })
        .await
    }

    pub async fn toggle_power(&self, state: Option<bool>) -> LightResult<ControlResponse> {
        self.dispatch(&ControlRequest {
            action: ACTION_TOGGLE_POWER.to_string(),
            state,
            ..Default::default()
        })
        .await
    }

    pub async fn set_auto(&self, enable: bool) -> LightResult<ControlResponse> {
        self.dispatch(&ControlRequest {
            action: ACTION_SET_AUTO.to_string(),
            enable: Some(enable),
            ..Default::default()
        })
        .await
    }

    async fn execute(&self, action: ControlAction) -> LightResult<ControlResponse> {
        let state = self
            .store
            .update_device(Box::new(move |state: &mut DeviceState| action.apply(state)))
            .await?;
        let command = action.command(&state);

        let delivered = match self.transport.publish_command(&command).await {
            Ok(()) => {
                metrics().command_published();
                true
            }
            Err(e) => {
                metrics().command_dropped();
                warn!(
                    action = action.name(),
                    command = ?command,
                    error = %e,
                    "Device unreachable, command dropped"
                );
                false
            }
        };

        info!(
            action = action.name(),
            is_on = state.is_on,
            brightness = state.brightness,
            is_auto_mode = state.is_auto_mode,
            delivered,
            "Control request applied"
        );

        Ok(ControlResponse::new(command, delivered))
    }
}
