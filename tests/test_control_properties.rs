//! End-to-end behavior of the control loop without a broker
//!
//! Commands go through the dispatcher, feedback through the ingestor, and
//! both meet in one in-memory store. The mock transport stands in for MQTT.

mod test_helpers;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;
use smartlight::control::{evaluate, PolicyInput};
use smartlight::protocol::{DeviceCommand, PowerState};
use smartlight::store::{HistoryQuery, SettingsUpdate, StateStore, UserSettings};
use smartlight::testing::MockTransport;
use smartlight::LightError;
use test_helpers::{harness, harness_with, telemetry};
use tokio::sync::mpsc;

#[tokio::test]
async fn test_brightness_command_keeps_power_state() {
    let h = harness();
    h.ingestor
        .ingest(&telemetry(json!({"is_on": true, "brightness": 20})))
        .await
        .unwrap();

    let response = h.dispatcher.set_brightness(65).await.unwrap();
    assert_eq!(
        response.command,
        DeviceCommand::Manual {
            state: PowerState::On,
            brightness: 65
        }
    );
    assert!(response.delivered);

    let stored = h.store.device_state().await.unwrap();
    assert!(stored.is_on);
    assert_eq!(stored.brightness, 65);
    assert_eq!(
        h.transport.get_published_commands().await,
        vec![response.command]
    );
}

#[tokio::test]
async fn test_out_of_range_brightness_changes_nothing() {
    let h = harness();
    let before = h.store.device_state().await.unwrap();

    for value in [-1, 101, 1_000] {
        let result = h.dispatcher.set_brightness(value).await;
        assert!(matches!(result, Err(LightError::InvalidArgument { .. })));
    }

    assert_eq!(h.store.device_state().await.unwrap(), before);
    assert!(h.transport.get_published_commands().await.is_empty());
}

#[tokio::test]
async fn test_power_off_then_on_restores_fallback_brightness() {
    let h = harness();
    h.dispatcher.set_brightness(90).await.unwrap();

    let off = h.dispatcher.toggle_power(Some(false)).await.unwrap();
    assert_eq!(
        off.command,
        DeviceCommand::Manual {
            state: PowerState::Off,
            brightness: 0
        }
    );
    let stored = h.store.device_state().await.unwrap();
    assert!(!stored.is_on);
    assert_eq!(stored.brightness, 0);

    let on = h.dispatcher.toggle_power(Some(true)).await.unwrap();
    assert_eq!(
        on.command,
        DeviceCommand::Manual {
            state: PowerState::On,
            brightness: 50
        }
    );
    assert_eq!(h.store.device_state().await.unwrap().brightness, 50);
}

#[tokio::test]
async fn test_toggle_without_state_inverts_power() {
    let h = harness();
    assert!(!h.store.device_state().await.unwrap().is_on);

    h.dispatcher.toggle_power(None).await.unwrap();
    assert!(h.store.device_state().await.unwrap().is_on);

    h.dispatcher.toggle_power(None).await.unwrap();
    assert!(!h.store.device_state().await.unwrap().is_on);
}

#[tokio::test]
async fn test_unknown_action_is_rejected() {
    let h = harness();
    let request = smartlight::protocol::ControlRequest {
        action: "SELF_DESTRUCT".to_string(),
        ..Default::default()
    };
    let result = h.dispatcher.dispatch(&request).await;
    assert!(matches!(result, Err(LightError::UnknownAction { .. })));
    assert!(h.transport.get_published_commands().await.is_empty());
}

#[tokio::test]
async fn test_disconnected_transport_still_commits_intent() {
    let h = harness_with(MockTransport::disconnected());

    let response = h.dispatcher.set_auto(true).await.unwrap();
    assert!(!response.delivered);
    assert_eq!(response.command, DeviceCommand::Auto { enable: true });
    assert!(h.store.device_state().await.unwrap().is_auto_mode);
    assert!(h.transport.get_published_commands().await.is_empty());
}

#[tokio::test]
async fn test_feedback_overwrites_optimistic_state() {
    let h = harness();
    h.dispatcher.set_brightness(80).await.unwrap();
    h.dispatcher.toggle_power(Some(true)).await.unwrap();

    // The lamp never got the command and reports what it really is
    h.ingestor
        .ingest(&telemetry(json!({"is_on": false, "brightness": 0, "sensor_value": 420})))
        .await
        .unwrap();

    let stored = h.store.device_state().await.unwrap();
    assert!(!stored.is_on);
    assert_eq!(stored.brightness, 0);
    assert_eq!(stored.sensor_value, 420);
}

#[tokio::test]
async fn test_dark_room_in_auto_mode_switches_lamp_on() {
    let h = harness();
    let outcome = h
        .ingestor
        .ingest(&telemetry(json!({
            "is_on": false,
            "brightness": 0,
            "sensor_value": 250,
            "is_auto_mode": true
        })))
        .await
        .unwrap();

    let expected = DeviceCommand::Manual {
        state: PowerState::On,
        brightness: 80,
    };
    assert_eq!(outcome.auto_command, Some(expected));
    assert!(outcome.auto_command_delivered);
    assert_eq!(h.transport.get_published_commands().await, vec![expected]);

    // Policy commands are not written ahead of the lamp's feedback
    assert!(!h.store.device_state().await.unwrap().is_on);
}

#[tokio::test]
async fn test_policy_uses_stored_settings() {
    let h = harness();
    h.store
        .update_settings(Box::new(|settings: &mut UserSettings| {
            SettingsUpdate {
                light_threshold_low: Some(100),
                light_threshold_high: Some(200),
                auto_brightness: Some(30),
            }
            .apply_to(settings)
        }))
        .await
        .unwrap();

    let quiet = h
        .ingestor
        .ingest(&telemetry(json!({"is_on": false, "sensor_value": 150, "is_auto_mode": true})))
        .await
        .unwrap();
    assert_eq!(quiet.auto_command, None);

    let bright = h
        .ingestor
        .ingest(&telemetry(json!({"is_on": true, "sensor_value": 250})))
        .await
        .unwrap();
    assert_eq!(
        bright.auto_command,
        Some(DeviceCommand::Manual {
            state: PowerState::Off,
            brightness: 0
        })
    );
}

#[tokio::test]
async fn test_manual_mode_never_triggers_policy() {
    let h = harness();
    let outcome = h
        .ingestor
        .ingest(&telemetry(json!({"is_on": false, "sensor_value": 10, "is_auto_mode": false})))
        .await
        .unwrap();
    assert_eq!(outcome.auto_command, None);
    assert!(h.transport.get_published_commands().await.is_empty());
}

#[tokio::test]
async fn test_seconds_and_millis_resolve_to_same_instant() {
    let h = harness();
    let seconds = h
        .ingestor
        .ingest(&telemetry(json!({"sensor_value": 1, "timestamp": 1_700_000_000})))
        .await
        .unwrap();
    let millis = h
        .ingestor
        .ingest(&telemetry(json!({"sensor_value": 1, "timestamp": 1_700_000_000_000_i64})))
        .await
        .unwrap();

    let expected = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    assert_eq!(seconds.history.timestamp, expected);
    assert_eq!(millis.history.timestamp, expected);
    assert_eq!(millis.state.last_updated, expected);
}

#[tokio::test]
async fn test_rejected_settings_keep_previous_values() {
    let h = harness();
    let before = h.store.settings().await.unwrap();

    let result = h
        .store
        .update_settings(Box::new(|settings: &mut UserSettings| {
            SettingsUpdate {
                light_threshold_low: Some(800),
                light_threshold_high: Some(700),
                auto_brightness: None,
            }
            .apply_to(settings)
        }))
        .await;
    assert!(result.is_err());

    let after = h.store.settings().await.unwrap();
    assert_eq!(after, before);
    assert_eq!(after.light_threshold_low, 300);
    assert_eq!(after.light_threshold_high, 700);
}

#[tokio::test]
async fn test_history_is_oldest_first_regardless_of_arrival() {
    let h = harness();
    for (sensor, ts) in [(3, 1_700_000_300), (1, 1_700_000_100), (2, 1_700_000_200)] {
        h.ingestor
            .ingest(&telemetry(json!({"sensor_value": sensor, "timestamp": ts})))
            .await
            .unwrap();
    }

    let rows = h
        .store
        .history(&HistoryQuery {
            since: None,
            limit: 10,
        })
        .await
        .unwrap();
    let sensors: Vec<u32> = rows.iter().map(|row| row.sensor_value).collect();
    assert_eq!(sensors, vec![1, 2, 3]);
    assert!(rows.windows(2).all(|pair| pair[0].timestamp <= pair[1].timestamp));
}

#[tokio::test]
async fn test_replayed_telemetry_adds_history_but_not_state() {
    let h = harness();
    let payload = telemetry(json!({
        "is_on": true,
        "brightness": 40,
        "sensor_value": 512,
        "is_auto_mode": false,
        "timestamp": 1_700_000_000
    }));

    let first = h.ingestor.ingest(&payload).await.unwrap();
    let second = h.ingestor.ingest(&payload).await.unwrap();

    assert_eq!(first.state, second.state);
    assert_eq!(h.store.device_state().await.unwrap(), second.state);
    assert_eq!(h.store.history_len().await, 2);
}

#[tokio::test]
async fn test_malformed_telemetry_leaves_store_untouched() {
    let h = harness();
    let before = h.store.device_state().await.unwrap();

    for payload in [
        b"not json".to_vec(),
        telemetry(json!({"brightness": "bright"})),
        telemetry(json!({"brightness": 150})),
        telemetry(json!({"sensor_value": -5})),
        telemetry(json!([true, 42, 10, false, 1_700_000_000])),
        telemetry(json!("on")),
    ] {
        let result = h.ingestor.ingest(&payload).await;
        assert!(matches!(result, Err(LightError::MalformedTelemetry { .. })));
    }

    assert_eq!(h.store.device_state().await.unwrap(), before);
    assert_eq!(h.store.history_len().await, 0);
}

#[tokio::test]
async fn test_ingest_loop_survives_bad_payloads() {
    let h = harness();
    let (tx, rx) = mpsc::channel(8);
    let store = h.store.clone();
    let handle = tokio::spawn(h.ingestor.run(rx));

    tx.send(b"{broken".to_vec()).await.unwrap();
    tx.send(telemetry(json!({"sensor_value": 42}))).await.unwrap();
    drop(tx);
    handle.await.unwrap();

    assert_eq!(store.device_state().await.unwrap().sensor_value, 42);
    assert_eq!(store.history_len().await, 1);
}

proptest! {
    #[test]
    fn prop_in_range_brightness_is_echoed(value in 0i64..=100, is_on in any::<bool>()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let h = harness();
            h.ingestor
                .ingest(&telemetry(json!({"is_on": is_on})))
                .await
                .unwrap();
            let response = h.dispatcher.set_brightness(value).await.unwrap();
            prop_assert_eq!(
                response.command,
                DeviceCommand::Manual {
                    state: PowerState::from_is_on(is_on),
                    brightness: value as u8,
                }
            );
            let stored = h.store.device_state().await.unwrap();
            prop_assert_eq!(stored.is_on, is_on);
            prop_assert_eq!(stored.brightness, if is_on { value as u8 } else { 0 });
            Ok(())
        })?;
    }

    #[test]
    fn prop_dead_band_never_emits(sensor in 300u32..=700, is_on in any::<bool>(), brightness in 0u8..=100) {
        let input = PolicyInput {
            sensor_value: sensor,
            is_on,
            low: 300,
            high: 700,
            auto_brightness: brightness,
        };
        prop_assert_eq!(evaluate(input), None);
    }
}
