//! Outbound operator commands. The wire shape is a flat JSON object; the
//! dashboard never interprets it beyond serializing.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Command {
    AutoMode {
        #[serde(rename = "autoMode")]
        auto_mode: bool,
    },
    Pump {
        #[serde(rename = "pumpRunning")]
        pump_running: bool,
    },
    PhAdjustment {
        #[serde(rename = "phAdjustment")]
        ph_adjustment: bool,
    },
    CalibrateSensors {
        #[serde(rename = "calibrateSensors")]
        calibrate_sensors: bool,
    },
    LightThreshold {
        #[serde(rename = "lightThreshold")]
        light_threshold: f64,
        #[serde(rename = "lightThresholdUpdate")]
        light_threshold_update: bool,
    },
    PhTarget {
        #[serde(rename = "pHTarget")]
        ph_target: f64,
        #[serde(rename = "pHTargetUpdate")]
        ph_target_update: bool,
    },
    /// Anything else, passed through untouched.
    Raw(serde_json::Value),
}

impl Command {
    pub fn light_threshold(value: f64) -> Self {
        Self::LightThreshold {
            light_threshold: value,
            light_threshold_update: true,
        }
    }

    pub fn ph_target(value: f64) -> Self {
        Self::PhTarget {
            ph_target: value,
            ph_target_update: true,
        }
    }

    /// Recognise the known command shapes; anything else stays `Raw`.
    pub fn from_value(v: serde_json::Value) -> Self {
        use serde_json::Value;

        let typed = v.as_object().and_then(|o| {
            let get = |k: &str| o.get(k);
            match o.len() {
                1 => {
                    let (key, val) = o.iter().next()?;
                    let flag = val.as_bool()?;
                    match key.as_str() {
                        "autoMode" => Some(Self::AutoMode { auto_mode: flag }),
                        "pumpRunning" => Some(Self::Pump { pump_running: flag }),
                        "phAdjustment" => Some(Self::PhAdjustment {
                            ph_adjustment: flag,
                        }),
                        "calibrateSensors" => Some(Self::CalibrateSensors {
                            calibrate_sensors: flag,
                        }),
                        _ => None,
                    }
                }
                2 => match (
                    get("lightThreshold"),
                    get("lightThresholdUpdate"),
                    get("pHTarget"),
                    get("pHTargetUpdate"),
                ) {
                    (Some(Value::Number(n)), Some(Value::Bool(u)), None, None) => {
                        Some(Self::LightThreshold {
                            light_threshold: n.as_f64()?,
                            light_threshold_update: *u,
                        })
                    }
                    (None, None, Some(Value::Number(n)), Some(Value::Bool(u))) => {
                        Some(Self::PhTarget {
                            ph_target: n.as_f64()?,
                            ph_target_update: *u,
                        })
                    }
                    _ => None,
                },
                _ => None,
            }
        });
        typed.unwrap_or(Self::Raw(v))
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, PublishError> {
        serde_json::to_vec(self).map_err(PublishError::Serialize)
    }

    /// Short label for the event log.
    pub fn describe(&self) -> String {
        match self {
            Self::AutoMode { auto_mode } => format!("autoMode={auto_mode}"),
            Self::Pump { pump_running } => format!("pumpRunning={pump_running}"),
            Self::PhAdjustment { ph_adjustment } => format!("phAdjustment={ph_adjustment}"),
            Self::CalibrateSensors { .. } => "calibrateSensors".to_string(),
            Self::LightThreshold {
                light_threshold, ..
            } => format!("lightThreshold={light_threshold}"),
            Self::PhTarget { ph_target, .. } => format!("pHTarget={ph_target}"),
            Self::Raw(v) => format!("raw {v}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("not connected to broker")]
    NotConnected,
    #[error("command is not serializable: {0}")]
    Serialize(serde_json::Error),
    #[error("publish failed: {0}")]
    Client(#[from] rumqttc::ClientError),
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire(cmd: &Command) -> serde_json::Value {
        serde_json::from_slice(&cmd.to_payload().unwrap()).unwrap()
    }

    #[test]
    fn toggles_serialize_flat() {
        assert_eq!(wire(&Command::AutoMode { auto_mode: true }), json!({"autoMode": true}));
        assert_eq!(
            wire(&Command::Pump { pump_running: false }),
            json!({"pumpRunning": false})
        );
        assert_eq!(
            wire(&Command::PhAdjustment { ph_adjustment: true }),
            json!({"phAdjustment": true})
        );
        assert_eq!(
            wire(&Command::CalibrateSensors { calibrate_sensors: true }),
            json!({"calibrateSensors": true})
        );
    }

    #[test]
    fn threshold_updates_carry_flag() {
        assert_eq!(
            wire(&Command::light_threshold(650.0)),
            json!({"lightThreshold": 650.0, "lightThresholdUpdate": true})
        );
        assert_eq!(
            wire(&Command::ph_target(6.2)),
            json!({"pHTarget": 6.2, "pHTargetUpdate": true})
        );
    }

    #[test]
    fn raw_passes_through() {
        let v = json!({"mixPump": true, "durationMs": 1000});
        assert_eq!(wire(&Command::Raw(v.clone())), v);
    }

    #[test]
    fn from_value_recognises_known_shapes() {
        assert_eq!(
            Command::from_value(json!({"pumpRunning": true})),
            Command::Pump { pump_running: true }
        );
        assert_eq!(
            Command::from_value(json!({"calibrateSensors": true})),
            Command::CalibrateSensors { calibrate_sensors: true }
        );
        assert_eq!(
            Command::from_value(json!({"pHTarget": 6.1, "pHTargetUpdate": true})),
            Command::ph_target(6.1)
        );
        assert_eq!(
            Command::from_value(json!({"lightThreshold": 400, "lightThresholdUpdate": true})),
            Command::light_threshold(400.0)
        );
    }

    #[test]
    fn from_value_falls_back_to_raw() {
        for v in [
            json!({"autoMode": "yes"}),
            json!({"autoMode": true, "pumpRunning": true}),
            json!({"lightThreshold": 400}),
            json!([1, 2]),
            json!("reboot"),
        ] {
            assert_eq!(Command::from_value(v.clone()), Command::Raw(v));
        }
    }

    #[test]
    fn describe_is_short() {
        assert_eq!(Command::AutoMode { auto_mode: false }.describe(), "autoMode=false");
        assert_eq!(Command::ph_target(5.8).describe(), "pHTarget=5.8");
    }
}
