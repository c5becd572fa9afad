//! Parsing of core-command responses into compact summaries for the
//! peripheral

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::Envelope;
use crate::error::{BleSrvError, Result};

/// One device with the commands that carry resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub device_name: String,
    pub profile_name: String,
    pub commands: Vec<CommandInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInfo {
    pub name: String,
    pub resource_names: Vec<String>,
}

/// First reading of an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingSummary {
    pub resource_name: String,
    pub value: String,
    pub value_type: String,
    pub source_name: String,
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Devices and their resource-carrying commands from an all-devices
/// command query response. Commands without resources, and devices
/// left without commands, are skipped.
pub fn extract_profile_and_resources(envelope: &Envelope) -> Result<Vec<ResourceInfo>> {
    let payload = envelope.payload_json()?;
    let devices = payload
        .get("deviceCoreCommands")
        .and_then(Value::as_array)
        .ok_or_else(|| BleSrvError::serialization("deviceCoreCommands missing or not a list"))?;

    let infos = devices
        .iter()
        .filter(|device| device.is_object())
        .filter_map(|device| {
            let commands: Vec<CommandInfo> = device
                .get("coreCommands")
                .and_then(Value::as_array)?
                .iter()
                .filter_map(|command| {
                    let resource_names: Vec<String> = command
                        .get("parameters")
                        .and_then(Value::as_array)?
                        .iter()
                        .filter_map(|p| p.get("resourceName").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect();
                    (!resource_names.is_empty()).then(|| CommandInfo {
                        name: str_field(command, "name"),
                        resource_names,
                    })
                })
                .collect();

            (!commands.is_empty()).then(|| ResourceInfo {
                device_name: str_field(device, "deviceName"),
                profile_name: str_field(device, "profileName"),
                commands,
            })
        })
        .collect();

    Ok(infos)
}

/// Summary of `event.readings[0]` in a reading response
pub fn parse_reading(envelope: &Envelope) -> Result<ReadingSummary> {
    let payload = envelope.payload_json()?;
    let event = payload
        .get("event")
        .filter(|e| e.is_object())
        .ok_or_else(|| BleSrvError::serialization("event missing or wrong type"))?;

    let first = event
        .get("readings")
        .and_then(Value::as_array)
        .and_then(|readings| readings.first())
        .ok_or_else(|| BleSrvError::serialization("readings missing or empty"))?;
    if !first.is_object() {
        return Err(BleSrvError::serialization("invalid reading format"));
    }

    let value = match first.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    Ok(ReadingSummary {
        resource_name: str_field(first, "resourceName"),
        value,
        value_type: str_field(first, "valueType"),
        source_name: str_field(event, "sourceName"),
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde_json::json;

    fn all_devices() -> Value {
        json!({
            "apiVersion": "v3",
            "statusCode": 200,
            "deviceCoreCommands": [
                {
                    "deviceName": "Random-Integer-Device",
                    "profileName": "Random-Integer-Device",
                    "coreCommands": [
                        {
                            "name": "Int8",
                            "get": true,
                            "parameters": [
                                {"resourceName": "Int8", "valueType": "Int8"}
                            ]
                        },
                        {"name": "NoParams", "parameters": []}
                    ]
                },
                {
                    "deviceName": "Empty-Device",
                    "profileName": "Nothing",
                    "coreCommands": [{"name": "Bare"}]
                },
                "not-a-device"
            ]
        })
    }

    #[test]
    fn test_extract_skips_commands_without_resources() {
        let envelope = Envelope::new(all_devices());
        let infos = extract_profile_and_resources(&envelope).unwrap();
        assert_eq!(
            infos,
            vec![ResourceInfo {
                device_name: "Random-Integer-Device".to_string(),
                profile_name: "Random-Integer-Device".to_string(),
                commands: vec![CommandInfo {
                    name: "Int8".to_string(),
                    resource_names: vec!["Int8".to_string()],
                }],
            }]
        );
        let wire = serde_json::to_value(&infos).unwrap();
        assert_eq!(wire[0]["commands"][0]["resourceNames"], json!(["Int8"]));
    }

    #[test]
    fn test_extract_accepts_string_payload() {
        let envelope = Envelope::new(Value::String(all_devices().to_string()));
        assert_eq!(extract_profile_and_resources(&envelope).unwrap().len(), 1);
    }

    #[test]
    fn test_extract_requires_device_list() {
        let envelope = Envelope::new(json!({"statusCode": 404}));
        assert!(extract_profile_and_resources(&envelope).is_err());
    }

    #[test]
    fn test_parse_reading_first_entry() {
        let envelope = Envelope::new(json!({
            "event": {
                "sourceName": "Int8",
                "readings": [
                    {"resourceName": "Int8", "value": "-42", "valueType": "Int8"},
                    {"resourceName": "Int8", "value": "7", "valueType": "Int8"}
                ]
            }
        }));
        assert_eq!(
            parse_reading(&envelope).unwrap(),
            ReadingSummary {
                resource_name: "Int8".to_string(),
                value: "-42".to_string(),
                value_type: "Int8".to_string(),
                source_name: "Int8".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_reading_errors() {
        let no_event = Envelope::new(json!({"statusCode": 200}));
        assert!(parse_reading(&no_event).is_err());
        let empty = Envelope::new(json!({"event": {"readings": []}}));
        assert!(parse_reading(&empty).is_err());
        let bad = Envelope::new(json!({"event": {"readings": [5]}}));
        assert!(parse_reading(&bad).is_err());
    }
}
