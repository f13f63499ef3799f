use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    UpdateInterval,
    StartTraining,
    StopTraining,
    Shutdown,
    #[default]
    Ack,
}

/// A queued device command, JSON-encoded in the per-device command list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl DeviceCommand {
    pub fn new(kind: CommandKind) -> Self {
        DeviceCommand {
            kind,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: &str, value: impl Into<String>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_json_uses_type_tag() {
        let cmd = DeviceCommand::new(CommandKind::StartTraining).with_parameter("round", "3");
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "start_training");
        assert_eq!(json["parameters"]["round"], "3");

        let back: DeviceCommand = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn ack_without_parameters_is_compact() {
        let json = serde_json::to_string(&DeviceCommand::new(CommandKind::Ack)).unwrap();
        assert_eq!(json, r#"{"type":"ack"}"#);
    }
}
