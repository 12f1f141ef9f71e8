//! Universal command and response types.
//!
//! [`SerializedCommand`] is the one instruction format that flows from the
//! script runtime through a worker proxy, over the IPC frame queue, into a
//! worker process and finally into a driver plugin. [`CommandResponse`]
//! travels the same path in reverse and is correlated back to its command by
//! message id, not arrival order.
//!
//! Values are carried as [`ParamValue`], a closed sum type whose JSON wire
//! form is `{"type": <tag>, "value": <payload>}` so that typing survives the
//! cross-process round trip. Unknown tags degrade to `ParamValue::None`
//! rather than failing the whole message.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default command timeout when a caller does not specify one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// ParamValue
// =============================================================================

/// Typed parameter value carried by commands and responses.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    None,
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    F64Array(Vec<f64>),
    I32Array(Vec<i32>),
}

impl ParamValue {
    /// Wire tag written into the JSON `type` field.
    pub fn type_tag(&self) -> &'static str {
        match self {
            ParamValue::None => "none",
            ParamValue::I32(_) => "i32",
            ParamValue::I64(_) => "i64",
            ParamValue::U32(_) => "u32",
            ParamValue::U64(_) => "u64",
            ParamValue::F32(_) => "f32",
            ParamValue::F64(_) => "f64",
            ParamValue::Bool(_) => "bool",
            ParamValue::Str(_) => "string",
            ParamValue::Bytes(_) => "bytes",
            ParamValue::F64Array(_) => "f64_array",
            ParamValue::I32Array(_) => "i32_array",
        }
    }

    /// Best-effort conversion from an untyped JSON value, used at boundaries
    /// (RPC params, `test` command key=value pairs) where no tag is present.
    pub fn from_untyped_json(value: &serde_json::Value) -> ParamValue {
        match value {
            serde_json::Value::Null => ParamValue::None,
            serde_json::Value::Bool(b) => ParamValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ParamValue::I64(i)
                } else {
                    ParamValue::F64(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => ParamValue::Str(s.clone()),
            serde_json::Value::Array(items) => {
                if items.iter().all(|v| v.is_i64()) {
                    ParamValue::I32Array(
                        items
                            .iter()
                            .filter_map(|v| v.as_i64())
                            .map(|v| v as i32)
                            .collect(),
                    )
                } else {
                    ParamValue::F64Array(
                        items.iter().filter_map(serde_json::Value::as_f64).collect(),
                    )
                }
            }
            other => ParamValue::Str(other.to_string()),
        }
    }

    /// Untyped JSON projection, used when reporting results to callers that
    /// do not care about exact integer widths.
    pub fn to_untyped_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            ParamValue::None => serde_json::Value::Null,
            ParamValue::I32(v) => json!(v),
            ParamValue::I64(v) => json!(v),
            ParamValue::U32(v) => json!(v),
            ParamValue::U64(v) => json!(v),
            ParamValue::F32(v) => json!(v),
            ParamValue::F64(v) => json!(v),
            ParamValue::Bool(v) => json!(v),
            ParamValue::Str(v) => json!(v),
            ParamValue::Bytes(v) => json!(v),
            ParamValue::F64Array(v) => json!(v),
            ParamValue::I32Array(v) => json!(v),
        }
    }
}

impl Serialize for ParamValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("ParamValue", 2)?;
        s.serialize_field("type", self.type_tag())?;
        match self {
            ParamValue::None => s.serialize_field("value", &serde_json::Value::Null)?,
            ParamValue::I32(v) => s.serialize_field("value", v)?,
            ParamValue::I64(v) => s.serialize_field("value", v)?,
            ParamValue::U32(v) => s.serialize_field("value", v)?,
            ParamValue::U64(v) => s.serialize_field("value", v)?,
            ParamValue::F32(v) => s.serialize_field("value", v)?,
            ParamValue::F64(v) => s.serialize_field("value", v)?,
            ParamValue::Bool(v) => s.serialize_field("value", v)?,
            ParamValue::Str(v) => s.serialize_field("value", v)?,
            ParamValue::Bytes(v) => s.serialize_field("value", v)?,
            ParamValue::F64Array(v) => s.serialize_field("value", v)?,
            ParamValue::I32Array(v) => s.serialize_field("value", v)?,
        }
        s.end()
    }
}

impl<'de> Deserialize<'de> for ParamValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Tagged {
            #[serde(rename = "type")]
            tag: String,
            #[serde(default)]
            value: serde_json::Value,
        }

        let Tagged { tag, value } = Tagged::deserialize(deserializer)?;
        let parse = |msg: &str| D::Error::custom(format!("bad {tag} value: {msg}"));
        Ok(match tag.as_str() {
            "none" => ParamValue::None,
            "i32" => ParamValue::I32(
                serde_json::from_value(value).map_err(|e| parse(&e.to_string()))?,
            ),
            "i64" => ParamValue::I64(
                serde_json::from_value(value).map_err(|e| parse(&e.to_string()))?,
            ),
            "u32" => ParamValue::U32(
                serde_json::from_value(value).map_err(|e| parse(&e.to_string()))?,
            ),
            "u64" => ParamValue::U64(
                serde_json::from_value(value).map_err(|e| parse(&e.to_string()))?,
            ),
            "f32" => ParamValue::F32(
                serde_json::from_value(value).map_err(|e| parse(&e.to_string()))?,
            ),
            "f64" => ParamValue::F64(
                serde_json::from_value(value).map_err(|e| parse(&e.to_string()))?,
            ),
            "bool" => ParamValue::Bool(
                serde_json::from_value(value).map_err(|e| parse(&e.to_string()))?,
            ),
            "string" => ParamValue::Str(
                serde_json::from_value(value).map_err(|e| parse(&e.to_string()))?,
            ),
            "bytes" => ParamValue::Bytes(
                serde_json::from_value(value).map_err(|e| parse(&e.to_string()))?,
            ),
            "f64_array" => ParamValue::F64Array(
                serde_json::from_value(value).map_err(|e| parse(&e.to_string()))?,
            ),
            "i32_array" => ParamValue::I32Array(
                serde_json::from_value(value).map_err(|e| parse(&e.to_string()))?,
            ),
            // Unknown tags from newer peers degrade to the unit variant.
            _ => ParamValue::None,
        })
    }
}

mod serde_millis {
    //! `Duration` as an integer millisecond count (`timeout_ms` on the wire).
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// =============================================================================
// SerializedCommand
// =============================================================================

/// Universal instruction format.
///
/// Works both for template-driven wire protocols (SCPI strings) and for
/// native driver function calls; the plugin decides what `verb` means.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedCommand {
    /// Unique instruction id, assigned by the daemon as
    /// `<instrument>-<message id>` just before dispatch.
    pub id: String,
    /// Target instrument (unique within the registry).
    pub instrument_name: String,
    /// Command name, e.g. `SET_VOLTAGE` or `MEASURE_VOLTAGE`.
    pub verb: String,

    #[serde(default)]
    pub params: HashMap<String, ParamValue>,

    #[serde(rename = "timeout_ms", with = "serde_millis")]
    pub timeout: Duration,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub expects_response: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,

    /// Channel routing hints for multi-channel instruments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_number: Option<i32>,

    /// Set only for commands issued inside a parallel block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_token: Option<u64>,

    /// Monotonic creation timestamp; re-stamped on deserialization.
    #[serde(skip, default = "Instant::now")]
    pub created_at: Instant,
}

impl SerializedCommand {
    pub fn new(instrument_name: impl Into<String>, verb: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            instrument_name: instrument_name.into(),
            verb: verb.into(),
            params: HashMap::new(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            priority: 0,
            expects_response: false,
            return_type: None,
            channel_group: None,
            channel_number: None,
            sync_token: None,
            created_at: Instant::now(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: ParamValue) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

// =============================================================================
// CommandResponse
// =============================================================================

/// Reference to a bulk payload parked in the buffer pool instead of the
/// fixed-size IPC frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LargeDataRef {
    pub buffer_id: String,
    pub element_count: u64,
    pub data_type: String,
}

/// Response from command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command_id: String,
    pub instrument_name: String,
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<ParamValue>,

    #[serde(default)]
    pub text_response: String,

    /// Bulk data parked in the buffer pool, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_data: Option<LargeDataRef>,

    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error_message: String,

    #[serde(skip, default = "Instant::now")]
    pub started: Instant,
    #[serde(skip, default = "Instant::now")]
    pub finished: Instant,
}

impl CommandResponse {
    /// Synthetic failure response, used for IPC timeouts and worker death.
    pub fn failure(
        command_id: impl Into<String>,
        instrument_name: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            instrument_name: instrument_name.into(),
            success: false,
            return_value: None,
            text_response: String::new(),
            large_data: None,
            error_code: 0,
            error_message: error_message.into(),
            started: Instant::now(),
            finished: Instant::now(),
        }
    }

    pub fn duration(&self) -> Duration {
        self.finished.saturating_duration_since(self.started)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_value_round_trips_with_type_tag() {
        let values = vec![
            ParamValue::None,
            ParamValue::I32(-7),
            ParamValue::I64(1 << 40),
            ParamValue::U64(u64::MAX),
            ParamValue::F64(10.0),
            ParamValue::Bool(true),
            ParamValue::Str("IDN?".to_string()),
            ParamValue::Bytes(vec![0, 255, 3]),
            ParamValue::F64Array(vec![1.5, 2.5]),
            ParamValue::I32Array(vec![-1, 0, 1]),
        ];
        for v in values {
            let json = serde_json::to_string(&v).unwrap();
            let back: ParamValue = serde_json::from_str(&json).unwrap();
            assert_eq!(back, v, "round-trip of {json}");
        }
    }

    #[test]
    fn unknown_type_tag_degrades_to_none() {
        let back: ParamValue =
            serde_json::from_str(r#"{"type":"complex128","value":[1.0,2.0]}"#).unwrap();
        assert_eq!(back, ParamValue::None);
    }

    #[test]
    fn command_round_trip_preserves_fields() {
        let cmd = SerializedCommand {
            id: "t-1".to_string(),
            sync_token: Some(42),
            expects_response: true,
            return_type: Some("f64".to_string()),
            channel_group: Some("A".to_string()),
            channel_number: Some(3),
            ..SerializedCommand::new("DMM1", "MEASURE_VOLTAGE")
        }
        .with_param("range", ParamValue::F64(10.0))
        .with_param("samples", ParamValue::I64(100));

        let json = cmd.to_json().unwrap();
        let back = SerializedCommand::from_json(&json).unwrap();

        assert_eq!(back.id, "t-1");
        assert_eq!(back.instrument_name, "DMM1");
        assert_eq!(back.verb, "MEASURE_VOLTAGE");
        assert_eq!(back.timeout, Duration::from_secs(5));
        assert_eq!(back.sync_token, Some(42));
        assert!(back.expects_response);
        assert_eq!(back.return_type.as_deref(), Some("f64"));
        assert_eq!(back.channel_group.as_deref(), Some("A"));
        assert_eq!(back.channel_number, Some(3));
        assert_eq!(back.params["range"], ParamValue::F64(10.0));
        assert_eq!(back.params["samples"], ParamValue::I64(100));
    }

    #[test]
    fn response_round_trip_preserves_large_data_ref() {
        let mut resp = CommandResponse::failure("DMM1-9", "DMM1", "");
        resp.success = true;
        resp.error_message.clear();
        resp.return_value = Some(ParamValue::Str("ok".to_string()));
        resp.large_data = Some(LargeDataRef {
            buffer_id: "buffer_170000_1".to_string(),
            element_count: 2048,
            data_type: "f32".to_string(),
        });

        let json = resp.to_json().unwrap();
        let back = CommandResponse::from_json(&json).unwrap();
        assert!(back.success);
        assert_eq!(back.command_id, "DMM1-9");
        assert_eq!(back.return_value, Some(ParamValue::Str("ok".to_string())));
        assert_eq!(back.large_data, resp.large_data);
    }
}
