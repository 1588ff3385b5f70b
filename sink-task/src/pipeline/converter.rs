use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;

use crate::kafka::types::RawHeader;
use crate::pipeline::record::{Schema, SchemaAndValue, Value};

/// Turns serialized key or value bytes into structured data.
pub trait Converter: Send + Sync {
    fn to_connect_data(
        &self,
        topic: &str,
        headers: &[RawHeader],
        value: Option<&[u8]>,
    ) -> anyhow::Result<SchemaAndValue>;
}

pub trait HeaderConverter: Send + Sync {
    fn to_connect_header(
        &self,
        topic: &str,
        key: &str,
        value: Option<&[u8]>,
    ) -> anyhow::Result<SchemaAndValue>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StringConverter;

impl Converter for StringConverter {
    fn to_connect_data(
        &self,
        topic: &str,
        _headers: &[RawHeader],
        value: Option<&[u8]>,
    ) -> anyhow::Result<SchemaAndValue> {
        let Some(bytes) = value else {
            return Ok(SchemaAndValue::null());
        };
        let s = std::str::from_utf8(bytes)
            .with_context(|| format!("record from {topic} is not valid utf-8"))?;
        Ok(SchemaAndValue::new(Schema::String, Value::String(s.to_owned())))
    }
}

impl HeaderConverter for StringConverter {
    fn to_connect_header(
        &self,
        topic: &str,
        _key: &str,
        value: Option<&[u8]>,
    ) -> anyhow::Result<SchemaAndValue> {
        self.to_connect_data(topic, &[], value)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ByteArrayConverter;

impl Converter for ByteArrayConverter {
    fn to_connect_data(
        &self,
        _topic: &str,
        _headers: &[RawHeader],
        value: Option<&[u8]>,
    ) -> anyhow::Result<SchemaAndValue> {
        Ok(match value {
            Some(bytes) => SchemaAndValue::new(Schema::Bytes, Value::Bytes(bytes.to_vec())),
            None => SchemaAndValue::null(),
        })
    }
}

impl HeaderConverter for ByteArrayConverter {
    fn to_connect_header(
        &self,
        topic: &str,
        _key: &str,
        value: Option<&[u8]>,
    ) -> anyhow::Result<SchemaAndValue> {
        self.to_connect_data(topic, &[], value)
    }
}

/// Schemaless JSON. Scalars map onto their own schema, objects and arrays
/// stay as `Value::Json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

impl JsonConverter {
    fn from_json(json: serde_json::Value) -> SchemaAndValue {
        match json {
            serde_json::Value::Null => SchemaAndValue::null(),
            serde_json::Value::Bool(b) => SchemaAndValue::new(Schema::Boolean, Value::Boolean(b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => SchemaAndValue::new(Schema::Int64, Value::Int64(i)),
                None => SchemaAndValue::new(
                    Schema::Float64,
                    Value::Float64(n.as_f64().unwrap_or(f64::NAN)),
                ),
            },
            serde_json::Value::String(s) => SchemaAndValue::new(Schema::String, Value::String(s)),
            other => SchemaAndValue::new(Schema::Json, Value::Json(other)),
        }
    }
}

impl Converter for JsonConverter {
    fn to_connect_data(
        &self,
        topic: &str,
        _headers: &[RawHeader],
        value: Option<&[u8]>,
    ) -> anyhow::Result<SchemaAndValue> {
        let Some(bytes) = value else {
            return Ok(SchemaAndValue::null());
        };
        let json: serde_json::Value = serde_json::from_slice(bytes)
            .with_context(|| format!("record from {topic} is not valid json"))?;
        Ok(Self::from_json(json))
    }
}

impl HeaderConverter for JsonConverter {
    fn to_connect_header(
        &self,
        topic: &str,
        _key: &str,
        value: Option<&[u8]>,
    ) -> anyhow::Result<SchemaAndValue> {
        self.to_connect_data(topic, &[], value)
    }
}

/// Header converter that infers booleans and numbers from their string form,
/// falling back to a string, or to raw bytes when the value is not utf-8.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleHeaderConverter;

impl HeaderConverter for SimpleHeaderConverter {
    fn to_connect_header(
        &self,
        _topic: &str,
        _key: &str,
        value: Option<&[u8]>,
    ) -> anyhow::Result<SchemaAndValue> {
        let Some(bytes) = value else {
            return Ok(SchemaAndValue::null());
        };
        let Ok(s) = std::str::from_utf8(bytes) else {
            return Ok(SchemaAndValue::new(Schema::Bytes, Value::Bytes(bytes.to_vec())));
        };
        if let Ok(b) = s.parse::<bool>() {
            return Ok(SchemaAndValue::new(Schema::Boolean, Value::Boolean(b)));
        }
        if let Ok(i) = s.parse::<i64>() {
            return Ok(SchemaAndValue::new(Schema::Int64, Value::Int64(i)));
        }
        if let Ok(f) = s.parse::<f64>() {
            if f.is_finite() {
                return Ok(SchemaAndValue::new(Schema::Float64, Value::Float64(f)));
            }
        }
        Ok(SchemaAndValue::new(Schema::String, Value::String(s.to_owned())))
    }
}

/// Converter selection by name, as used in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverterKind {
    String,
    ByteArray,
    Json,
    Simple,
}

impl FromStr for ConverterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "string" => Ok(ConverterKind::String),
            "bytes" | "bytearray" => Ok(ConverterKind::ByteArray),
            "json" => Ok(ConverterKind::Json),
            "simple" => Ok(ConverterKind::Simple),
            other => Err(format!("unknown converter: {other}")),
        }
    }
}

impl ConverterKind {
    /// `Simple` only exists for headers; as a data converter it behaves like `String`.
    pub fn converter(self) -> Arc<dyn Converter> {
        match self {
            ConverterKind::String | ConverterKind::Simple => Arc::new(StringConverter),
            ConverterKind::ByteArray => Arc::new(ByteArrayConverter),
            ConverterKind::Json => Arc::new(JsonConverter),
        }
    }

    pub fn header_converter(self) -> Arc<dyn HeaderConverter> {
        match self {
            ConverterKind::String => Arc::new(StringConverter),
            ConverterKind::ByteArray => Arc::new(ByteArrayConverter),
            ConverterKind::Json => Arc::new(JsonConverter),
            ConverterKind::Simple => Arc::new(SimpleHeaderConverter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn string_converter_maps_missing_bytes_to_null() {
        let converted = StringConverter.to_connect_data("t", &[], None).unwrap();
        assert!(converted.is_null());
        assert_eq!(converted.schema, None);
    }

    #[test]
    fn string_converter_rejects_invalid_utf8() {
        let err = StringConverter
            .to_connect_data("t", &[], Some(&[0xff, 0xfe]))
            .unwrap_err();
        assert!(format!("{err:#}").contains("not valid utf-8"));
    }

    #[test]
    fn json_converter_keeps_objects_whole() {
        let converted = JsonConverter
            .to_connect_data("t", &[], Some(br#"{"a":1}"#))
            .unwrap();
        assert_eq!(converted.schema, Some(Schema::Json));
        assert_eq!(converted.value, Value::Json(serde_json::json!({"a": 1})));
    }

    #[test_case(b"true", Schema::Boolean, Value::Boolean(true); "boolean")]
    #[test_case(b"42", Schema::Int64, Value::Int64(42); "integer")]
    #[test_case(b"1.5", Schema::Float64, Value::Float64(1.5); "float")]
    #[test_case(b"abc", Schema::String, Value::String("abc".into()); "string")]
    fn simple_header_converter_infers_type(bytes: &[u8], schema: Schema, value: Value) {
        let converted = SimpleHeaderConverter
            .to_connect_header("t", "h", Some(bytes))
            .unwrap();
        assert_eq!(converted, SchemaAndValue::new(schema, value));
    }

    #[test]
    fn converter_kind_parses_config_names() {
        assert_eq!("JSON".parse::<ConverterKind>(), Ok(ConverterKind::Json));
        assert_eq!("bytes".parse::<ConverterKind>(), Ok(ConverterKind::ByteArray));
        assert!("avro".parse::<ConverterKind>().is_err());
    }
}
