//! Neutral wire message model, shared by the HTTP JSON surface and the gRPC
//! surface (which converts to/from the prost-generated mirror of these
//! types).
//!
//! Serialization skips unset fields so responses never grow fields the
//! request did not specify.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Element type of a [`GenericTensor`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "DT_UINT8")]
    Uint8,
    #[serde(rename = "DT_INT8")]
    Int8,
    #[serde(rename = "DT_INT16")]
    Int16,
    #[serde(rename = "DT_INT32")]
    Int32,
    #[serde(rename = "DT_INT64")]
    Int64,
    #[serde(rename = "DT_FLOAT16")]
    Float16,
    #[default]
    #[serde(rename = "DT_FLOAT32")]
    Float32,
    #[serde(rename = "DT_FLOAT64")]
    Float64,
    #[serde(rename = "DT_STRING")]
    String,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Uint8 => "DT_UINT8",
            DataType::Int8 => "DT_INT8",
            DataType::Int16 => "DT_INT16",
            DataType::Int32 => "DT_INT32",
            DataType::Int64 => "DT_INT64",
            DataType::Float16 => "DT_FLOAT16",
            DataType::Float32 => "DT_FLOAT32",
            DataType::Float64 => "DT_FLOAT64",
            DataType::String => "DT_STRING",
        }
    }
}

/// Neutral tensor representation. Exactly one `flat_*` array is populated and
/// its length equals the product of `shape`; the tensor bridge enforces both.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenericTensor {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub dtype: DataType,
    pub shape: Vec<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flat_uint8: Vec<u8>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flat_int8: Vec<i8>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flat_int16: Vec<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flat_int32: Vec<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flat_int64: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flat_float16: Vec<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flat_float32: Vec<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flat_float64: Vec<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flat_string: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenericTensorList {
    pub tensors: Vec<GenericTensor>,
}

/// Heterogeneous typed map payload.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GMap {
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub s_s: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub s_b: HashMap<String, Vec<u8>>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub s_i32: HashMap<String, i32>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub s_i64: HashMap<String, i64>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub s_f: HashMap<String, f32>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub s_d: HashMap<String, f64>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub s_t: HashMap<String, GenericTensor>,
}

impl GMap {
    pub fn is_empty(&self) -> bool {
        self.s_s.is_empty()
            && self.s_b.is_empty()
            && self.s_i32.is_empty()
            && self.s_i64.is_empty()
            && self.s_f.is_empty()
            && self.s_d.is_empty()
            && self.s_t.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusFlag {
    #[default]
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILURE")]
    Failure,
}

/// Response status. Never set on requests.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpsStatus {
    pub code: i32,
    pub msg: String,
    pub status: StatusFlag,
}

impl GrpsStatus {
    pub fn ok() -> Self {
        Self {
            code: 200,
            msg: "OK".into(),
            status: StatusFlag::Success,
        }
    }

    pub fn failure(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            status: StatusFlag::Failure,
        }
    }
}

/// The wire message carried by every predict and metadata call, in both
/// directions. Any non-empty subset of fields may be set.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpsMessage {
    /// Pipeline-bypass model selector, `name-version`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<GrpsStatus>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub str_data: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bin_data: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gtensors: Option<GenericTensorList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gmap: Option<GMap>,
}

impl GrpsMessage {
    pub fn from_str_data(data: impl Into<String>) -> Self {
        Self {
            str_data: data.into(),
            ..Default::default()
        }
    }

    pub fn from_bin_data(data: Vec<u8>) -> Self {
        Self {
            bin_data: data,
            ..Default::default()
        }
    }

    pub fn from_status(status: GrpsStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn from_tensors(tensors: Vec<GenericTensor>) -> Self {
        Self {
            gtensors: Some(GenericTensorList { tensors }),
            ..Default::default()
        }
    }

    pub fn tensors(&self) -> &[GenericTensor] {
        self.gtensors.as_ref().map(|t| t.tensors.as_slice()).unwrap_or(&[])
    }

    /// Stamp `{200, OK, SUCCESS}` unless a failure status is already present.
    pub fn stamp_ok(&mut self) {
        match &self.status {
            Some(status) if status.status == StatusFlag::Failure => {}
            _ => self.status = Some(GrpsStatus::ok()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_are_skipped() {
        let msg = GrpsMessage::from_str_data("hello grps.");
        let json = serde_json::to_value(&msg).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert_eq!(obj["str_data"], "hello grps.");
    }

    #[test]
    fn status_injection_keeps_failure() {
        let mut msg = GrpsMessage::from_status(GrpsStatus::failure(500, "boom"));
        msg.stamp_ok();
        assert_eq!(msg.status.as_ref().unwrap().code, 500);

        let mut msg = GrpsMessage::from_str_data("x");
        msg.stamp_ok();
        let status = msg.status.unwrap();
        assert_eq!(status.code, 200);
        assert_eq!(status.status, StatusFlag::Success);
    }

    #[test]
    fn dtype_names_round_trip() {
        for dtype in [
            DataType::Uint8,
            DataType::Int8,
            DataType::Int16,
            DataType::Int32,
            DataType::Int64,
            DataType::Float16,
            DataType::Float32,
            DataType::Float64,
            DataType::String,
        ] {
            let json = serde_json::to_string(&dtype).unwrap();
            assert_eq!(json, format!("\"{}\"", dtype.as_str()));
            let back: DataType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, dtype);
        }
    }

    #[test]
    fn gtensor_json_parses() {
        let body = r#"{"gtensors":{"tensors":[
            {"name":"inp","dtype":"DT_FLOAT32","shape":[2,2],"flat_float32":[1,2,3,4]}
        ]}}"#;
        let msg: GrpsMessage = serde_json::from_str(body).unwrap();
        let tensors = msg.tensors();
        assert_eq!(tensors.len(), 1);
        assert_eq!(tensors[0].dtype, DataType::Float32);
        assert_eq!(tensors[0].flat_float32, vec![1.0, 2.0, 3.0, 4.0]);
    }
}
