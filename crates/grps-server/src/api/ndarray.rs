//! `ndarray` request/response sugar: nested numeric JSON arrays ⇄ a single
//! float32 generic tensor.

use serde_json::Value;

use grps_core::error::GrpsError;
use grps_core::message::{DataType, GenericTensor};

/// Parse a nested numeric array into one float32 tensor. Ragged nesting and
/// non-numeric leaves are errors.
pub fn json_to_tensor(value: &Value) -> Result<GenericTensor, GrpsError> {
    let mut shape: Vec<i32> = Vec::new();
    let mut cursor = value;
    loop {
        match cursor {
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(GrpsError::BadRequest("ndarray has an empty axis".into()));
                }
                shape.push(items.len() as i32);
                cursor = &items[0];
            }
            Value::Number(_) => break,
            other => {
                return Err(GrpsError::BadRequest(format!(
                    "ndarray must nest numbers, got {other}"
                )))
            }
        }
    }

    let mut flat = Vec::new();
    collect(value, 0, &shape, &mut flat)?;
    Ok(GenericTensor {
        dtype: DataType::Float32,
        shape,
        flat_float32: flat,
        ..Default::default()
    })
}

fn collect(
    value: &Value,
    depth: usize,
    shape: &[i32],
    flat: &mut Vec<f32>,
) -> Result<(), GrpsError> {
    match value {
        Value::Array(items) => {
            if depth >= shape.len() || items.len() != shape[depth] as usize {
                return Err(GrpsError::BadRequest("ndarray is ragged".into()));
            }
            for item in items {
                collect(item, depth + 1, shape, flat)?;
            }
            Ok(())
        }
        Value::Number(number) => {
            if depth != shape.len() {
                return Err(GrpsError::BadRequest("ndarray is ragged".into()));
            }
            let value = number
                .as_f64()
                .ok_or_else(|| GrpsError::BadRequest("ndarray holds a non-finite number".into()))?;
            flat.push(value as f32);
            Ok(())
        }
        other => Err(GrpsError::BadRequest(format!(
            "ndarray must nest numbers, got {other}"
        ))),
    }
}

/// Render a float32 tensor back into nested JSON arrays.
pub fn tensor_to_json(tensor: &GenericTensor) -> Value {
    fn build(flat: &[f32], shape: &[i32]) -> Value {
        match shape {
            [] => flat
                .first()
                .map(|&v| Value::from(v))
                .unwrap_or(Value::Null),
            [_n] => Value::Array(flat.iter().map(|&v| Value::from(v)).collect()),
            [n, rest @ ..] => {
                let chunk: usize = rest.iter().map(|&d| d as usize).product();
                Value::Array(
                    (0..*n as usize)
                        .map(|i| build(&flat[i * chunk..(i + 1) * chunk], rest))
                        .collect(),
                )
            }
        }
    }
    build(&tensor.flat_float32, &tensor.shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_array_round_trips() {
        let value = json!([[1, 2, 3], [4, 5, 6]]);
        let tensor = json_to_tensor(&value).unwrap();
        assert_eq!(tensor.dtype, DataType::Float32);
        assert_eq!(tensor.shape, vec![2, 3]);
        assert_eq!(tensor.flat_float32, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let back = tensor_to_json(&tensor);
        assert_eq!(back, json!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]));
    }

    #[test]
    fn ragged_array_is_rejected() {
        assert!(json_to_tensor(&json!([[1, 2], [3]])).is_err());
        assert!(json_to_tensor(&json!(["a", "b"])).is_err());
        assert!(json_to_tensor(&json!([[], []])).is_err());
    }
}
