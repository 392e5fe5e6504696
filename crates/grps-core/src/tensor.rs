//! Dense storage behind the neutral tensor message.
//!
//! A [`TensorValue`] owns one `ndarray` per supported dtype; the framework
//! converters move data between [`GenericTensor`] wire messages and these
//! values, and the batched converter paths concatenate/split them along the
//! leading axis.

use half::f16;
use ndarray::{concatenate, ArrayD, Axis, IxDyn};

use crate::error::GrpsError;
use crate::message::{DataType, GenericTensor};

#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
    Uint8(ArrayD<u8>),
    Int8(ArrayD<i8>),
    Int16(ArrayD<i16>),
    Int32(ArrayD<i32>),
    Int64(ArrayD<i64>),
    Float16(ArrayD<f16>),
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
    String(ArrayD<String>),
}

fn build<T>(
    name: &str,
    dtype: DataType,
    shape: &[i32],
    flat: Vec<T>,
) -> Result<ArrayD<T>, GrpsError> {
    if shape.iter().any(|&d| d < 0) {
        return Err(GrpsError::BadRequest(format!(
            "tensor {name}: negative dimension in shape {shape:?}"
        )));
    }
    let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
    let expected: usize = dims.iter().product();
    if flat.is_empty() {
        return Err(GrpsError::BadRequest(format!(
            "tensor {name}: {} data is empty",
            dtype.as_str()
        )));
    }
    if flat.len() != expected {
        return Err(GrpsError::BadRequest(format!(
            "tensor {name}: size not match, shape: {shape:?}, expected size: {expected}, \
             actual size: {}",
            flat.len()
        )));
    }
    ArrayD::from_shape_vec(IxDyn(&dims), flat).map_err(GrpsError::internal)
}

impl TensorValue {
    pub fn dtype(&self) -> DataType {
        match self {
            TensorValue::Uint8(_) => DataType::Uint8,
            TensorValue::Int8(_) => DataType::Int8,
            TensorValue::Int16(_) => DataType::Int16,
            TensorValue::Int32(_) => DataType::Int32,
            TensorValue::Int64(_) => DataType::Int64,
            TensorValue::Float16(_) => DataType::Float16,
            TensorValue::Float32(_) => DataType::Float32,
            TensorValue::Float64(_) => DataType::Float64,
            TensorValue::String(_) => DataType::String,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            TensorValue::Uint8(a) => a.shape(),
            TensorValue::Int8(a) => a.shape(),
            TensorValue::Int16(a) => a.shape(),
            TensorValue::Int32(a) => a.shape(),
            TensorValue::Int64(a) => a.shape(),
            TensorValue::Float16(a) => a.shape(),
            TensorValue::Float32(a) => a.shape(),
            TensorValue::Float64(a) => a.shape(),
            TensorValue::String(a) => a.shape(),
        }
    }

    /// Decode a wire tensor. Errors on an empty flat array, a flat array
    /// whose length does not match the shape product, or a negative
    /// dimension.
    pub fn from_generic(gtensor: &GenericTensor) -> Result<Self, GrpsError> {
        let name = gtensor.name.as_str();
        let shape = gtensor.shape.as_slice();
        Ok(match gtensor.dtype {
            DataType::Uint8 => TensorValue::Uint8(build(
                name,
                gtensor.dtype,
                shape,
                gtensor.flat_uint8.clone(),
            )?),
            DataType::Int8 => TensorValue::Int8(build(
                name,
                gtensor.dtype,
                shape,
                gtensor.flat_int8.clone(),
            )?),
            DataType::Int16 => TensorValue::Int16(build(
                name,
                gtensor.dtype,
                shape,
                gtensor.flat_int16.iter().map(|&v| v as i16).collect(),
            )?),
            DataType::Int32 => TensorValue::Int32(build(
                name,
                gtensor.dtype,
                shape,
                gtensor.flat_int32.clone(),
            )?),
            DataType::Int64 => TensorValue::Int64(build(
                name,
                gtensor.dtype,
                shape,
                gtensor.flat_int64.clone(),
            )?),
            DataType::Float16 => TensorValue::Float16(build(
                name,
                gtensor.dtype,
                shape,
                gtensor.flat_float16.iter().map(|&v| f16::from_f32(v)).collect(),
            )?),
            DataType::Float32 => TensorValue::Float32(build(
                name,
                gtensor.dtype,
                shape,
                gtensor.flat_float32.clone(),
            )?),
            DataType::Float64 => TensorValue::Float64(build(
                name,
                gtensor.dtype,
                shape,
                gtensor.flat_float64.clone(),
            )?),
            DataType::String => TensorValue::String(build(
                name,
                gtensor.dtype,
                shape,
                gtensor.flat_string.clone(),
            )?),
        })
    }

    /// Encode back to a wire tensor under the given name.
    pub fn into_generic(self, name: impl Into<String>) -> GenericTensor {
        let mut out = GenericTensor {
            name: name.into(),
            dtype: self.dtype(),
            shape: self.shape().iter().map(|&d| d as i32).collect(),
            ..Default::default()
        };
        match self {
            TensorValue::Uint8(a) => out.flat_uint8 = a.into_raw_vec_and_offset().0,
            TensorValue::Int8(a) => out.flat_int8 = a.into_raw_vec_and_offset().0,
            TensorValue::Int16(a) => {
                out.flat_int16 = a.into_raw_vec_and_offset().0.into_iter().map(i32::from).collect()
            }
            TensorValue::Int32(a) => out.flat_int32 = a.into_raw_vec_and_offset().0,
            TensorValue::Int64(a) => out.flat_int64 = a.into_raw_vec_and_offset().0,
            TensorValue::Float16(a) => {
                out.flat_float16 =
                    a.into_raw_vec_and_offset().0.into_iter().map(f16::to_f32).collect()
            }
            TensorValue::Float32(a) => out.flat_float32 = a.into_raw_vec_and_offset().0,
            TensorValue::Float64(a) => out.flat_float64 = a.into_raw_vec_and_offset().0,
            TensorValue::String(a) => out.flat_string = a.into_raw_vec_and_offset().0,
        }
        out
    }

    /// Concatenate values of one dtype along axis 0.
    pub fn concat_axis0(parts: &[TensorValue]) -> Result<TensorValue, GrpsError> {
        fn cat<T: Clone>(arrays: Vec<&ArrayD<T>>) -> Result<ArrayD<T>, GrpsError> {
            let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
            concatenate(Axis(0), &views).map_err(GrpsError::internal)
        }

        let first = parts
            .first()
            .ok_or_else(|| GrpsError::internal("cannot concatenate zero tensors"))?;
        macro_rules! dispatch {
            ($variant:ident) => {{
                let arrays: Vec<_> = parts
                    .iter()
                    .map(|p| match p {
                        TensorValue::$variant(a) => Ok(a),
                        other => Err(GrpsError::internal(format!(
                            "dtype mismatch in batch: {:?} vs {:?}",
                            other.dtype(),
                            first.dtype()
                        ))),
                    })
                    .collect::<Result<_, _>>()?;
                TensorValue::$variant(cat(arrays)?)
            }};
        }
        Ok(match first {
            TensorValue::Uint8(_) => dispatch!(Uint8),
            TensorValue::Int8(_) => dispatch!(Int8),
            TensorValue::Int16(_) => dispatch!(Int16),
            TensorValue::Int32(_) => dispatch!(Int32),
            TensorValue::Int64(_) => dispatch!(Int64),
            TensorValue::Float16(_) => dispatch!(Float16),
            TensorValue::Float32(_) => dispatch!(Float32),
            TensorValue::Float64(_) => dispatch!(Float64),
            TensorValue::String(_) => dispatch!(String),
        })
    }

    /// Split along axis 0 into chunks of the given leading-dimension sizes.
    /// The sizes must sum to the leading dimension.
    pub fn split_axis0(&self, sizes: &[usize]) -> Result<Vec<TensorValue>, GrpsError> {
        let total: usize = sizes.iter().sum();
        let leading = *self
            .shape()
            .first()
            .ok_or_else(|| GrpsError::internal("cannot split a rank-0 tensor"))?;
        if total != leading {
            return Err(GrpsError::internal(format!(
                "batch sizes {sizes:?} do not sum to leading dimension {leading}"
            )));
        }

        macro_rules! dispatch {
            ($variant:ident, $a:expr) => {{
                let mut out = Vec::with_capacity(sizes.len());
                let mut offset = 0;
                for &size in sizes {
                    let slice = $a
                        .slice_axis(Axis(0), ndarray::Slice::from(offset..offset + size))
                        .to_owned();
                    out.push(TensorValue::$variant(slice));
                    offset += size;
                }
                out
            }};
        }
        Ok(match self {
            TensorValue::Uint8(a) => dispatch!(Uint8, a),
            TensorValue::Int8(a) => dispatch!(Int8, a),
            TensorValue::Int16(a) => dispatch!(Int16, a),
            TensorValue::Int32(a) => dispatch!(Int32, a),
            TensorValue::Int64(a) => dispatch!(Int64, a),
            TensorValue::Float16(a) => dispatch!(Float16, a),
            TensorValue::Float32(a) => dispatch!(Float32, a),
            TensorValue::Float64(a) => dispatch!(Float64, a),
            TensorValue::String(a) => dispatch!(String, a),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::GenericTensor;

    fn gtensor(dtype: DataType) -> GenericTensor {
        let mut t = GenericTensor {
            name: "t".into(),
            dtype,
            shape: vec![2, 3],
            ..Default::default()
        };
        match dtype {
            DataType::Uint8 => t.flat_uint8 = (0..6).collect(),
            DataType::Int8 => t.flat_int8 = (0..6).collect(),
            DataType::Int16 => t.flat_int16 = (0..6).collect(),
            DataType::Int32 => t.flat_int32 = (0..6).collect(),
            DataType::Int64 => t.flat_int64 = (0..6).collect(),
            DataType::Float16 => t.flat_float16 = (0..6).map(|v| v as f32 * 0.5).collect(),
            DataType::Float32 => t.flat_float32 = (0..6).map(|v| v as f32).collect(),
            DataType::Float64 => t.flat_float64 = (0..6).map(|v| v as f64).collect(),
            DataType::String => t.flat_string = (0..6).map(|v| v.to_string()).collect(),
        }
        t
    }

    #[test]
    fn round_trip_every_dtype() {
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
            let original = gtensor(dtype);
            let value = TensorValue::from_generic(&original).unwrap();
            assert_eq!(value.dtype(), dtype);
            assert_eq!(value.shape(), &[2, 3]);
            let back = value.into_generic("t");
            assert_eq!(back, original);
        }
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let mut bad = gtensor(DataType::Float32);
        bad.shape = vec![2, 4];
        let err = TensorValue::from_generic(&bad).unwrap_err();
        assert!(err.to_string().contains("size not match"), "{err}");
    }

    #[test]
    fn empty_flat_is_rejected() {
        let mut bad = gtensor(DataType::Int32);
        bad.flat_int32.clear();
        assert!(TensorValue::from_generic(&bad).is_err());
    }

    #[test]
    fn concat_then_split_restores_parts() {
        let a = TensorValue::from_generic(&gtensor(DataType::Float32)).unwrap();
        let mut second = gtensor(DataType::Float32);
        second.shape = vec![1, 3];
        second.flat_float32 = vec![9.0, 8.0, 7.0];
        let b = TensorValue::from_generic(&second).unwrap();

        let batched = TensorValue::concat_axis0(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(batched.shape(), &[3, 3]);

        let parts = batched.split_axis0(&[2, 1]).unwrap();
        assert_eq!(parts[0], a);
        assert_eq!(parts[1], b);
    }

    #[test]
    fn concat_split_round_trips_every_dtype() {
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
            let a = TensorValue::from_generic(&gtensor(dtype)).unwrap();
            let b = TensorValue::from_generic(&gtensor(dtype)).unwrap();
            let batched = TensorValue::concat_axis0(&[a.clone(), b.clone()]).unwrap();
            assert_eq!(batched.shape(), &[4, 3]);
            let parts = batched.split_axis0(&[2, 2]).unwrap();
            assert_eq!(parts, vec![a, b]);
        }
    }

    #[test]
    fn split_size_mismatch_is_rejected() {
        let a = TensorValue::from_generic(&gtensor(DataType::Float32)).unwrap();
        assert!(a.split_axis0(&[3]).is_err());
    }
}
