//! Conversions between the prost-generated wire types and the native message
//! model in `grps-core`.

use grps_core::message as native;

use super::pb;

pub fn dtype_to_pb(dtype: native::DataType) -> pb::DataType {
    match dtype {
        native::DataType::Uint8 => pb::DataType::DtUint8,
        native::DataType::Int8 => pb::DataType::DtInt8,
        native::DataType::Int16 => pb::DataType::DtInt16,
        native::DataType::Int32 => pb::DataType::DtInt32,
        native::DataType::Int64 => pb::DataType::DtInt64,
        native::DataType::Float16 => pb::DataType::DtFloat16,
        native::DataType::Float32 => pb::DataType::DtFloat32,
        native::DataType::Float64 => pb::DataType::DtFloat64,
        native::DataType::String => pb::DataType::DtString,
    }
}

pub fn dtype_to_native(dtype: pb::DataType) -> native::DataType {
    match dtype {
        pb::DataType::DtUint8 => native::DataType::Uint8,
        pb::DataType::DtInt8 => native::DataType::Int8,
        pb::DataType::DtInt16 => native::DataType::Int16,
        pb::DataType::DtInt32 => native::DataType::Int32,
        pb::DataType::DtInt64 => native::DataType::Int64,
        pb::DataType::DtFloat16 => native::DataType::Float16,
        pb::DataType::DtFloat32 => native::DataType::Float32,
        pb::DataType::DtFloat64 => native::DataType::Float64,
        pb::DataType::DtString => native::DataType::String,
    }
}

pub fn tensor_to_pb(tensor: native::GenericTensor) -> pb::GenericTensor {
    pb::GenericTensor {
        name: tensor.name,
        dtype: dtype_to_pb(tensor.dtype) as i32,
        shape: tensor.shape,
        flat_uint8: tensor.flat_uint8.into_iter().map(u32::from).collect(),
        flat_int8: tensor.flat_int8.into_iter().map(i32::from).collect(),
        flat_int16: tensor.flat_int16,
        flat_int32: tensor.flat_int32,
        flat_int64: tensor.flat_int64,
        flat_float16: tensor.flat_float16,
        flat_float32: tensor.flat_float32,
        flat_float64: tensor.flat_float64,
        flat_string: tensor.flat_string,
    }
}

pub fn tensor_to_native(tensor: pb::GenericTensor) -> native::GenericTensor {
    native::GenericTensor {
        name: tensor.name,
        dtype: dtype_to_native(tensor.dtype.try_into().unwrap_or(pb::DataType::DtFloat32)),
        shape: tensor.shape,
        flat_uint8: tensor.flat_uint8.into_iter().map(|v| v as u8).collect(),
        flat_int8: tensor.flat_int8.into_iter().map(|v| v as i8).collect(),
        flat_int16: tensor.flat_int16,
        flat_int32: tensor.flat_int32,
        flat_int64: tensor.flat_int64,
        flat_float16: tensor.flat_float16,
        flat_float32: tensor.flat_float32,
        flat_float64: tensor.flat_float64,
        flat_string: tensor.flat_string,
    }
}

pub fn status_to_pb(status: native::GrpsStatus) -> pb::GrpsStatus {
    pb::GrpsStatus {
        code: status.code,
        msg: status.msg,
        status: match status.status {
            native::StatusFlag::Success => pb::grps_status::StatusFlag::Success as i32,
            native::StatusFlag::Failure => pb::grps_status::StatusFlag::Failure as i32,
        },
    }
}

pub fn status_to_native(status: pb::GrpsStatus) -> native::GrpsStatus {
    native::GrpsStatus {
        code: status.code,
        msg: status.msg,
        status: match status.status.try_into() {
            Ok(pb::grps_status::StatusFlag::Failure) => native::StatusFlag::Failure,
            _ => native::StatusFlag::Success,
        },
    }
}

pub fn gmap_to_pb(gmap: native::GMap) -> pb::GrpsGMap {
    pb::GrpsGMap {
        s_s: gmap.s_s,
        s_b: gmap.s_b,
        s_i32: gmap.s_i32,
        s_i64: gmap.s_i64,
        s_f: gmap.s_f,
        s_d: gmap.s_d,
        s_t: gmap
            .s_t
            .into_iter()
            .map(|(k, v)| (k, tensor_to_pb(v)))
            .collect(),
    }
}

pub fn gmap_to_native(gmap: pb::GrpsGMap) -> native::GMap {
    native::GMap {
        s_s: gmap.s_s,
        s_b: gmap.s_b,
        s_i32: gmap.s_i32,
        s_i64: gmap.s_i64,
        s_f: gmap.s_f,
        s_d: gmap.s_d,
        s_t: gmap
            .s_t
            .into_iter()
            .map(|(k, v)| (k, tensor_to_native(v)))
            .collect(),
    }
}

pub fn message_to_pb(msg: native::GrpsMessage) -> pb::GrpsMessage {
    pb::GrpsMessage {
        model: msg.model,
        status: msg.status.map(status_to_pb),
        str_data: msg.str_data,
        bin_data: msg.bin_data,
        gtensors: msg.gtensors.map(|list| pb::GenericTensorList {
            tensors: list.tensors.into_iter().map(tensor_to_pb).collect(),
        }),
        gmap: msg.gmap.map(gmap_to_pb),
    }
}

pub fn message_to_native(msg: pb::GrpsMessage) -> native::GrpsMessage {
    native::GrpsMessage {
        model: msg.model,
        status: msg.status.map(status_to_native),
        str_data: msg.str_data,
        bin_data: msg.bin_data,
        gtensors: msg.gtensors.map(|list| native::GenericTensorList {
            tensors: list.tensors.into_iter().map(tensor_to_native).collect(),
        }),
        gmap: msg.gmap.map(gmap_to_native),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trip() {
        let msg = native::GrpsMessage {
            model: "m-1".into(),
            status: Some(native::GrpsStatus::failure(500, "boom")),
            str_data: "hello".into(),
            bin_data: vec![1, 2, 3],
            gtensors: Some(native::GenericTensorList {
                tensors: vec![native::GenericTensor {
                    name: "t".into(),
                    dtype: native::DataType::Uint8,
                    shape: vec![3],
                    flat_uint8: vec![7, 8, 9],
                    ..Default::default()
                }],
            }),
            gmap: None,
        };
        let back = message_to_native(message_to_pb(msg.clone()));
        assert_eq!(back, msg);
    }
}
