//! Metadata endpoints: configuration texts and model descriptors.

use salvo::prelude::*;
use serde_json::Value;

use grps_core::message::GrpsMessage;

use super::{render_message, render_status, state_of};

/// Concatenation of the two configuration documents.
#[handler]
pub async fn server_metadata(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let state = state_of(depot);
    tracing::info!("[ServerMetadata] from client: {}", req.remote_addr());
    let mut msg = GrpsMessage::from_str_data(state.server_metadata());
    msg.stamp_ok();
    render_message(res, 200, &msg);
}

/// `{str_data: name}` → that model's descriptor as YAML text.
#[handler]
pub async fn model_metadata(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let state = state_of(depot);
    tracing::info!("[ModelMetadata] from client: {}", req.remote_addr());

    let body: Value = match req.parse_json().await {
        Ok(body) => body,
        Err(_) => {
            render_status(res, 400, "No model name.");
            return;
        }
    };
    let name = match body.get("str_data").and_then(Value::as_str) {
        Some(name) if !name.is_empty() => name,
        Some(_) => {
            render_status(res, 400, "The model name is empty.");
            return;
        }
        None => {
            render_status(res, 400, "No model name.");
            return;
        }
    };

    match state.model_metadata(name) {
        Some(descriptor) => {
            let mut msg = GrpsMessage::from_str_data(descriptor);
            msg.stamp_ok();
            render_message(res, 200, &msg);
        }
        None => render_status(res, 404, "Model not found."),
    }
}
