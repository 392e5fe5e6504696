//! HTTP surface: the `/grps/v1` endpoint set, the monitor dashboard and the
//! optional user-configured predict route.

pub mod health;
pub mod metadata;
pub mod monitor;
pub mod ndarray;
pub mod predict;

use std::sync::Arc;

use salvo::prelude::*;

use grps_core::message::{GrpsMessage, GrpsStatus};

use crate::state::AppState;

pub(crate) fn state_of(depot: &Depot) -> Arc<AppState> {
    depot
        .obtain::<Arc<AppState>>()
        .expect("AppState is injected on every route")
        .clone()
}

/// JSON-render a wire message under an explicit HTTP status code.
pub(crate) fn render_message(res: &mut Response, code: u16, msg: &GrpsMessage) {
    res.status_code(
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );
    res.render(Json(msg));
}

pub(crate) fn render_status(res: &mut Response, code: u16, text: impl Into<String>) {
    let msg = if code < 400 {
        GrpsMessage::from_status(GrpsStatus::ok())
    } else {
        GrpsMessage::from_status(GrpsStatus::failure(code as i32, text))
    };
    render_message(res, code, &msg);
}

/// Build the full router. `state` is injected into every request's depot.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::with_path("grps/v1")
        .push(
            Router::with_path("health/online")
                .get(health::online)
                .post(health::online),
        )
        .push(
            Router::with_path("health/offline")
                .get(health::offline)
                .post(health::offline),
        )
        .push(
            Router::with_path("health/live")
                .get(health::live)
                .post(health::live),
        )
        .push(
            Router::with_path("health/ready")
                .get(health::ready)
                .post(health::ready),
        )
        .push(Router::with_path("infer/predict").post(predict::predict))
        .push(
            Router::with_path("metadata/server")
                .get(metadata::server_metadata)
                .post(metadata::server_metadata),
        )
        .push(Router::with_path("metadata/model").post(metadata::model_metadata))
        .push(Router::with_path("monitor/series").get(monitor::series))
        .push(Router::with_path("monitor/metrics").get(monitor::metrics_page))
        .push(Router::with_path("js/jquery_min").get(monitor::jquery_min_js))
        .push(Router::with_path("js/flot_min").get(monitor::flot_min_js));

    // User-configured predict alias, validated against reserved paths at
    // config time. It lives at the root, outside /grps/v1.
    let custom_route = state
        .conf
        .server
        .interface
        .customized_predict_http
        .as_ref()
        .map(|custom| {
            let path = custom.path.trim_start_matches('/').to_owned();
            tracing::info!("register customized predict http path: {}", custom.path);
            if custom.customized_body {
                Router::with_path(path)
                    .post(predict::predict_custom_http)
                    .get(predict::predict_custom_http)
            } else {
                Router::with_path(path)
                    .post(predict::predict)
                    .get(predict::predict)
            }
        });

    let mut root = Router::new()
        .hoop(salvo::affix_state::inject(state))
        .get(monitor::metrics_page)
        .push(api);
    if let Some(route) = custom_route {
        root = root.push(route);
    }
    root
}
