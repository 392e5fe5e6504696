//! Health endpoints driving and probing the readiness latch.

use salvo::prelude::*;

use super::{render_status, state_of};

#[handler]
pub async fn online(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let state = state_of(depot);
    state.set_health(true);
    tracing::info!("[Online] from client: {}", req.remote_addr());
    render_status(res, 200, "OK");
}

#[handler]
pub async fn offline(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let state = state_of(depot);
    state.set_health(false);
    tracing::info!("[Offline] from client: {}", req.remote_addr());
    render_status(res, 200, "OK");
}

#[handler]
pub async fn live(req: &mut Request, res: &mut Response) {
    tracing::info!("[CheckLiveness] from client: {}", req.remote_addr());
    render_status(res, 200, "OK");
}

#[handler]
pub async fn ready(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let state = state_of(depot);
    tracing::info!("[CheckReadiness] from client: {}", req.remote_addr());
    if state.healthy() {
        render_status(res, 200, "OK");
    } else {
        render_status(res, 503, "Service Unavailable");
    }
}
