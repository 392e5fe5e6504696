//! gRPC surface tests, invoking the service implementation directly.

mod common;

use futures::StreamExt;
use tonic::Request;

use grps_server::rpc::pb::grps_service_server::GrpsService;
use grps_server::rpc::{pb, GrpsServiceImpl};

use common::test_state;

fn str_request(data: &str, model: &str) -> Request<pb::GrpsMessage> {
    Request::new(pb::GrpsMessage {
        str_data: data.into(),
        model: model.into(),
        ..Default::default()
    })
}

#[tokio::test]
async fn unary_predict_echoes_with_ok_status() {
    let (state, _logs) = test_state();
    let service = GrpsServiceImpl::new(state);

    let response = service
        .predict(str_request("hello grps.", ""))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.str_data, "hello grps.");
    let status = response.status.unwrap();
    assert_eq!(status.code, 200);
    assert_eq!(status.status, pb::grps_status::StatusFlag::Success as i32);
}

#[tokio::test]
async fn unary_predict_failure_is_in_band() {
    let (state, _logs) = test_state();
    let service = GrpsServiceImpl::new(state);

    let response = service
        .predict(str_request("x", "oom-1.0.0"))
        .await
        .unwrap()
        .into_inner();
    let status = response.status.unwrap();
    assert_eq!(status.code, 500);
    assert_eq!(status.status, pb::grps_status::StatusFlag::Failure as i32);
    assert!(status.msg.contains("CUDA out of memory"));
}

#[tokio::test]
async fn predict_streaming_yields_frames_then_closes() {
    let (state, _logs) = test_state();
    let service = GrpsServiceImpl::new(state);

    let response = service
        .predict_streaming(str_request("hello grps.", "stream-1.0.0"))
        .await
        .unwrap();
    let mut stream = response.into_inner();

    let mut frames = Vec::new();
    while let Some(frame) = stream.next().await {
        frames.push(frame.unwrap());
    }
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].str_data, "stream data 1");
    assert_eq!(frames[1].str_data, "stream data 2");
    for frame in &frames {
        let status = frame.status.as_ref().unwrap();
        assert_eq!(status.code, 200);
        assert_eq!(status.status, pb::grps_status::StatusFlag::Success as i32);
    }
}

#[tokio::test]
async fn predict_streaming_error_is_one_terminal_frame() {
    let (state, _logs) = test_state();
    let service = GrpsServiceImpl::new(state);

    let response = service
        .predict_streaming(str_request("x", "oom-1.0.0"))
        .await
        .unwrap();
    let mut stream = response.into_inner();

    let mut frames = Vec::new();
    while let Some(frame) = stream.next().await {
        frames.push(frame.unwrap());
    }
    assert_eq!(frames.len(), 1);
    let status = frames[0].status.as_ref().unwrap();
    assert_eq!(status.code, 500);
    assert_eq!(status.status, pb::grps_status::StatusFlag::Failure as i32);
}

#[tokio::test]
async fn readiness_follows_online_offline() {
    let (state, _logs) = test_state();
    let service = GrpsServiceImpl::new(state);

    let response = service
        .check_readiness(str_request("", ""))
        .await
        .unwrap()
        .into_inner();
    let status = response.status.unwrap();
    assert_eq!(status.code, 403);
    assert_eq!(status.msg, "Service Unavailable");

    service.online(str_request("", "")).await.unwrap();
    let response = service
        .check_readiness(str_request("", ""))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.status.unwrap().code, 200);

    service.offline(str_request("", "")).await.unwrap();
    let response = service
        .check_readiness(str_request("", ""))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.status.unwrap().code, 403);

    let response = service
        .check_liveness(str_request("", ""))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.status.unwrap().code, 200);
}

#[tokio::test]
async fn metadata_over_rpc() {
    let (state, _logs) = test_state();
    let expected = state.server_metadata();
    let service = GrpsServiceImpl::new(state);

    let response = service
        .server_metadata(str_request("", ""))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.str_data, expected);

    let response = service
        .model_metadata(str_request("stream", ""))
        .await
        .unwrap()
        .into_inner();
    assert!(response.str_data.contains("name: stream"));

    let response = service
        .model_metadata(str_request("missing", ""))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.status.unwrap().code, 404);

    let response = service
        .model_metadata(str_request("", ""))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.status.unwrap().code, 400);
}
