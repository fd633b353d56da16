//! Server lifecycle through the flat surface.

mod common;

use common::{api, api_with, up_server, FailingEngine};
use mesh_embed::{ServerState, Status};
use std::sync::Arc;

fn state(api: &mesh_embed::Api, server: u64) -> ServerState {
    api.runtime()
        .server_state(mesh_embed::Handle::from_raw(server))
        .unwrap()
        .0
}

#[test]
fn test_full_lifecycle() {
    let api = api();
    let server = api.new_server();
    assert_eq!(state(&api, server), ServerState::Created);

    assert_eq!(api.set_hostname(server, "alpha"), Status::Ok);
    assert_eq!(api.set_ephemeral(server, true), Status::Ok);
    assert_eq!(state(&api, server), ServerState::Configured);

    assert_eq!(api.start(server), Status::Ok);
    assert_eq!(state(&api, server), ServerState::Started);

    assert_eq!(api.up(server), Status::Ok);
    assert_eq!(state(&api, server), ServerState::Up);

    let (ips, status) = api.getips(server);
    assert_eq!(status, Status::Ok);
    let (v4, v6) = ips.split_once(',').unwrap();
    assert!(v4.parse::<std::net::Ipv4Addr>().is_ok());
    assert!(v6.parse::<std::net::Ipv6Addr>().is_ok());

    assert_eq!(api.close(server), Status::Ok);
    assert!(!api.runtime().is_live(mesh_embed::Handle::from_raw(server)));
    assert_eq!(api.runtime().live_counts(), (0, 0, 0));
}

#[test]
fn test_start_without_settings_uses_defaults() {
    let api = api();
    let server = api.new_server();
    assert_eq!(api.start(server), Status::Ok);
    assert_eq!(api.up(server), Status::Ok);
    assert_eq!(api.getips(server).1, Status::Ok);
}

#[test]
fn test_settings_rejected_after_start() {
    let api = api();
    let server = api.new_server();
    assert_eq!(api.start(server), Status::Ok);

    assert_eq!(api.set_hostname(server, "late"), Status::ConfigError);
    assert_eq!(api.set_authkey(server, "tskey-late"), Status::ConfigError);
    assert!(api.err_msg(server).starts_with("set_authkey: "));
}

#[test]
fn test_start_twice_is_a_state_error() {
    let api = api();
    let server = api.new_server();
    assert_eq!(api.start(server), Status::Ok);
    assert_eq!(api.start(server), Status::StateError);
    assert_eq!(state(&api, server), ServerState::Started);
}

#[test]
fn test_up_only_valid_from_started() {
    let api = api();
    let server = up_server(&api, "beta", "local://idempotent");
    assert_eq!(api.up(server), Status::StateError);
    assert_eq!(state(&api, server), ServerState::Up);
}

#[test]
fn test_failed_start_can_be_retried() {
    let api = api_with(Arc::new(FailingEngine::new(1)));
    let server = api.new_server();

    assert_eq!(api.start(server), Status::NetworkError);
    assert!(api.err_msg(server).contains("underlay unavailable"));
    let (state_now, marker) = api
        .runtime()
        .server_state(mesh_embed::Handle::from_raw(server))
        .unwrap();
    assert_eq!(state_now, ServerState::Configured);
    assert!(marker.is_some());

    // Settings may be corrected between attempts.
    assert_eq!(api.set_hostname(server, "retry"), Status::Ok);
    assert_eq!(api.start(server), Status::Ok);
    assert_eq!(api.err_msg(server), "");
    assert_eq!(api.up(server), Status::Ok);
}

#[test]
fn test_auth_key_required_by_control_plane() {
    use mesh_embed::{MeshEngine, MeshRuntime};
    use mesh_session::ControlPlane;

    let plane = Arc::new(ControlPlane::with_auth_keys(["tskey-good"]));
    let engine = MeshEngine::default().with_control("locked", plane);
    let api = mesh_embed::Api::with_runtime(
        MeshRuntime::with_engine(common::test_config(), Arc::new(engine)).unwrap(),
    );

    let server = api.new_server();
    assert_eq!(api.set_control_url(server, "local://locked"), Status::Ok);
    assert_eq!(api.set_authkey(server, "tskey-bad"), Status::Ok);
    assert_eq!(api.start(server), Status::Ok);
    assert_eq!(api.up(server), Status::NetworkError);
    assert!(api.err_msg(server).starts_with("up: authentication failed"));
    assert_eq!(state(&api, server), ServerState::Started);

    let other = api.new_server();
    assert_eq!(api.set_control_url(other, "local://locked"), Status::Ok);
    assert_eq!(api.set_authkey(other, "tskey-good"), Status::Ok);
    assert_eq!(api.start(other), Status::Ok);
    assert_eq!(api.up(other), Status::Ok);
}

#[test]
fn test_close_semantics_for_handles() {
    let api = api();
    let server = api.new_server();
    assert_eq!(api.close(server), Status::Ok);
    assert_eq!(api.close(server), Status::Ok);

    assert_eq!(api.start(server), Status::HandleError);
    assert!(api.err_msg(server).contains("closed"));

    // Never issued
    assert_eq!(api.close(0), Status::HandleError);
    assert_eq!(api.close(u64::MAX), Status::HandleError);
}

#[test]
fn test_server_handle_is_not_a_listener() {
    let api = api();
    let server = api.new_server();
    assert_eq!(api.accept(server), (0, Status::HandleError));
    assert_eq!(api.read(server, &mut [0u8; 4]), (0, Status::HandleError));
}

#[test]
fn test_unique_handles() {
    let api = api();
    let a = api.new_server();
    let b = api.new_server();
    assert_ne!(a, 0);
    assert_ne!(a, b);
    assert_eq!(api.close(a), Status::Ok);
    let c = api.new_server();
    assert_ne!(a, c);
    assert_eq!(api.start(a), Status::HandleError);
}
