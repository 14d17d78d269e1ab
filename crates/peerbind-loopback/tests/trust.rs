//! Trust relationships across binds: reuse, identical accounts, unbind

mod common;

use common::{config, local, pair, Peer, PKG};
use peerbind_auth::{AclLifetime, JsonTrustStore, TrustStore};
use peerbind_core::{AuthType, BindLevel, DmError, DM_OK};
use peerbind_loopback::{ConfirmPolicy, LoopbackNetwork, PinBoard, ScriptedPrompt, SimulatedDevice};

fn allow_always(board: PinBoard) -> ScriptedPrompt {
    ScriptedPrompt::new(board).with_confirm(ConfirmPolicy::AllowAlways)
}

async fn bind(a: &mut Peer, b: &mut Peer, auth_type: AuthType) -> i64 {
    bind_pkg(a, b, PKG, auth_type).await
}

async fn bind_pkg(a: &mut Peer, b: &mut Peer, pkg: &str, auth_type: AuthType) -> i64 {
    let request_id = a
        .device
        .manager
        .authenticate_device(pkg, auth_type, b.device.udid(), "")
        .unwrap();
    assert_eq!(a.result(request_id).await.result_code, DM_OK);
    assert_eq!(b.result(request_id).await.result_code, DM_OK);
    request_id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_identical_account_needs_no_pin() {
    let network = LoopbackNetwork::new();
    let board = PinBoard::new();
    let mut a = Peer::spawn(
        &network,
        local("dev-a", "shared", 11),
        ScriptedPrompt::new(board.clone()),
    );
    let mut b = Peer::spawn(
        &network,
        local("dev-b", "shared", 22),
        ScriptedPrompt::new(board),
    );

    bind(&mut a, &mut b, AuthType::Pin).await;
    assert_eq!(b.device.prompt.confirms_shown(), 0);
    assert_eq!(a.device.prompt.pin_inputs_shown(), 0);
    assert_eq!(a.device.store.entry_count(), 0);
    assert_eq!(b.device.store.entry_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_existing_credential_is_reused() {
    let (_network, mut a, mut b) = pair(ScriptedPrompt::new, allow_always);

    bind(&mut a, &mut b, AuthType::Pin).await;
    let entry = &a.device.store.query_access_control_list("dev-a", "dev-b")[0];
    assert_eq!(entry.lifetime, AclLifetime::Permanent);
    let first_seen = entry.last_seen;
    assert_eq!(a.device.engine.credential_count(), 1);

    bind(&mut a, &mut b, AuthType::Pin).await;
    assert_eq!(b.device.prompt.confirms_shown(), 1);
    assert_eq!(a.device.prompt.pin_inputs_shown(), 1);
    assert_eq!(a.device.engine.credential_count(), 1);
    assert_eq!(a.device.store.entry_count(), 1);
    let entry = &a.device.store.query_access_control_list("dev-a", "dev-b")[0];
    assert!(entry.last_seen >= first_seen);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_app_gets_its_own_entry() {
    let (_network, mut a, mut b) = pair(ScriptedPrompt::new, allow_always);

    bind_pkg(&mut a, &mut b, "com.first", AuthType::Pin).await;
    bind_pkg(&mut a, &mut b, "com.second", AuthType::Pin).await;

    // A new app on a trusted peer still goes through confirmation and PIN
    assert_eq!(b.device.prompt.confirms_shown(), 2);
    assert_eq!(a.device.prompt.pin_inputs_shown(), 2);

    for (peer, local, remote) in [(&a, "dev-a", "dev-b"), (&b, "dev-b", "dev-a")] {
        let mut entries = peer.device.store.query_access_control_list(local, remote);
        entries.sort_by(|x, y| x.local.bundle_name.cmp(&y.local.bundle_name));
        let bundles: Vec<_> = entries.iter().map(|e| e.local.bundle_name.as_str()).collect();
        assert_eq!(bundles, ["com.first", "com.second"]);
        assert!(entries[0].credential_id.is_some());
        assert_eq!(entries[0].credential_id, entries[1].credential_id);
        assert_eq!(peer.device.engine.credential_count(), 1);
    }

    // The credential stays while another app still uses it
    a.device
        .manager
        .unbind_device("com.second", "dev-b", BindLevel::App)
        .unwrap();
    assert_eq!(a.device.store.entry_count(), 1);
    assert_eq!(a.device.engine.credential_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_credential_type_requires_existing_trust() {
    let (_network, mut a, _b) = pair(ScriptedPrompt::new, ScriptedPrompt::new);

    let request_id = a
        .device
        .manager
        .authenticate_device(PKG, AuthType::Credential, "dev-b", "")
        .unwrap();
    assert_eq!(
        a.result(request_id).await.result_code,
        DmError::AuthFailed.code()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_app_unbind_propagates_to_peer() {
    let (network, mut a, mut b) = pair(ScriptedPrompt::new, allow_always);
    bind(&mut a, &mut b, AuthType::Pin).await;
    assert_eq!(b.device.store.entry_count(), 1);

    let payload = a
        .device
        .manager
        .unbind_device(PKG, "dev-b", BindLevel::App)
        .unwrap()
        .expect("app unbind is broadcast");
    assert_eq!(a.device.store.entry_count(), 0);
    assert_eq!(a.device.engine.credential_count(), 0);

    assert_eq!(network.broadcast_relationship("dev-a", &payload), 1);
    assert_eq!(b.device.store.entry_count(), 0);
    assert_eq!(b.device.engine.credential_count(), 0);

    assert_eq!(
        a.device
            .manager
            .unbind_device(PKG, "dev-b", BindLevel::App),
        Err(DmError::NotFound)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_account_logout_propagates_to_peer() {
    let (network, mut a, mut b) = pair(ScriptedPrompt::new, ScriptedPrompt::new);
    bind(&mut a, &mut b, AuthType::Pin).await;

    let payload = a
        .device
        .manager
        .handle_account_logout(100, "alice")
        .unwrap()
        .expect("logout is broadcast");
    assert_eq!(a.device.store.entry_count(), 0);
    assert_eq!(network.broadcast_relationship("dev-a", &payload), 1);
    assert_eq!(b.device.store.entry_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_permanent_trust_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trust.json");
    let network = LoopbackNetwork::new();
    let board = PinBoard::new();

    let a = SimulatedDevice::spawn_with_store(
        &network,
        local("dev-a", "alice", 11),
        config(),
        ScriptedPrompt::new(board.clone()),
        JsonTrustStore::with_path(path.clone()).unwrap(),
    );
    let mut a = Peer {
        events: a.subscribe(),
        device: a,
    };
    let mut b = Peer::spawn(&network, local("dev-b", "bob", 22), allow_always(board));
    bind(&mut a, &mut b, AuthType::Pin).await;

    let reopened = JsonTrustStore::with_path(path).unwrap();
    let entries = reopened.query_access_control_list("dev-a", "dev-b");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].lifetime, AclLifetime::Permanent);
}
