/// Integration test for cascading cleanup: once a session's
/// `SessionDisconnected` event fires, its cached facts are purged and it
/// stops being a valid target for further requests.
use std::time::Duration;

use hmon_core::fact::FactKind;
use hmon_core::{Event, HmonError, OrchestratorConfig};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn disconnecting_a_session_purges_its_cache_and_retires_it() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let peer = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        hmon_core::frame::handshake(&mut socket, hmon_core::frame::Role::Acceptor, 1 << 20)
            .await
            .unwrap();
        let payload = hmon_core::frame::read_frame(&mut socket, 1 << 20).await.unwrap();
        let (_, value): (String, serde_json::Value) = serde_json::from_slice(&payload).unwrap();
        let uid = value["UID"].as_str().unwrap().to_owned();
        let response = serde_json::json!({
            "UID": uid,
            "Facts": [{"ID": 1, "Name": "Host", "Value": "box-1"}],
        });
        let bytes = hmon_core::event::encode_envelope("Facts", response, None).unwrap();
        hmon_core::frame::write_frame(&mut socket, &bytes).await.unwrap();
        // Close the socket to force the dialer's session into disconnect.
        drop(socket);
    });

    // Disable retries so the dialer does not silently reconnect and mask
    // the disconnect under test.
    let config = OrchestratorConfig::default().with_retry_backoff(
        Duration::from_secs(60),
        Duration::from_secs(60),
        0.0,
    );
    let orchestrator = hmon_core::Orchestrator::new(config).unwrap();
    let mut events = orchestrator.take_events();
    let server_ref = orchestrator.add_server("127.0.0.1", port, None);

    let session = match tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        Event::SessionConnected { session, .. } => session,
        other => panic!("expected SessionConnected, got {other:?}"),
    };

    orchestrator
        .get_facts(session, vec![FactKind::Host], None, CancellationToken::new())
        .await
        .unwrap();
    assert!(orchestrator.cached_fact(session, FactKind::Host).is_some());

    match tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        Event::SessionDisconnected { session: s, .. } => assert_eq!(s, session),
        other => panic!("expected SessionDisconnected, got {other:?}"),
    }

    // Cleanup is cascaded asynchronously off the back of the registry
    // removal; give it a moment to run.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(orchestrator.cached_fact(session, FactKind::Host), None);
    let err = orchestrator
        .get_facts(session, vec![FactKind::Host], None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HmonError::SessionNotFound(_)));

    orchestrator.remove_server(server_ref).await;
    orchestrator.dispose().await;
    let _ = peer.await;
}
