use scylla_rust_repo::harness::pick_free_port;
use scylla_rust_repo::{connect, ConnectOptions, Error};

fn quick_options(attempts: u32) -> ConnectOptions {
    ConnectOptions {
        attempts,
        initial_backoff_ms: 10,
        max_backoff_ms: 20,
        connect_timeout_ms: 2_000,
    }
}

#[tokio::test]
async fn unreachable_node_fails_after_bounded_retries() {
    let port = pick_free_port().expect("free port");
    let err = connect(&["127.0.0.1".to_string()], port, &quick_options(2))
        .await
        .err()
        .expect("nothing listens on the port");
    match err {
        Error::Connection {
            contact_points,
            attempts,
            reason,
        } => {
            assert_eq!(attempts, 2);
            assert_eq!(contact_points, vec![format!("127.0.0.1:{port}")]);
            assert!(!reason.is_empty());
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn empty_contact_points_fail_without_attempting() {
    let err = connect(&[], 9042, &quick_options(3))
        .await
        .err()
        .expect("no contact points");
    assert!(matches!(err, Error::Connection { attempts: 0, .. }));
    assert!(err.to_string().contains("no contact points"));
}
