use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use mooring::config::parse_config;
use mooring::{Event, NamespaceManager, Outcome, SessionManager, SessionState, TransitionTable};

use crate::support::{MemoryConnector, MemoryServer};

const CONFIG: &str = r#"
[[namespaces]]
name = "app"
[namespaces.pool]
pool_size = 4
borrow_timeout_ms = 5000
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_share_pool() {
    let server = Arc::new(MemoryServer::default());
    let config = parse_config(CONFIG).unwrap();
    let manager = NamespaceManager::from_config(&config, |_| MemoryConnector::new(server.clone()));
    let table = Arc::new(TransitionTable::new());
    let namespace = manager.get("app").unwrap();

    let mut tasks = Vec::new();
    for id in 0..16u32 {
        let table = table.clone();
        let namespace = namespace.clone();
        tasks.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let mut session = SessionManager::new(id, table, namespace);

            for _ in 0..5 {
                session
                    .dispatch(&cancel, Event::Query { db: "shop", sql: "SELECT 1" })
                    .await
                    .unwrap();
                assert!(session.state().is_initial());

                session.dispatch(&cancel, Event::Begin).await.unwrap();
                session
                    .dispatch(&cancel, Event::Query { db: "shop", sql: "UPDATE t SET a = a + 1" })
                    .await
                    .unwrap();
                session
                    .dispatch(&cancel, Event::CommitOrRollback { commit: true })
                    .await
                    .unwrap();
                assert!(!session.is_attached());
            }
            session.close().await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = namespace.pool().stats().await;
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.destroyed, 0);
    assert!(stats.created <= 4);
    assert_eq!(server.statements.load(Ordering::SeqCst), 16 * 5 * 2);
}

#[tokio::test]
async fn test_prepared_session_pins_one_connection() {
    let server = Arc::new(MemoryServer::default());
    let config = parse_config(CONFIG).unwrap();
    let manager = NamespaceManager::from_config(&config, |_| MemoryConnector::new(server.clone()));
    let namespace = manager.get("app").unwrap();
    let cancel = CancellationToken::new();
    let mut session = SessionManager::new(1, Arc::new(TransitionTable::new()), namespace.clone());

    session.dispatch(&cancel, Event::DisableAutoCommit).await.unwrap();
    let stmt = match session
        .dispatch(&cancel, Event::StmtPrepare { db: "shop", sql: "UPDATE t SET a = ? WHERE id = ?" })
        .await
        .unwrap()
    {
        Outcome::Prepared(stmt) => stmt,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(stmt.param_count, 2);
    let pinned = session.attached_conn_id();

    for _ in 0..3 {
        let data = Bytes::from_static(b"\x00\x01\x00\x00\x00");
        session
            .dispatch(&cancel, Event::StmtForwardData { stmt_id: stmt.id, data })
            .await
            .unwrap();
        assert_eq!(session.attached_conn_id(), pinned);
    }
    assert_eq!(session.state(), SessionState::IN_PREPARE | SessionState::IN_TRANSACTION);
    assert_eq!(namespace.pool().stats().await.in_use, 1);

    session.dispatch(&cancel, Event::StmtClose { stmt_id: stmt.id }).await.unwrap();
    session
        .dispatch(&cancel, Event::CommitOrRollback { commit: true })
        .await
        .unwrap();
    session.dispatch(&cancel, Event::EnableAutoCommit).await.unwrap();

    assert!(session.state().is_initial());
    let stats = namespace.pool().stats().await;
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 1);
    assert_eq!(server.closed.load(Ordering::SeqCst), 0);
}
