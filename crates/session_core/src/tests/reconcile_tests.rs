use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use super::*;
use crate::remote::HttpRemoteApi;
use crate::store::{Action, SessionStore};
use crate::test_support::{sample_document, sample_summary, wait_until, StubRemote};
use crate::Notice;
use shared::domain::{DocumentId, ProcessingState};
use storage::SessionStorage;

struct Fixture {
    store: Arc<SessionStore>,
    remote: Arc<StubRemote>,
    reconciler: Arc<StatusReconciler>,
    _notices: broadcast::Sender<Notice>,
}

fn fixture(poll_interval: Duration) -> Fixture {
    let store = Arc::new(SessionStore::new());
    let remote = StubRemote::new();
    let (notices, _) = broadcast::channel(64);
    let reconciler = StatusReconciler::new(
        Arc::clone(&store),
        remote.clone(),
        notices.clone(),
        poll_interval,
    );
    Fixture {
        store,
        remote,
        reconciler,
        _notices: notices,
    }
}

fn pending_document(id: i64, name: &str) -> crate::store::Document {
    let mut document = sample_document(id, name);
    document.processing = ProcessingState::Pending;
    document
}

#[tokio::test]
async fn zero_pending_documents_issue_zero_poll_requests() {
    let fixture = fixture(Duration::from_millis(20));
    fixture
        .store
        .dispatch(Action::AddDocument(sample_document(1, "done.pdf")));
    let _task = fixture.reconciler.run();

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(fixture.remote.list_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn pending_documents_are_reconciled_then_polling_stops() {
    let fixture = fixture(Duration::from_millis(20));
    *fixture.remote.list_response.lock().await =
        vec![sample_summary(1, "doc", ProcessingState::Completed)];
    fixture
        .store
        .dispatch(Action::AddDocument(pending_document(1, "doc.pdf")));
    let _task = fixture.reconciler.run();

    wait_until("processing settled", || {
        fixture.store.snapshot().processing.get(&DocumentId(1))
            == Some(&ProcessingState::Completed)
    })
    .await;

    // Polling terminates within one interval of the last pending document
    // settling.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let settled_count = fixture.remote.list_calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fixture.remote.list_calls.load(Ordering::SeqCst), settled_count);
}

#[tokio::test]
async fn polling_rearms_when_a_document_returns_to_pending() {
    let fixture = fixture(Duration::from_millis(20));
    *fixture.remote.list_response.lock().await =
        vec![sample_summary(1, "doc", ProcessingState::Completed)];
    fixture
        .store
        .dispatch(Action::AddDocument(pending_document(1, "doc.pdf")));
    let _task = fixture.reconciler.run();

    wait_until("first settle", || {
        !fixture.store.snapshot().has_pending_processing()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    let settled_count = fixture.remote.list_calls.load(Ordering::SeqCst);

    // A re-upload flips the document back to pending; the loop re-arms.
    fixture.store.dispatch(Action::PatchProcessing {
        document_id: DocumentId(1),
        state: ProcessingState::Pending,
    });
    wait_until("second settle", || {
        !fixture.store.snapshot().has_pending_processing()
    })
    .await;
    assert!(fixture.remote.list_calls.load(Ordering::SeqCst) > settled_count);
}

#[tokio::test]
async fn poll_errors_are_logged_and_do_not_stop_the_loop() {
    let fixture = fixture(Duration::from_millis(20));
    *fixture.remote.list_response.lock().await =
        vec![sample_summary(1, "doc", ProcessingState::Completed)];
    fixture.remote.fail_list.store(2, Ordering::SeqCst);
    fixture
        .store
        .dispatch(Action::AddDocument(pending_document(1, "doc.pdf")));
    let _task = fixture.reconciler.run();

    wait_until("settled despite failures", || {
        !fixture.store.snapshot().has_pending_processing()
    })
    .await;
}

#[tokio::test]
async fn unknown_remote_documents_are_left_pending() {
    let fixture = fixture(Duration::from_millis(20));
    // Remote has no entry for the pending document.
    fixture
        .store
        .dispatch(Action::AddDocument(pending_document(1, "doc.pdf")));
    let _task = fixture.reconciler.run();

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(fixture.store.snapshot().has_pending_processing());
    assert!(fixture.remote.list_calls.load(Ordering::SeqCst) >= 2);
}

#[derive(Clone)]
struct UnauthorizedState {
    hits: Arc<AtomicUsize>,
}

async fn unauthorized_list(State(state): State<UnauthorizedState>) -> (StatusCode, Json<serde_json::Value>) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": "token expired" })),
    )
}

async fn spawn_unauthorized_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/api/pdfs", get(unauthorized_list))
        .with_state(UnauthorizedState {
            hits: Arc::clone(&hits),
        });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), hits)
}

#[tokio::test]
async fn unauthorized_poll_clears_credential_without_stopping_the_loop() {
    let (server_url, hits) = spawn_unauthorized_server().await;
    let dir = tempfile::TempDir::new().expect("tempdir");
    let db_url = format!("sqlite://{}", dir.path().join("session.sqlite3").display());
    let storage = Arc::new(SessionStorage::new(&db_url).await.expect("storage"));
    storage.save_credential("stale-token").await.expect("seed");

    let remote = Arc::new(HttpRemoteApi::new(
        server_url.parse().expect("url"),
        Arc::clone(&storage),
    ));
    let store = Arc::new(SessionStore::new());
    let (notices, mut notice_rx) = broadcast::channel(64);
    let reconciler = StatusReconciler::new(
        Arc::clone(&store),
        remote,
        notices,
        Duration::from_millis(20),
    );
    store.dispatch(Action::AddDocument(pending_document(1, "doc.pdf")));
    let _task = reconciler.run();

    // The poll hits the server, gets a 401, clears the credential and
    // keeps the loop alive without forcing any navigation.
    wait_until("server polled", || hits.load(Ordering::SeqCst) >= 1).await;
    for _ in 0..100 {
        if storage
            .load_credential()
            .await
            .expect("load")
            .is_none()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(storage.load_credential().await.expect("load"), None);
    let notice = notice_rx.recv().await.expect("notice");
    assert!(matches!(notice, Notice::AuthorizationExpired));

    // The loop is still alive: once a fresh credential appears it resumes
    // hitting the server.
    let before = hits.load(Ordering::SeqCst);
    storage.save_credential("renewed-token").await.expect("renew");
    wait_until("loop keeps polling after a 401", || {
        hits.load(Ordering::SeqCst) > before
    })
    .await;
}
