use super::*;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::TimeZone;
use tokio::net::TcpListener;

use crate::rest::{RestMediaUploader, RestRemoteStore};

async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn insert_message_echoes_the_client_id() {
    async fn handler(Json(message): Json<NewMessage>) -> Json<MessageRow> {
        Json(MessageRow {
            id: MessageId("srv-1".to_string()),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: message.content,
            kind: message.kind,
            media_url: message.media_url,
            client_id: Some(message.client_id),
            reply_to_message_id: message.reply_to_message_id,
            reply_to: None,
            created_at: message.created_at,
        })
    }
    let server_url = serve(Router::new().route("/messages", post(handler))).await;

    let remote = RestRemoteStore::new(server_url);
    let row = remote
        .insert_message(NewMessage {
            conversation_id: ConversationId("conv-1".to_string()),
            sender_id: UserId("alice".to_string()),
            content: "hello".to_string(),
            kind: MessageKind::Text,
            media_url: None,
            client_id: ClientId("abc123".to_string()),
            reply_to_message_id: None,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        })
        .await
        .expect("insert");

    assert_eq!(row.id.as_str(), "srv-1");
    assert_eq!(row.client_id, Some(ClientId("abc123".to_string())));
}

#[tokio::test]
async fn read_receipt_conflict_classifies_as_duplicate_key() {
    let server_url = serve(
        Router::new().route("/message_reads", post(|| async { StatusCode::CONFLICT })),
    )
    .await;

    let remote = RestRemoteStore::new(server_url);
    let err = remote
        .upsert_read_receipt(
            &MessageId("srv-1".to_string()),
            &UserId("alice".to_string()),
            Utc::now(),
        )
        .await
        .expect_err("conflict");

    assert!(is_duplicate_key_error(&err));
    assert!(!is_offline_error(&err));
}

#[tokio::test]
async fn refused_connection_classifies_as_offline() {
    // Nothing listens on the discard port.
    let remote = RestRemoteStore::new("http://127.0.0.1:9");
    let err = remote
        .conversations_for_user(&UserId("alice".to_string()))
        .await
        .expect_err("unreachable");

    assert!(is_offline_error(&err));
}

#[tokio::test]
async fn message_page_request_carries_the_exclusive_cursor() {
    type Seen = Arc<Mutex<Option<String>>>;

    async fn handler(
        Path(_conversation): Path<String>,
        Query(params): Query<HashMap<String, String>>,
        State(seen): State<Seen>,
    ) -> Json<Vec<MessageRow>> {
        *seen.lock().await = params.get("before").cloned();
        Json(Vec::new())
    }

    let seen: Seen = Arc::new(Mutex::new(None));
    let server_url = serve(
        Router::new()
            .route("/conversations/:id/messages", get(handler))
            .with_state(Arc::clone(&seen)),
    )
    .await;

    let remote = RestRemoteStore::new(server_url);
    let cursor = Utc.with_ymd_and_hms(2024, 5, 1, 12, 2, 0).unwrap();
    remote
        .messages_before(&ConversationId("conv-1".to_string()), Some(cursor), 50)
        .await
        .expect("page");

    let recorded = seen.lock().await.clone().expect("before param");
    assert!(recorded.starts_with("2024-05-01T12:02:00"));
}

#[tokio::test]
async fn upload_returns_the_durable_url_with_monotonic_progress() {
    let server_url = serve(Router::new().route(
        "/files/upload",
        post(|| async {
            Json(serde_json::json!({ "url": "https://files.example/blob-7" }))
        }),
    ))
    .await;

    let uploader = RestMediaUploader::new(server_url);
    let reports: Arc<std::sync::Mutex<Vec<u8>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let progress: ProgressFn = Arc::new(move |value| {
        sink.lock().expect("reports lock").push(value);
    });

    let url = uploader
        .upload(vec![1, 2, 3], "photo.png", Some(progress))
        .await
        .expect("upload");

    assert_eq!(url, "https://files.example/blob-7");
    let reported = reports.lock().expect("reports lock").clone();
    assert!(reported.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(reported.first(), Some(&0));
    assert_eq!(reported.last(), Some(&100));
}
