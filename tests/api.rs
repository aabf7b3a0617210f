mod common;

use axum::http::StatusCode;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use threadmail::db::Store;
use threadmail::email::{MessageStatus, NewAccount};

use common::*;

#[tokio::test]
async fn api_requires_a_live_session() {
    let h = harness().await;

    let (status, _) = h.api("GET", "/api/accounts", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = h.api("GET", "/api/accounts", Some("made-up"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    h.store.insert_session("stale", USER, Utc::now() - chrono::Duration::minutes(1)).await;
    let (status, _) = h.api("GET", "/api/threads", Some("stale"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = h.api("GET", "/api/accounts", Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accounts"][0]["email"], "b@y.com");
    assert!(body["accounts"][0].get("apiKey").is_none());
}

#[tokio::test]
async fn create_account_encrypts_key() {
    let h = harness().await;

    let (status, body) = h.api("POST", "/api/accounts", Some(OTHER_TOKEN), Some(json!({
        "email": "Cy@Z.com",
        "name": "Cy",
        "apiKey": "re_other_key",
    }))).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["email"], "cy@z.com");
    assert_eq!(body["isDefault"], true);

    let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();
    let stored = h.store.account_by_id(id).await.unwrap().unwrap();
    assert_ne!(stored.api_key.ciphertext, "re_other_key");
    assert_eq!(h.state.cipher.decrypt(&stored.api_key).unwrap().as_str(), "re_other_key");

    let (status, _) = h.api("POST", "/api/accounts", Some(OTHER_TOKEN), Some(json!({
        "email": "cy@z.com",
        "name": "Again",
        "apiKey": "re_other_key",
    }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn threads_are_listed_and_scoped_to_owner() {
    let h = harness().await;

    h.webhook(&received("<m1>", "First", json!({}))).await;
    h.webhook(&received("<m2>", "Second", json!({}))).await;
    h.webhook(&received("<m3>", "Re: First", json!({ "In-Reply-To": "<m1>" }))).await;

    let uri = format!("/api/threads?accountId={}&page=1&limit=10", h.account.id);
    let (status, body) = h.api("GET", &uri, Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["threads"][0]["subject"], "First");
    assert_eq!(body["threads"][0]["messageCount"], 2);

    let thread_id = body["threads"][0]["id"].as_str().unwrap().to_string();
    let (status, body) = h.api("GET", &format!("/api/threads/{}", thread_id), Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["emails"].as_array().unwrap().len(), 2);

    let (status, _) = h.api("GET", &format!("/api/threads/{}", thread_id), Some(OTHER_TOKEN), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = h.api("GET", &uri, Some(OTHER_TOKEN), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn flags_can_be_updated() {
    let h = harness().await;
    let (_, body) = h.webhook(&received("<m1>", "Hello", json!({}))).await;
    let id = body["emailId"].as_str().unwrap();

    let (status, body) = h.api("PATCH", &format!("/api/emails/{}", id), Some(TOKEN), Some(json!({
        "isRead": true,
        "isStarred": true,
    }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isRead"], true);
    assert_eq!(body["isStarred"], true);

    let (status, _) = h.api("PATCH", &format!("/api/emails/{}", id), Some(OTHER_TOKEN), Some(json!({
        "isRead": false,
    }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sending_marks_message_sent() {
    let h = harness().await;

    let (status, body) = h.api("POST", "/api/emails", Some(TOKEN), Some(json!({
        "accountId": h.account.id,
        "to": ["a@x.com"],
        "subject": "Fwd: Plans",
        "text": "See below",
    }))).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "sent");
    assert_eq!(body["direction"], "outbound");
    assert_eq!(body["messageId"], "out-1@resend.dev");

    let sent = h.sender.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].from, "Bea <b@y.com>");
}

#[tokio::test]
async fn failed_send_is_recorded_and_reported() {
    let h = harness_with(Options { fail_sends: true, ..Options::default() }).await;

    let (status, body) = h.api("POST", "/api/emails", Some(TOKEN), Some(json!({
        "accountId": h.account.id,
        "to": ["a@x.com"],
        "subject": "Plans",
        "text": "See below",
    }))).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].as_str().unwrap().contains("not verified"));

    let page = h.store.threads_for_accounts(&[h.account.id], 10, 0).await.unwrap();
    let messages = h.store.messages_in_thread(page.threads[0].id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::Failed);
}

#[tokio::test]
async fn sending_from_someone_elses_account_is_not_found() {
    let h = harness().await;

    let (status, _) = h.api("POST", "/api/emails", Some(OTHER_TOKEN), Some(json!({
        "accountId": h.account.id,
        "to": ["a@x.com"],
        "subject": "Plans",
    }))).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(h.sender.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn manual_classification_is_accepted() {
    let h = harness().await;
    let (_, body) = h.webhook(&received("<m1>", "Hello", json!({}))).await;
    let id = body["emailId"].as_str().unwrap();

    let (status, body) = h.api("POST", &format!("/api/emails/{}/classify", id), Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["ok"], true);

    let disabled = harness_with(Options { classify: false, ..Options::default() }).await;
    let (_, body) = disabled.webhook(&received("<m1>", "Hello", json!({}))).await;
    let id = body["emailId"].as_str().unwrap();
    let (status, _) = disabled.api("POST", &format!("/api/emails/{}/classify", id), Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn health_and_version_are_public() {
    let h = harness().await;

    let (status, body) = h.api("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);

    let (status, body) = h.api("GET", "/version", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn emails_are_listed_with_filters() {
    let h = harness().await;

    let (_, first) = h.webhook(&received("<m1>", "First", json!({}))).await;
    h.webhook(&received("<m2>", "Second", json!({}))).await;
    let (_, third) = h.webhook(&received("<m3>", "Third", json!({}))).await;

    let read = first["emailId"].as_str().unwrap();
    h.api("PATCH", &format!("/api/emails/{}", read), Some(TOKEN), Some(json!({ "isRead": true }))).await;
    h.api("POST", "/api/emails", Some(TOKEN), Some(json!({
        "accountId": h.account.id,
        "to": ["a@x.com"],
        "subject": "Outgoing",
        "text": "Hi",
    }))).await;

    let (status, body) = h.api("GET", "/api/emails", Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 4);
    assert_eq!(body["page"], 1);
    assert_eq!(body["limit"], 50);
    assert_eq!(body["emails"][0]["id"], third["emailId"]);
    assert_eq!(body["emails"][3]["direction"], "outbound");

    let (_, body) = h.api("GET", "/api/emails?isRead=false&direction=inbound", Some(TOKEN), None).await;
    assert_eq!(body["total"], 2);
    assert!(body["emails"].as_array().unwrap().iter().all(|e| e["isRead"] == false));

    let (_, body) = h.api("GET", "/api/emails?status=sent", Some(TOKEN), None).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["emails"][0]["subject"], "Outgoing");

    let uri = format!("/api/emails?accountId={}&page=2&limit=3", h.account.id);
    let (_, body) = h.api("GET", &uri, Some(TOKEN), None).await;
    assert_eq!(body["total"], 4);
    assert_eq!(body["emails"].as_array().unwrap().len(), 1);

    let (status, _) = h.api("GET", "/api/emails?direction=sideways", Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h.api("GET", &uri, Some(OTHER_TOKEN), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = h.api("GET", "/api/emails", Some(OTHER_TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "emails": [], "total": 0, "page": 1, "limit": 50 }));
}

#[tokio::test]
async fn default_account_can_be_switched() {
    let h = harness().await;
    let second = h.store.create_account(NewAccount {
        user_id: USER.into(),
        email: "second@y.com".into(),
        name: "Bea".into(),
        api_key: h.state.cipher.encrypt("re_second").unwrap(),
    }).await.unwrap();
    assert!(!second.is_default);

    let uri = format!("/api/accounts/{}", second.id);
    let (status, body) = h.api("PATCH", &uri, Some(TOKEN), Some(json!({ "isDefault": true }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isDefault"], true);
    assert!(!h.store.account_by_id(h.account.id).await.unwrap().unwrap().is_default);

    let (status, _) = h.api("PATCH", &uri, Some(TOKEN), Some(json!({ "isDefault": false }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h.api("PATCH", &uri, Some(OTHER_TOKEN), Some(json!({ "isDefault": true }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(h.store.account_by_id(second.id).await.unwrap().unwrap().is_default);
}

#[tokio::test]
async fn deleting_an_account_removes_its_mail() {
    let h = harness().await;
    let second = h.store.create_account(NewAccount {
        user_id: USER.into(),
        email: "second@y.com".into(),
        name: "Bea".into(),
        api_key: h.state.cipher.encrypt("re_second").unwrap(),
    }).await.unwrap();
    h.webhook(&received("<m1>", "Hello", json!({}))).await;

    let uri = format!("/api/accounts/{}", h.account.id);
    let (status, _) = h.api("DELETE", &uri, Some(OTHER_TOKEN), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(h.store.message_count().await, 1);

    let (status, body) = h.api("DELETE", &uri, Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true }));

    assert!(h.store.account_by_id(h.account.id).await.unwrap().is_none());
    assert_eq!(h.store.message_count().await, 0);
    assert_eq!(h.store.thread_count().await, 0);
    assert!(h.store.account_by_id(second.id).await.unwrap().unwrap().is_default);

    let (status, _) = h.webhook(&received("<m2>", "Hello", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = h.api("DELETE", &uri, Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
