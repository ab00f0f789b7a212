//! End-to-end flows over the service and the HTTP router.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use inkwell_api::service::DEFAULT_PULL_LIMIT;
use inkwell_api::{ApiError, AppStateInner, MessagingService, router};
use inkwell_db::{Database, StoreError};
use inkwell_directory::StaticDirectory;
use inkwell_gateway::bus::{EventBus, ShardSubscription};
use inkwell_gateway::registry::ConnectionRegistry;
use inkwell_types::api::{Claims, DeepLinkView};
use inkwell_types::events::BusEvent;
use inkwell_types::models::{ContainerId, Role};

const SECRET: &str = "flow-secret";

struct World {
    service: MessagingService,
    subs: Vec<ShardSubscription>,
}

fn world() -> World {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let (bus, subs) = EventBus::new(2);
    let directory = Arc::new(StaticDirectory::new());
    World { service: MessagingService::new(db, bus, directory.clone(), directory, DEFAULT_PULL_LIMIT), subs }
}

fn token(user: Uuid) -> String {
    let exp = (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize;
    encode(&Header::default(), &Claims { sub: user, exp }, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

async fn published(world: &World) -> Vec<BusEvent> {
    let mut events = Vec::new();
    for sub in &world.subs {
        events.extend(sub.drain().await);
    }
    events
}

/// Channel-1 read while Channel-2 is not: the group total is Channel-2's count.
#[tokio::test]
async fn group_total_tracks_unread_channels_only() {
    let w = world();
    let (admin, reader) = (Uuid::new_v4(), Uuid::new_v4());
    let group = w.service.create_group(admin, "book club".into(), false).await.unwrap();
    let group_id = group.group.id;
    w.service.join_group(reader, group_id).await.unwrap();
    let one = ContainerId::Channel(group.channels[0].id);
    let two = ContainerId::Channel(w.service.create_channel(admin, group_id, "spoilers".into()).await.unwrap().id);

    let mut last = 0;
    for i in 0..3 {
        last = w.service.send_message(admin, one, format!("one {i}"), None).await.unwrap().sequence;
    }
    for i in 0..5 {
        w.service.send_message(admin, two, format!("two {i}"), None).await.unwrap();
    }
    let before = w.service.unread_summary(reader).await.unwrap();
    assert_eq!(before.container(one), Some(3));
    assert_eq!(before.group(group_id), Some(8));

    w.service.advance_read(reader, one, last).await.unwrap();

    let after = w.service.unread_summary(reader).await.unwrap();
    assert_eq!(after.container(one), Some(0));
    assert_eq!(after.container(two), Some(5));
    assert_eq!(after.group(group_id), Some(5));
}

/// A stale tab cannot move the read position backwards.
#[tokio::test]
async fn stale_tab_does_not_regress_read_position() {
    let w = world();
    let (admin, reader) = (Uuid::new_v4(), Uuid::new_v4());
    let group = w.service.create_group(admin, "g".into(), false).await.unwrap();
    w.service.join_group(reader, group.group.id).await.unwrap();
    let channel = ContainerId::Channel(group.channels[0].id);
    for i in 0..12 {
        w.service.send_message(admin, channel, format!("m{i}"), None).await.unwrap();
    }
    published(&w).await;

    let tab_a = w.service.advance_read(reader, channel, 10).await.unwrap();
    let tab_b = w.service.advance_read(reader, channel, 7).await.unwrap();
    assert!(tab_a.advanced);
    assert!(!tab_b.advanced);
    assert_eq!(tab_b.position, 10);
    assert_eq!(w.service.db().read_position(reader, channel).unwrap(), 10);

    let events = published(&w).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], BusEvent::ReadAdvanced { position: 10, .. }));
    assert_eq!(w.service.unread(reader, channel).await.unwrap(), Some(2));
}

/// Private group deep link: access denied and nothing written.
#[tokio::test]
async fn private_group_link_is_denied_without_side_effects() {
    let w = world();
    let (owner, stranger) = (Uuid::new_v4(), Uuid::new_v4());
    let group = w.service.create_group(owner, "secret".into(), true).await.unwrap();
    published(&w).await;

    let link = inkwell_api::deep_link::DeepLink::Group(group.group.id);
    let err = w.service.open_deep_link(stranger, link).await.unwrap_err();
    assert!(matches!(err, ApiError::Store(StoreError::Forbidden(_))));

    let db = w.service.db();
    assert_eq!(db.role_of(group.group.id, stranger).unwrap(), None);
    assert!(db.conversations_for_user(stranger).unwrap().is_empty());
    assert!(db.groups_for_user(stranger).unwrap().is_empty());
    assert!(published(&w).await.is_empty());
}

/// A reconnecting client pulls exactly the tail it missed.
#[tokio::test]
async fn pull_after_reconnect_returns_missed_tail() {
    let w = world();
    let (admin, reader) = (Uuid::new_v4(), Uuid::new_v4());
    let group = w.service.create_group(admin, "g".into(), false).await.unwrap();
    w.service.set_role(admin, group.group.id, reader, Role::Member).await.unwrap();
    let channel = ContainerId::Channel(group.channels[0].id);

    for i in 1..=42 {
        let sent = w.service.send_message(admin, channel, format!("m{i}"), None).await.unwrap();
        assert_eq!(sent.sequence, i);
    }

    let page = w.service.messages_after(reader, channel, 40, None).await.unwrap();
    let sequences: Vec<u64> = page.messages.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, vec![41, 42]);
}

/// A user link opens a conversation that both sides can write to.
#[tokio::test]
async fn user_deep_link_opens_writable_conversation() {
    let w = world();
    let (me, friend) = (Uuid::new_v4(), Uuid::new_v4());
    let view = w
        .service
        .open_deep_link(me, inkwell_api::deep_link::DeepLink::User(friend))
        .await
        .unwrap();
    let DeepLinkView::Conversation { conversation } = view else {
        panic!("expected a conversation");
    };
    let dm = ContainerId::Conversation(conversation.conversation.id);

    w.service.send_message(friend, dm, "hey".into(), None).await.unwrap();
    assert_eq!(w.service.unread(me, dm).await.unwrap(), Some(1));
    assert_eq!(w.service.unread(friend, dm).await.unwrap(), Some(0));
}

// -- HTTP --

fn app(w: &World) -> axum::Router {
    router(AppStateInner::new(w.service.clone(), ConnectionRegistry::new(), SECRET))
}

fn request(method: &str, uri: &str, user: Option<Uuid>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token(user)));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn requests_without_a_valid_token_are_rejected() {
    let w = world();
    let response = app(&w).oneshot(request("GET", "/unread-summary", None, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let forged = Request::builder()
        .uri("/unread-summary")
        .header(header::AUTHORIZATION, "Bearer not-a-token")
        .body(Body::empty())
        .unwrap();
    let response = app(&w).oneshot(forged).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn send_and_pull_over_http() {
    let w = world();
    let (me, friend) = (Uuid::new_v4(), Uuid::new_v4());

    let response = app(&w)
        .oneshot(request("POST", "/conversations", Some(me), Some(json!({ "peerId": friend }))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let conversation_id = json_body(response).await["conversation"]["id"].as_str().unwrap().to_string();

    let correlation = Uuid::new_v4();
    let response = app(&w)
        .oneshot(request(
            "POST",
            &format!("/conversations/{conversation_id}/messages"),
            Some(me),
            Some(json!({ "body": "hello", "correlationId": correlation })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let sent = json_body(response).await;
    assert_eq!(sent["sequence"], 1);
    assert_eq!(sent["correlationId"], correlation.to_string());

    let response = app(&w)
        .oneshot(request("GET", &format!("/conversations/{conversation_id}/messages?after=0"), Some(friend), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let page = json_body(response).await;
    assert_eq!(page["messages"].as_array().unwrap().len(), 1);

    let response = app(&w).oneshot(request("GET", "/unread-summary", Some(friend), None)).await.unwrap();
    assert_eq!(json_body(response).await["total"], 1);
}

#[tokio::test]
async fn store_errors_surface_as_json_bodies() {
    let w = world();
    let (owner, stranger) = (Uuid::new_v4(), Uuid::new_v4());
    let group = w.service.create_group(owner, "closed".into(), true).await.unwrap();
    let channel_id = group.channels[0].id;

    let response = app(&w)
        .oneshot(request(
            "POST",
            &format!("/channels/{channel_id}/messages"),
            Some(stranger),
            Some(json!({ "body": "hi" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"], "forbidden");

    let response = app(&w)
        .oneshot(request("DELETE", &format!("/messages/{}", Uuid::new_v4()), Some(owner), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app(&w)
        .oneshot(request("GET", &format!("/deep-links/group/{}", group.group.id), Some(stranger), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn reactions_on_registered_reviews() {
    let w = world();
    let user = Uuid::new_v4();
    let review = Uuid::new_v4();

    let response = app(&w)
        .oneshot(request("POST", &format!("/reactions/review/{review}"), Some(user), Some(json!({ "emoji": "👏" }))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app(&w)
        .oneshot(request("PUT", &format!("/reaction-targets/review/{review}"), Some(user), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app(&w)
        .oneshot(request("POST", &format!("/reactions/review/{review}"), Some(user), Some(json!({ "emoji": "👏" }))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let toggled = json_body(response).await;
    assert_eq!(toggled["added"], true);
    assert_eq!(toggled["reactions"][0]["count"], 1);
}
