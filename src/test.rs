use crate::accounts::{AccountError, AccountStore, Clock, NewUser, UserFilter};
use crate::models::{Role, Status};
use crate::storage::{KeyValueStore, MemoryKeyValueStore, keys};

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::{Arc, Mutex};

// Clock that only moves when told to
#[derive(Debug)]
struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    fn new() -> Self {
        Self(Mutex::new(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()))
    }

    fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

// Helper function to set up a store over a fresh in-memory backend
fn setup_store() -> (Arc<MemoryKeyValueStore>, Arc<ManualClock>, AccountStore) {
    setup_store_with(MemoryKeyValueStore::new())
}

fn setup_store_with(
    kv: MemoryKeyValueStore,
) -> (Arc<MemoryKeyValueStore>, Arc<ManualClock>, AccountStore) {
    let kv = Arc::new(kv);
    let clock = Arc::new(ManualClock::new());
    let store = AccountStore::with_clock(kv.clone(), clock.clone());
    (kv, clock, store)
}

// Helper function to create an account with a given role
async fn create_with_role(store: &AccountStore, username: &str, role: Role) {
    store
        .create_user(NewUser {
            username: username.to_string(),
            password: format!("{username}-pw"),
            email: format!("{username}@example.com"),
            display_name: String::new(),
            role,
        })
        .await
        .expect("Failed to create user");
}

async fn raw_users(kv: &MemoryKeyValueStore) -> String {
    kv.get(keys::USERS)
        .await
        .unwrap()
        .expect("users should be persisted")
}

#[cfg(test)]
mod account_store_tests {
    use super::*;

    #[tokio::test]
    async fn test_register_rejects_case_variant_and_authenticates_any_case() {
        let (_kv, _clock, store) = setup_store();

        store
            .register("Alice", "pw1", "a@x.com", "Alice")
            .await
            .expect("first registration succeeds");

        let duplicate = store.register("alice", "pw2", "b@x.com", "alice").await;
        assert!(matches!(duplicate, Err(AccountError::AlreadyExists(key)) if key == "alice"));

        let record = store.authenticate("ALICE", "pw1").await.unwrap();
        assert_eq!(record.display_name, "Alice");
        assert_eq!(record.email, "a@x.com");
        assert_eq!(record.role, Role::User);
        assert_eq!(record.status, Status::Active);
        assert_eq!(record.last_login, None);
    }

    #[tokio::test]
    async fn test_register_requires_username_and_password() {
        let (_kv, _clock, store) = setup_store();

        assert!(matches!(
            store.register("   ", "pw", "", "").await,
            Err(AccountError::InvalidInput(_))
        ));
        assert!(matches!(
            store.register("bob", "  ", "", "").await,
            Err(AccountError::InvalidInput(_))
        ));
        assert_eq!(store.user_count().await, 0);
    }

    #[tokio::test]
    async fn test_register_keeps_original_casing_for_display() {
        let (_kv, clock, store) = setup_store();

        store.register("  MixedCase ", "pw", "", "").await.unwrap();

        let dir = store.load().await;
        let record = &dir["mixedcase"];
        assert_eq!(record.display_name, "MixedCase");
        assert_eq!(record.join_date, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_authenticate_checks_password_before_status() {
        let (_kv, _clock, store) = setup_store();
        create_with_role(&store, "bob", Role::User).await;
        store.set_status("bob", Status::Banned, None).await.unwrap();

        assert!(matches!(
            store.authenticate("bob", "wrong").await,
            Err(AccountError::WrongPassword)
        ));
        assert!(matches!(
            store.authenticate("bob", "bob-pw").await,
            Err(AccountError::Banned)
        ));
        assert!(matches!(
            store.authenticate("nobody", "x").await,
            Err(AccountError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_authenticate_ignores_elapsed_suspension() {
        let (_kv, clock, store) = setup_store();
        create_with_role(&store, "bob", Role::User).await;
        store
            .set_status("bob", Status::Suspended, Some(1))
            .await
            .unwrap();

        clock.advance(Duration::minutes(5));

        assert!(matches!(
            store.authenticate("bob", "bob-pw").await,
            Err(AccountError::Suspended)
        ));
    }

    #[tokio::test]
    async fn test_sole_admin_cannot_be_demoted_or_deleted() {
        let (kv, _clock, store) = setup_store();
        create_with_role(&store, "root", Role::Admin).await;
        create_with_role(&store, "bob", Role::User).await;
        let before = raw_users(&kv).await;

        assert!(matches!(
            store.set_role("root", Role::User).await,
            Err(AccountError::LastAdminViolation)
        ));
        assert!(matches!(
            store.delete_user("root").await,
            Err(AccountError::LastAdminViolation)
        ));
        assert_eq!(raw_users(&kv).await, before);

        // Re-asserting admin on the sole admin is not a removal
        store.set_role("root", Role::Admin).await.unwrap();
    }

    #[tokio::test]
    async fn test_second_admin_can_be_removed() {
        let (_kv, _clock, store) = setup_store();
        create_with_role(&store, "root", Role::Admin).await;
        create_with_role(&store, "ops", Role::Admin).await;

        store.set_role("ops", Role::Moderator).await.unwrap();
        assert!(matches!(
            store.set_role("root", Role::User).await,
            Err(AccountError::LastAdminViolation)
        ));

        store.set_role("ops", Role::Admin).await.unwrap();
        store.delete_user("root").await.unwrap();

        let dir = store.load().await;
        assert!(!dir.contains_key("root"));
        assert_eq!(dir["ops"].role, Role::Admin);
    }

    #[tokio::test]
    async fn test_no_operation_sequence_removes_every_admin() {
        let (_kv, _clock, store) = setup_store();
        let names = ["a", "b", "c", "d"];
        create_with_role(&store, "a", Role::Admin).await;
        for name in &names[1..] {
            create_with_role(&store, name, Role::User).await;
        }

        let roles = [Role::User, Role::Moderator, Role::Admin];
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..200 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let name = names[(seed % names.len() as u64) as usize];

            if (seed >> 8) % 5 == 0 {
                let _ = store.delete_user(name).await;
                // Bring the account back so later steps still have targets
                if !store.load().await.contains_key(name) {
                    create_with_role(&store, name, Role::User).await;
                }
            } else {
                let role = roles[((seed >> 16) % roles.len() as u64) as usize];
                let _ = store.set_role(name, role).await;
            }

            let admins = store.load().await.values().filter(|u| u.is_admin()).count();
            assert!(admins >= 1, "directory lost its last admin");
        }
    }

    #[tokio::test]
    async fn test_unknown_user_operations_report_not_found() {
        let (_kv, _clock, store) = setup_store();

        assert!(matches!(
            store.set_role("ghost", Role::Admin).await,
            Err(AccountError::NotFound(_))
        ));
        assert!(matches!(
            store.set_status("ghost", Status::Banned, None).await,
            Err(AccountError::NotFound(_))
        ));
        assert!(matches!(
            store.reset_password("ghost", "pw").await,
            Err(AccountError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_user("ghost").await,
            Err(AccountError::NotFound(_))
        ));
        assert!(matches!(
            store.view_user("ghost").await,
            Err(AccountError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_password_replaces_credentials() {
        let (_kv, _clock, store) = setup_store();
        create_with_role(&store, "bob", Role::User).await;

        store.reset_password("BOB", "fresh").await.unwrap();

        assert!(matches!(
            store.authenticate("bob", "bob-pw").await,
            Err(AccountError::WrongPassword)
        ));
        assert!(store.authenticate("bob", "fresh").await.is_ok());
    }

    #[tokio::test]
    async fn test_legacy_list_is_upgraded_and_persisted() {
        let kv = MemoryKeyValueStore::with_entries([(
            keys::USERS,
            r#"[{"username":"Bob"},{"displayName":"Ann"}]"#,
        )]);
        let (kv, _clock, store) = setup_store_with(kv);

        let dir = store.load().await;
        let keys: Vec<&str> = dir.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["bob", "ann"]);

        let persisted: serde_json::Value = serde_json::from_str(&raw_users(&kv).await).unwrap();
        assert!(persisted.is_object());
        assert!(persisted.get("bob").is_some());
        assert!(persisted.get("ann").is_some());
    }

    #[tokio::test]
    async fn test_corrupt_store_behaves_as_empty() {
        let kv = MemoryKeyValueStore::with_entries([(keys::USERS, "{{{ definitely not json")]);
        let (_kv, _clock, store) = setup_store_with(kv);

        assert!(store.load().await.is_empty());

        store.register("bob", "pw", "", "").await.unwrap();
        assert_eq!(store.user_count().await, 1);
    }

    #[tokio::test]
    async fn test_suspension_sets_deadline_and_expires_on_display_read() {
        let (kv, clock, store) = setup_store();
        create_with_role(&store, "bob", Role::User).await;

        store
            .set_status("bob", Status::Suspended, Some(60))
            .await
            .unwrap();
        let dir = store.load().await;
        assert_eq!(dir["bob"].status, Status::Suspended);
        assert_eq!(
            dir["bob"].suspended_until,
            Some(clock.now() + Duration::minutes(60))
        );

        let detail = store.view_user("bob").await.unwrap();
        assert_eq!(detail.suspension_remaining_secs, Some(3600));

        clock.advance(Duration::minutes(61));

        let listed = store.list_filtered(&UserFilter::default()).await.unwrap();
        let (_, bob) = listed.iter().find(|(key, _)| key == "bob").unwrap();
        assert_eq!(bob.status, Status::Active);
        assert_eq!(bob.suspended_until, None);

        let persisted = raw_users(&kv).await;
        assert!(!persisted.contains("suspendedUntil"));
        assert!(!persisted.contains("suspended\""));
    }

    #[tokio::test]
    async fn test_suspension_requires_duration_and_other_statuses_clear_it() {
        let (_kv, _clock, store) = setup_store();
        create_with_role(&store, "bob", Role::User).await;

        for minutes in [None, Some(0)] {
            assert!(matches!(
                store.set_status("bob", Status::Suspended, minutes).await,
                Err(AccountError::InvalidInput(_))
            ));
        }

        store
            .set_status("bob", Status::Suspended, Some(30))
            .await
            .unwrap();
        store.set_status("bob", Status::Banned, None).await.unwrap();

        let dir = store.load().await;
        assert_eq!(dir["bob"].status, Status::Banned);
        assert_eq!(dir["bob"].suspended_until, None);
    }

    #[tokio::test]
    async fn test_refresh_suspensions_counts_expired_records() {
        let (_kv, clock, store) = setup_store();
        for name in ["a", "b", "c"] {
            create_with_role(&store, name, Role::User).await;
        }
        store.set_status("a", Status::Suspended, Some(5)).await.unwrap();
        store.set_status("b", Status::Suspended, Some(120)).await.unwrap();

        assert_eq!(store.refresh_suspensions().await.unwrap(), 0);

        clock.advance(Duration::minutes(10));
        assert_eq!(store.refresh_suspensions().await.unwrap(), 1);

        let dir = store.load().await;
        assert_eq!(dir["a"].status, Status::Active);
        assert_eq!(dir["b"].status, Status::Suspended);
    }

    #[tokio::test]
    async fn test_list_filtered_matches_and_orders_by_key() {
        let (_kv, _clock, store) = setup_store();
        create_with_role(&store, "zed", Role::Moderator).await;
        create_with_role(&store, "amy", Role::Admin).await;
        create_with_role(&store, "Mia", Role::User).await;
        store.set_status("zed", Status::Banned, None).await.unwrap();

        let all = store.list_filtered(&UserFilter::default()).await.unwrap();
        let keys: Vec<&str> = all.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["amy", "mia", "zed"]);

        let by_email = store
            .list_filtered(&UserFilter {
                query: "MIA@EXAMPLE".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_email.len(), 1);
        assert_eq!(by_email[0].0, "mia");

        let banned_mods = store
            .list_filtered(&UserFilter {
                query: String::new(),
                role: Some(Role::Moderator),
                status: Some(Status::Banned),
            })
            .await
            .unwrap();
        assert_eq!(banned_mods.len(), 1);
        assert_eq!(banned_mods[0].0, "zed");

        let none = store
            .list_filtered(&UserFilter {
                role: Some(Role::Admin),
                status: Some(Status::Banned),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_save_of_load_is_byte_identical() {
        let (kv, _clock, store) = setup_store();
        create_with_role(&store, "root", Role::Admin).await;
        store.register("Alice", "pw1", "a@x.com", "Alice").await.unwrap();
        store.set_status("alice", Status::Suspended, Some(15)).await.unwrap();
        store.record_login("root").await.unwrap();

        let before = raw_users(&kv).await;
        let dir = store.load().await;
        store.save(&dir).await.unwrap();
        assert_eq!(raw_users(&kv).await, before);
    }

    #[tokio::test]
    async fn test_save_of_load_preserves_records_written_by_pages() {
        let stored = concat!(
            r#"{"zoe":{"password":"pw","email":"","displayName":"Zoe","status":"active"},"#,
            r#""alice":{"displayName":"Alice","password":"pw","joinDate":"January 2025","#,
            r#""lastLogin":"2025-02-01T08:30:00.000Z","theme":"dark"}}"#
        );
        let kv = MemoryKeyValueStore::with_entries([(keys::USERS, stored)]);
        let (kv, _clock, store) = setup_store_with(kv);

        let dir = store.load().await;
        store.save(&dir).await.unwrap();
        assert_eq!(raw_users(&kv).await, stored);

        store.register("carol", "pw", "", "").await.unwrap();
        let persisted = raw_users(&kv).await;
        assert!(persisted.starts_with(&stored[..stored.len() - 1]));
    }

    #[tokio::test]
    async fn test_malformed_admin_record_survives_writes() {
        let stored = r#"{"root":{"password":"pw","role":"admin","lastLogin":""},"bob":{"password":"x"}}"#;
        let kv = MemoryKeyValueStore::with_entries([(keys::USERS, stored)]);
        let (kv, _clock, store) = setup_store_with(kv);

        store.register("carol", "pw", "", "").await.unwrap();

        let persisted = raw_users(&kv).await;
        assert!(persisted.contains(r#""root":{"password":"pw","role":"admin","lastLogin":""}"#));
        let dir = store.load().await;
        assert_eq!(dir.len(), 3);
        assert_eq!(dir.values().filter(|u| u.is_admin()).count(), 1);

        assert!(matches!(
            store.delete_user("root").await,
            Err(AccountError::LastAdminViolation)
        ));
        assert!(store.authenticate("root", "pw").await.is_ok());
    }

    #[tokio::test]
    async fn test_unnormalized_keys_become_reachable() {
        let kv = MemoryKeyValueStore::with_entries([(
            keys::USERS,
            r#"{" Bob":{"password":"x"},"root":{"password":"pw","role":"admin"}}"#,
        )]);
        let (kv, _clock, store) = setup_store_with(kv);

        store.set_role("bob", Role::Moderator).await.unwrap();

        assert_eq!(store.load().await["bob"].role, Role::Moderator);
        assert!(raw_users(&kv).await.starts_with(r#"{"bob":"#));
    }

    #[tokio::test]
    async fn test_last_active_admin_cannot_be_banned_or_suspended() {
        let (_kv, _clock, store) = setup_store();
        create_with_role(&store, "root", Role::Admin).await;
        create_with_role(&store, "ops", Role::Admin).await;

        store.set_status("ops", Status::Banned, None).await.unwrap();

        assert!(matches!(
            store.set_status("root", Status::Banned, None).await,
            Err(AccountError::LastAdminViolation)
        ));
        assert!(matches!(
            store.set_status("root", Status::Suspended, Some(10)).await,
            Err(AccountError::LastAdminViolation)
        ));
        // Demoting the only admin who can still sign in is refused too
        assert!(matches!(
            store.set_role("root", Role::User).await,
            Err(AccountError::LastAdminViolation)
        ));

        store.set_status("ops", Status::Active, None).await.unwrap();
        store.set_status("root", Status::Banned, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_admin_reinstates_when_no_admin_can_sign_in() {
        let kv = MemoryKeyValueStore::with_entries([(
            keys::USERS,
            r#"{"root":{"password":"pw","role":"admin","status":"banned"}}"#,
        )]);
        let (_kv, _clock, store) = setup_store_with(kv);

        assert!(store.ensure_admin("root", "ignored").await.unwrap());
        assert!(store.authenticate("root", "pw").await.is_ok());
    }

    #[tokio::test]
    async fn test_record_login_marks_user_online() {
        let (_kv, clock, store) = setup_store();
        create_with_role(&store, "bob", Role::User).await;

        let record = store.record_login("bob").await.unwrap();
        assert_eq!(record.last_login, Some(clock.now()));
        assert!(store.view_user("bob").await.unwrap().online);

        clock.advance(Duration::minutes(6));
        assert!(!store.view_user("bob").await.unwrap().online);
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let (_kv, _clock, source) = setup_store();
        create_with_role(&source, "root", Role::Admin).await;
        create_with_role(&source, "bob", Role::User).await;
        let exported = source.export_json().await.unwrap();

        let (_kv, _clock, target) = setup_store();
        assert_eq!(target.import_json(&exported).await.unwrap(), 2);
        assert_eq!(target.load().await, source.load().await);
    }

    #[tokio::test]
    async fn test_import_validates_shape_and_admin_presence() {
        let (_kv, _clock, store) = setup_store();
        create_with_role(&store, "root", Role::Admin).await;

        assert!(matches!(
            store.import_json("not json").await,
            Err(AccountError::InvalidInput(_))
        ));
        assert!(matches!(
            store.import_json("17").await,
            Err(AccountError::InvalidInput(_))
        ));
        assert!(matches!(
            store.import_json(r#"{"bob":{"password":"x"}}"#).await,
            Err(AccountError::LastAdminViolation)
        ));

        let count = store
            .import_json(r#"[{"username":"Root","role":"admin"},{"username":"eve"}]"#)
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.load().await["root"].role, Role::Admin);
    }

    #[tokio::test]
    async fn test_ensure_admin_only_acts_without_admins() {
        let (_kv, _clock, store) = setup_store();
        create_with_role(&store, "bob", Role::User).await;

        assert!(store.ensure_admin("Bob", "ignored").await.unwrap());
        assert_eq!(store.load().await["bob"].role, Role::Admin);

        assert!(!store.ensure_admin("root", "pw").await.unwrap());
        assert!(!store.load().await.contains_key("root"));
    }

    #[tokio::test]
    async fn test_writes_publish_directory_notifications() {
        let (_kv, _clock, store) = setup_store();
        let mut events = store.subscribe();

        store.register("bob", "pw", "", "").await.unwrap();
        assert_eq!(events.recv().await.unwrap().user_count, 1);

        store.register("amy", "pw", "", "").await.unwrap();
        assert_eq!(events.recv().await.unwrap().user_count, 2);
    }
}

#[cfg(test)]
mod api_tests {
    use super::*;
    use crate::app::{self, AppState};
    use crate::ask::{AskService, ChatClient, RateLimiter, REFUSAL_REPLY};
    use axum::{
        Json, Router,
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode},
        routing::post,
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    // Helper function to build the router over an in-memory store
    fn test_app(upstream: Option<String>, api_key: Option<&str>, limit: u32) -> (Router, AppState) {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let client = ChatClient::new(
            upstream.unwrap_or_else(|| "http://127.0.0.1:9/unused".to_string()),
            api_key.map(str::to_string),
            "test-model".to_string(),
        );
        let state = AppState::new(
            kv.clone(),
            AccountStore::new(kv),
            AskService::new(client),
            RateLimiter::per_minute(limit),
        );
        (app::router(state.clone()), state)
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }

    async fn login(app: &Router, username: &str, password: &str) -> (StatusCode, Value) {
        send(
            app,
            Method::POST,
            "/api/login",
            Some(json!({ "username": username, "password": password })),
        )
        .await
    }

    // Helper function to serve a fake chat-completion endpoint
    async fn spawn_upstream(status: StatusCode, body: Value) -> String {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(move || {
                let body = body.clone();
                async move { (status, Json(body)) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/v1/chat/completions")
    }

    #[tokio::test]
    async fn test_health_reports_key_presence() {
        let (app, _) = test_app(None, None, 30);
        let (status, body) = send(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok", "openaiKeySet": false }));

        let (app, _) = test_app(None, Some("sk-test"), 30);
        let (_, body) = send(&app, Method::GET, "/api/health", None).await;
        assert_eq!(body["openaiKeySet"], true);
    }

    #[tokio::test]
    async fn test_ask_validation_blocklist_and_missing_key() {
        let (app, _) = test_app(None, None, 30);

        let (status, body) =
            send(&app, Method::POST, "/api/ask", Some(json!({ "question": "  " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid request: Missing question");

        let (status, _) = send(&app, Method::POST, "/api/ask", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/ask",
            Some(json!({ "question": "Who should I vote for?" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reply"], REFUSAL_REPLY);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/ask",
            Some(json!({ "question": "Why is the sky blue?" })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "server");
    }

    #[tokio::test]
    async fn test_ask_relays_upstream_reply() {
        let upstream = spawn_upstream(
            StatusCode::OK,
            json!({ "choices": [{ "message": { "content": "  Rayleigh scattering.  " } }] }),
        )
        .await;
        let (app, _) = test_app(Some(upstream), Some("sk-test"), 30);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/ask",
            Some(json!({ "question": "Why is the sky blue?" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reply"], "Rayleigh scattering.");
    }

    #[tokio::test]
    async fn test_ask_empty_upstream_choice_falls_back() {
        let upstream = spawn_upstream(StatusCode::OK, json!({ "choices": [] })).await;
        let (app, _) = test_app(Some(upstream), Some("sk-test"), 30);

        let (_, body) = send(&app, Method::POST, "/api/ask", Some(json!({ "question": 42 }))).await;
        assert_eq!(body["reply"], crate::ask::upstream::FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn test_ask_upstream_failure_is_bad_gateway() {
        let upstream = spawn_upstream(
            StatusCode::UNAUTHORIZED,
            json!({ "error": { "message": "bad key" } }),
        )
        .await;
        let (app, _) = test_app(Some(upstream), Some("sk-test"), 30);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/ask",
            Some(json!({ "question": "What is an atom?" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "Upstream model error");
        assert!(body["details"].as_str().unwrap().contains("bad key"));
    }

    #[tokio::test]
    async fn test_state_built_from_config() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let config = crate::config::Config {
            rate_limit_per_minute: 1,
            ..Default::default()
        };
        let app = app::router(AppState::from_config(kv, &config));

        let (status, body) = send(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["openaiKeySet"], false);

        let (status, _) = send(&app, Method::GET, "/api/users/count", None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_api_is_rate_limited() {
        let (app, _) = test_app(None, None, 2);

        for _ in 0..2 {
            let (status, _) = send(&app, Method::GET, "/api/health", None).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = send(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "Too many requests, please try again later.");
    }

    #[tokio::test]
    async fn test_register_login_session_logout() {
        let (app, _) = test_app(None, None, 100);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/register",
            Some(json!({ "username": "Alice", "password": "pw1", "email": "a@x.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["username"], "alice");

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/register",
            Some(json!({ "username": "ALICE", "password": "pw2" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = login(&app, "alice", "nope").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = login(&app, "ALICE", "pw1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["currentUser"], "Alice");
        assert!(body["user"]["lastLogin"].is_string());
        assert!(body["user"].get("password").is_none());

        let (_, body) = send(&app, Method::GET, "/api/session", None).await;
        assert_eq!(body["currentUser"], "Alice");
        assert_eq!(body["session"]["username"], "alice");
        assert_eq!(body["session"]["role"], "user");

        let (_, body) = send(&app, Method::GET, "/api/users/count", None).await;
        assert_eq!(body["count"], 1);

        let (status, _) = send(&app, Method::POST, "/api/logout", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, body) = send(&app, Method::GET, "/api/session", None).await;
        assert_eq!(body["currentUser"], Value::Null);
    }

    #[tokio::test]
    async fn test_admin_routes_require_admin_session() {
        let (app, state) = test_app(None, None, 100);
        state.accounts.ensure_admin("root", "rootpw").await.unwrap();
        state.accounts.register("bob", "pw", "", "Bob").await.unwrap();

        let (status, _) = send(&app, Method::GET, "/api/admin/users", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        login(&app, "bob", "pw").await;
        let (status, _) = send(&app, Method::GET, "/api/admin/users", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        login(&app, "root", "rootpw").await;
        let (status, body) = send(&app, Method::GET, "/api/admin/users?role=user", None).await;
        assert_eq!(status, StatusCode::OK);
        let users = body.as_array().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["username"], "bob");

        let (status, _) = send(&app, Method::GET, "/api/admin/users?role=owner", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_admin_manages_accounts() {
        let (app, state) = test_app(None, None, 100);
        state.accounts.ensure_admin("root", "rootpw").await.unwrap();
        login(&app, "root", "rootpw").await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/admin/users",
            Some(json!({
                "username": "Mod",
                "password": "modpw",
                "displayName": "The Moderator",
                "role": "moderator"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["username"], "mod");
        assert_eq!(body["role"], "moderator");

        let (status, body) = send(
            &app,
            Method::PUT,
            "/api/admin/users/mod/status",
            Some(json!({ "status": "suspended", "suspensionMinutes": 60 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "suspended");
        assert!(body["suspensionRemainingSecs"].as_i64().unwrap() > 3500);

        let (status, body) = login(&app, "mod", "modpw").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Your account is suspended");

        let (status, _) = send(
            &app,
            Method::PUT,
            "/api/admin/users/mod/password",
            Some(json!({ "password": "newpw" })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(
            &app,
            Method::PUT,
            "/api/admin/users/root/role",
            Some(json!({ "role": "user" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(&app, Method::DELETE, "/api/admin/users/root", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(&app, Method::DELETE, "/api/admin/users/mod", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, Method::GET, "/api/admin/users/mod", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_shared_display_name_does_not_borrow_admin_session() {
        let (app, state) = test_app(None, None, 100);
        state.accounts.register("root", "rootpw", "", "Root").await.unwrap();
        state.accounts.ensure_admin("root", "rootpw").await.unwrap();

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/register",
            Some(json!({ "username": "zed", "password": "zedpw", "displayName": "Root" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = login(&app, "zed", "zedpw").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["currentUser"], "Root");

        let (_, body) = send(&app, Method::GET, "/api/session", None).await;
        assert_eq!(body["session"]["username"], "zed");
        assert_eq!(body["session"]["role"], "user");

        let (status, _) = send(&app, Method::GET, "/api/admin/users", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        login(&app, "root", "rootpw").await;
        let (status, _) = send(&app, Method::GET, "/api/admin/users", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_banned_admin_loses_access_mid_session() {
        let (app, state) = test_app(None, None, 100);
        state.accounts.ensure_admin("root", "rootpw").await.unwrap();
        create_with_role(&state.accounts, "ops", Role::Admin).await;
        login(&app, "ops", "ops-pw").await;

        state
            .accounts
            .set_status("ops", Status::Banned, None)
            .await
            .unwrap();

        let (status, _) = send(&app, Method::GET, "/api/admin/users", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_export_and_import_endpoints() {
        let (app, state) = test_app(None, None, 100);
        state.accounts.ensure_admin("root", "rootpw").await.unwrap();
        login(&app, "root", "rootpw").await;

        let (status, exported) = send(&app, Method::GET, "/api/admin/export", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(exported["root"]["role"], "admin");

        let mut imported = exported.clone();
        imported["eve"] = json!({ "password": "evepw", "displayName": "Eve" });
        let (status, body) = send(&app, Method::POST, "/api/admin/import", Some(imported)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);

        let (status, _) = login(&app, "eve", "evepw").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_announcements_are_public_to_read_and_admin_to_write() {
        let (app, state) = test_app(None, None, 100);
        state.accounts.ensure_admin("root", "rootpw").await.unwrap();
        state.accounts.register("bob", "pw", "", "").await.unwrap();

        let draft = json!({ "title": "Lab day", "message": "Bring goggles", "priority": "high" });

        login(&app, "bob", "pw").await;
        let (status, _) = send(&app, Method::POST, "/api/announcements", Some(draft.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        login(&app, "root", "rootpw").await;
        let (status, created) = send(&app, Method::POST, "/api/announcements", Some(draft)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["author"], "root");

        let ts = created["timestamp"].as_i64().unwrap();
        let (status, edited) = send(
            &app,
            Method::PUT,
            &format!("/api/announcements/{ts}"),
            Some(json!({ "title": "Lab day moved", "message": "Now on Monday" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(edited["priority"], "normal");

        send(&app, Method::POST, "/api/logout", None).await;
        let (status, list) = send(&app, Method::GET, "/api/announcements", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["title"], "Lab day moved");

        let (status, _) = send(
            &app,
            Method::DELETE,
            &format!("/api/announcements/{}", edited["timestamp"]),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
