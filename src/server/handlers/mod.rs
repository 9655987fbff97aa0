use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use crate::server::AppState;

mod admin_logs;
mod chat;
mod credentials;
mod pools;
mod quotas;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(chat::health))
        // 三种入站协议
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/messages", post(chat::messages))
        .route("/v1/models/{action}", post(chat::generate_content))
        .route("/v1beta/models/{action}", post(chat::generate_content))
        // 号池管理
        .route(
            "/admin/account-pools",
            get(pools::list_pools).post(pools::create_pool),
        )
        .route(
            "/admin/account-pools/batch-import",
            post(pools::batch_import_accounts),
        )
        .route(
            "/admin/account-pools/batch-import-json",
            post(pools::batch_import_accounts_json),
        )
        .route(
            "/admin/account-pools/{id}",
            get(pools::get_pool)
                .put(pools::update_pool)
                .delete(pools::delete_pool),
        )
        .route("/admin/account-pools/{id}/toggle", post(pools::toggle_pool))
        .route("/admin/account-pools/{id}/stats", get(pools::pool_stats))
        // 凭据管理
        .route(
            "/admin/credentials",
            get(credentials::list_credentials).post(credentials::create_credential),
        )
        .route(
            "/admin/credentials/{id}",
            get(credentials::get_credential)
                .put(credentials::update_credential)
                .delete(credentials::delete_credential),
        )
        .route(
            "/admin/credentials/{id}/toggle",
            post(credentials::toggle_credential),
        )
        .route(
            "/admin/credentials/{id}/refresh",
            post(credentials::refresh_credential),
        )
        .route("/admin/logs", get(admin_logs::list_request_logs))
        .route("/admin/quotas", post(quotas::grant_quota))
        .route("/admin/quotas/{user}", get(quotas::get_quota))
}

#[cfg(test)]
mod tests {
    use crate::config::Settings;
    use crate::logging::database::tests::temp_logger;
    use crate::server::{AppState, router};
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const ADMIN: &str = "Bearer admin-secret";

    async fn app() -> (TempDir, Router) {
        let (dir, db) = temp_logger().await;
        let mut settings = Settings::default();
        settings.server.admin_token = Some("admin-secret".into());
        let state = AppState::new(settings, Arc::new(db)).unwrap();
        (dir, router(Arc::new(state)))
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", ADMIN);
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn health_is_public() {
        let (_dir, app) = app().await;
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&bytes).unwrap(), json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn admin_routes_require_token() {
        let (_dir, app) = app().await;
        let resp = app
            .oneshot(Request::get("/admin/account-pools").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn pool_and_credential_lifecycle() {
        let (_dir, app) = app().await;

        let (status, err) = call(&app, Method::POST, "/admin/account-pools", Some(json!({"name": "x", "provider": "mistral"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["code"], "invalid_request");

        let (status, err) = call(
            &app,
            Method::POST,
            "/admin/account-pools",
            Some(json!({"name": "x", "provider": "openai", "strategy": "fastest"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(err["message"].as_str().unwrap().contains("fastest"));

        let (status, pool) = call(
            &app,
            Method::POST,
            "/admin/account-pools",
            Some(json!({"name": "main", "provider": "anthropic"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(pool["strategy"], "round_robin");
        assert_eq!(pool["health_check_interval_secs"], 300);
        assert_eq!(pool["health_check_timeout_secs"], 10);
        assert_eq!(pool["max_retries"], 3);
        let pool_id = pool["id"].as_i64().unwrap();

        let (status, cred) = call(
            &app,
            Method::POST,
            "/admin/credentials",
            Some(json!({"pool_id": pool_id, "auth_type": "api_key", "api_key": "sk-ant-1234567890", "weight": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(cred["weight"], 1);
        assert_eq!(cred["provider"], "anthropic");
        assert_eq!(cred["secret_hint"], "sk-a****7890");
        let cred_id = cred["id"].as_i64().unwrap();

        let (_, toggled) = call(&app, Method::POST, &format!("/admin/credentials/{}/toggle", cred_id), None).await;
        assert_eq!(toggled["is_active"], false);

        let (_, stats) = call(&app, Method::GET, &format!("/admin/account-pools/{}/stats", pool_id), None).await;
        assert_eq!(stats["credentials"]["total"], 1);
        assert_eq!(stats["credentials"]["active"], 0);
        assert_eq!(stats["is_healthy"], true);

        let (status, _) = call(&app, Method::DELETE, &format!("/admin/credentials/{}", cred_id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, Method::GET, &format!("/admin/credentials/{}", cred_id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn batch_import_json_variant() {
        let (_dir, app) = app().await;
        let (_, pool) = call(
            &app,
            Method::POST,
            "/admin/account-pools",
            Some(json!({"name": "imports", "provider": "kiro"})),
        )
        .await;
        let pool_id = pool["id"].as_i64().unwrap();

        let (status, _) = call(
            &app,
            Method::POST,
            "/admin/account-pools/batch-import-json",
            Some(json!({"pool_id": pool_id, "json_data": "not json"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let accounts = json!([
            {"email": "a@example.com", "credentials": {"accessToken": "at-a", "refreshToken": "rt-a"}},
            {"email": "a@example.com", "credentials": {"accessToken": "at-b", "refreshToken": "rt-b"}},
            {"email": "c@example.com", "credentials": {"accessToken": "at-c"}, "status": "disabled"}
        ]);
        let (status, report) = call(
            &app,
            Method::POST,
            "/admin/account-pools/batch-import-json",
            Some(json!({"pool_id": pool_id, "json_data": accounts.to_string(), "weight": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["total"], 3);
        assert_eq!(report["success"], 2);
        assert_eq!(report["failed"], 1);
        assert!(report["errors"][0].as_str().unwrap().starts_with("Account 2 (a@example.com)"));

        let (_, creds) = call(&app, Method::GET, &format!("/admin/credentials?pool_id={}", pool_id), None).await;
        let creds = creds.as_array().unwrap();
        assert_eq!(creds.len(), 2);
        assert!(creds.iter().all(|c| c["auth_type"] == "oauth" && c["weight"] == 2));
        assert_eq!(creds.iter().filter(|c| c["is_active"] == true).count(), 1);
    }

    #[tokio::test]
    async fn kiro_pools_take_oauth_accounts_only() {
        let (_dir, app) = app().await;
        let (_, claude) = call(
            &app,
            Method::POST,
            "/admin/account-pools",
            Some(json!({"name": "claude", "provider": "anthropic"})),
        )
        .await;
        let accounts = json!([{"email": "a@example.com", "credentials": {"accessToken": "aoa", "refreshToken": "aor"}}]);
        let (status, err) = call(
            &app,
            Method::POST,
            "/admin/account-pools/batch-import",
            Some(json!({"pool_id": claude["id"], "accounts": accounts})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(err["message"].as_str().unwrap().contains("kiro pool"));

        let (status, kiro) = call(
            &app,
            Method::POST,
            "/admin/account-pools",
            Some(json!({"name": "kiro", "provider": "kiro"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(kiro["provider"], "kiro");
        let (status, _) = call(
            &app,
            Method::POST,
            "/admin/credentials",
            Some(json!({"pool_id": kiro["id"], "auth_type": "api_key", "api_key": "sk-1234567890"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, report) = call(
            &app,
            Method::POST,
            "/admin/account-pools/batch-import",
            Some(json!({"pool_id": kiro["id"], "accounts": accounts})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["success"], 1);
    }

    #[tokio::test]
    async fn gemini_path_must_name_an_operation() {
        let (_dir, app) = app().await;
        let (status, err) = call(
            &app,
            Method::POST,
            "/v1beta/models/gemini-pro",
            Some(json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["code"], "invalid_request");
    }

    #[tokio::test]
    async fn quota_grant_accumulates() {
        let (_dir, app) = app().await;
        let (status, _) = call(&app, Method::POST, "/admin/quotas", Some(json!({"user": "tok", "amount": 0}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        call(&app, Method::POST, "/admin/quotas", Some(json!({"user": "tok", "amount": 100}))).await;
        let (_, out) = call(&app, Method::POST, "/admin/quotas", Some(json!({"user": "tok", "amount": 50}))).await;
        assert_eq!(out["remaining"], 150);
        let (_, out) = call(&app, Method::GET, "/admin/quotas/tok", None).await;
        assert_eq!(out["remaining"], 150);
    }
}
