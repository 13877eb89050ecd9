mod common;

use axum::http::StatusCode;
use nest_types::api::Detail;
use nest_types::models::{Role, User};
use serde_json::json;
use uuid::Uuid;

use common::{TEST_PASSWORD, spawn_app};

fn role_path(id: Uuid) -> String {
    format!("/api/v1/admin/users/{}/role", id)
}

#[tokio::test]
async fn admin_changes_role() {
    let app = spawn_app();
    let token = app.admin_token("root@example.com").await;
    let target = app.register("tenant@example.com", "seeker").await;

    let response = app
        .server
        .patch(&role_path(target.id))
        .authorization_bearer(&token)
        .json(&json!({ "role": "owner" }))
        .await;
    response.assert_status_ok();
    assert_eq!(
        response.json::<Detail>().detail,
        "Role successfully updated to owner"
    );

    let account = app
        .state
        .db
        .get_account_by_id(&target.id.to_string())
        .unwrap()
        .unwrap();
    assert_eq!(account.role, "owner");
}

#[tokio::test]
async fn invalid_role_is_400() {
    let app = spawn_app();
    let token = app.admin_token("root@example.com").await;
    let target = app.register("tenant@example.com", "seeker").await;

    for body in [
        json!({ "role": "overlord" }),
        json!({ "role": "Admin" }),
        json!({}),
    ] {
        let response = app
            .server
            .patch(&role_path(target.id))
            .authorization_bearer(&token)
            .json(&body)
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(response.json::<Detail>().detail, "Invalid role");
    }

    let account = app
        .state
        .db
        .get_account_by_id(&target.id.to_string())
        .unwrap()
        .unwrap();
    assert_eq!(account.role, "seeker");
}

#[tokio::test]
async fn unknown_target_is_404() {
    let app = spawn_app();
    let token = app.admin_token("root@example.com").await;

    let response = app
        .server
        .patch(&role_path(Uuid::new_v4()))
        .authorization_bearer(&token)
        .json(&json!({ "role": "owner" }))
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(response.json::<Detail>().detail, "User not found");
}

#[tokio::test]
async fn malformed_id_is_400() {
    let app = spawn_app();
    let token = app.admin_token("root@example.com").await;

    app.server
        .patch("/api/v1/admin/users/42/role")
        .authorization_bearer(&token)
        .json(&json!({ "role": "owner" }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn anonymous_request_is_401() {
    let app = spawn_app();
    let target = app.register("tenant@example.com", "seeker").await;

    let response = app
        .server
        .patch(&role_path(target.id))
        .json(&json!({ "role": "admin" }))
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);

    app.server
        .patch(&role_path(target.id))
        .authorization_bearer("not-a-jwt")
        .json(&json!({ "role": "admin" }))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn non_admin_is_403() {
    let app = spawn_app();

    for role in ["seeker", "owner", "manager"] {
        let email = format!("{}@example.com", role);
        let user = app.active_user(&email, role).await;
        let token = app.login(&email, TEST_PASSWORD).await;

        let response = app
            .server
            .patch(&role_path(user.id))
            .authorization_bearer(&token)
            .json(&json!({ "role": "admin" }))
            .await;
        response.assert_status(StatusCode::FORBIDDEN);
        assert_eq!(
            response.json::<Detail>().detail,
            "You do not have permission to perform this action."
        );

        let account = app
            .state
            .db
            .get_account_by_id(&user.id.to_string())
            .unwrap()
            .unwrap();
        assert_eq!(account.role, role);
    }
}

#[tokio::test]
async fn demoted_admin_loses_access_immediately() {
    let app = spawn_app();
    let root_token = app.admin_token("root@example.com").await;
    let deputy = app.active_user("deputy@example.com", "seeker").await;

    app.server
        .patch(&role_path(deputy.id))
        .authorization_bearer(&root_token)
        .json(&json!({ "role": "admin" }))
        .await
        .assert_status_ok();
    let deputy_token = app.login("deputy@example.com", TEST_PASSWORD).await;

    let me = app
        .server
        .get("/api/v1/auth/users/me")
        .authorization_bearer(&deputy_token)
        .await
        .json::<User>();
    assert_eq!(me.role, Role::Admin);

    app.server
        .patch(&role_path(deputy.id))
        .authorization_bearer(&root_token)
        .json(&json!({ "role": "manager" }))
        .await
        .assert_status_ok();

    // Same token, but the stored role is now manager.
    app.server
        .patch(&role_path(deputy.id))
        .authorization_bearer(&deputy_token)
        .json(&json!({ "role": "admin" }))
        .await
        .assert_status(StatusCode::FORBIDDEN);
}
