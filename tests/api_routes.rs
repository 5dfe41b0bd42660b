use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use pagecraft::api::create_router;
use pagecraft::config::{AppConfig, Backend};
use pagecraft::store::MemoryStore;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app() -> Router {
    let mut config = AppConfig::default();
    config.database.backend = Backend::Memory;
    let state = pagecraft::services(MemoryStore::new(), &config).unwrap();
    create_router().with_state(state)
}

async fn call(app: &Router, method: Method, uri: &str, user: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-user-id", user)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// Project "Demo" with page "Home", owned by alice
async fn demo(app: &Router) -> (i64, i64) {
    let (status, project) = call(app, Method::POST, "/projects", "alice", Some(json!({ "name": "Demo" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    let project_id = project["id"].as_i64().unwrap();

    let (status, page) = call(
        app,
        Method::POST,
        &format!("/projects/{}/pages", project_id),
        "alice",
        Some(json!({ "name": "Home" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(page["slug"], "home");
    (project_id, page["id"].as_i64().unwrap())
}

#[tokio::test]
async fn test_health() {
    let app = app();
    let (status, body) = call(&app, Method::GET, "/health", "alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_element_lifecycle() {
    let app = app();
    let (_project_id, page_id) = demo(&app).await;

    let (status, created) = call(
        &app,
        Method::POST,
        &format!("/pages/{}/elements", page_id),
        "alice",
        Some(json!({ "elementType": "heading", "content": "Welcome" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["outcome"], "created");
    let heading_id = created["element"]["id"].as_i64().unwrap();

    let (status, batch) = call(
        &app,
        Method::POST,
        &format!("/pages/{}/elements/batch", page_id),
        "alice",
        Some(json!([
            { "element_type": "section" },
            { "element_type": "p", "parent": { "batch_index": 0 }, "content": "Intro" }
        ])),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let section_id = batch[0]["id"].as_i64().unwrap();

    let (status, tree) = call(&app, Method::GET, &format!("/pages/{}/elements", page_id), "alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tree.as_array().unwrap().len(), 2);

    let (status, updated) = call(
        &app,
        Method::PATCH,
        &format!("/elements/{}", heading_id),
        "alice",
        Some(json!({ "parent_id": section_id, "styles": { "color": "red" } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["element"]["parent_id"], section_id);
    assert_eq!(updated["element"]["styles"]["color"], "red");
    assert_eq!(updated["element"]["styles"]["width"], "100%");

    let (status, moved) = call(
        &app,
        Method::PATCH,
        "/elements/batch",
        "alice",
        Some(json!([{ "id": heading_id, "parent_id": null }])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(moved["updated"], 1);

    let (status, deleted) = call(&app, Method::DELETE, &format!("/elements/{}", section_id), "alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["count"], 2);

    let (status, _) = call(&app, Method::GET, &format!("/elements/{}", section_id), "alice", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_other_users_get_forbidden() {
    let app = app();
    let (project_id, page_id) = demo(&app).await;

    let (status, body) = call(&app, Method::GET, &format!("/projects/{}", project_id), "mallory", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "authorization");

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/pages/{}/elements", page_id),
        "mallory",
        Some(json!({ "elementType": "p" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(&app, Method::GET, "/projects/424242", "alice", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    let (status, projects) = call(&app, Method::GET, "/projects", "mallory", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(projects.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_actions_report_failing_index() {
    let app = app();
    let (_project_id, page_id) = demo(&app).await;

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/pages/{}/actions", page_id),
        "alice",
        Some(json!([
            { "type": "createElement", "data": { "type": "div" } },
            { "type": "frobnicate" }
        ])),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");
    assert_eq!(body["index"], 1);

    let (status, outcomes) = call(
        &app,
        Method::POST,
        &format!("/pages/{}/actions", page_id),
        "alice",
        Some(json!([
            { "type": "createElement", "data": { "type": "div" } },
            { "type": "clearPage" }
        ])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcomes[1]["outcome"], "page_cleared");
    assert_eq!(outcomes[1]["count"], 1);
}

#[tokio::test]
async fn test_duplicate_integrity_and_delete_project() {
    let app = app();
    let (project_id, page_id) = demo(&app).await;
    call(
        &app,
        Method::POST,
        &format!("/pages/{}/elements", page_id),
        "alice",
        Some(json!({ "elementType": "p", "content": "hello" })),
    )
    .await;

    let (status, copy) = call(
        &app,
        Method::POST,
        &format!("/projects/{}/duplicate", project_id),
        "alice",
        Some(json!({ "name": "Demo v2" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(copy["elements"], 1);
    let copy_id = copy["project_id"].as_i64().unwrap();

    let (status, report) = call(&app, Method::GET, &format!("/projects/{}/integrity", copy_id), "alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["project_exists"], true);
    assert!(report["orphans"].as_array().unwrap().is_empty());

    let (status, summary) = call(&app, Method::DELETE, &format!("/projects/{}", project_id), "alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["pages"], 1);
    assert_eq!(summary["elements"], 1);

    let (status, projects) = call(&app, Method::GET, "/projects", "alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(projects.as_array().unwrap().len(), 1);
    assert_eq!(projects[0]["name"], "Demo v2");
}
