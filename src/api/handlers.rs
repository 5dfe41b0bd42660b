use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::logic::{
    ActionContext, ActionDispatcher, ActionOutcome, DeleteProjectSummary, DispatchError,
    DuplicateSummary, IntegrityReport,
};
use crate::model::{
    Element, ElementAction, ElementChanges, ElementId, ElementNode, ElementPatch, ElementUpdate,
    NewElement, NewPage, NewProject, Page, PageId, Project, ProjectId, ProjectUpdate, User,
    UserContext,
};
use crate::resilience::{CircuitBreakerRegistry, CircuitStats};
use crate::store::{ConnectionSource, ErrorKind, StoreError};

/// Shared handler state: the dispatcher (and through it the element store) plus
/// the process-wide circuit breakers
pub struct Services<S> {
    pub dispatcher: ActionDispatcher<S>,
    pub breakers: Arc<CircuitBreakerRegistry>,
}

pub type AppState<S> = Arc<Services<S>>;

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub circuits: Vec<CircuitStats>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub error: String,
    /// Position of the failing command in a command list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DuplicateRequest {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdatedCount {
    pub updated: usize,
}

impl ErrorResponse {
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            error: message.to_string(),
            index: None,
        }
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::Constraint(_) | StoreError::Integrity(_) => StatusCode::CONFLICT,
        StoreError::DepthExceeded { .. } | StoreError::BatchTooLarge { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        other => kind_status(other.kind()),
    }
}

fn kind_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Authorization => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Structural => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Terminal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn store_error(err: StoreError) -> (StatusCode, Json<ErrorResponse>) {
    let status = store_status(&err);
    if status.is_server_error() {
        log::warn!("Request failed: {}", err);
    }
    (status, Json(ErrorResponse::new(err.kind(), &err.to_string())))
}

fn dispatch_error(err: DispatchError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        DispatchError::Store(e) => store_status(e),
        DispatchError::Command { source, .. } => match source.as_ref() {
            DispatchError::Store(e) => store_status(e),
            other => kind_status(other.kind()),
        },
        DispatchError::Generation(_) if err.kind() == ErrorKind::Terminal => StatusCode::BAD_GATEWAY,
        other => kind_status(other.kind()),
    };
    if status.is_server_error() {
        log::warn!("Command failed: {}", err);
    }
    let index = match &err {
        DispatchError::Command { index, .. } => Some(*index),
        _ => None,
    };
    (
        status,
        Json(ErrorResponse {
            kind: err.kind(),
            error: err.to_string(),
            index,
        }),
    )
}

fn validation(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::new(ErrorKind::Validation, message)),
    )
}

pub async fn health_check<S: ConnectionSource>(
    State(state): State<AppState<S>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        circuits: state.breakers.stats(),
    })
}

// Projects

pub async fn list_projects<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    user: UserContext,
) -> ApiResult<Json<Vec<Project>>> {
    let store = state.dispatcher.store();
    let projects = store.list_projects(&user.user_id).await.map_err(store_error)?;
    Ok(Json(projects))
}

pub async fn create_project<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    user: UserContext,
    RequestJson(project): RequestJson<NewProject>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let store = state.dispatcher.store();
    let project = store
        .create_project(User::from(&user), project)
        .await
        .map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(project)))
}

pub async fn get_project<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    Path(project_id): Path<ProjectId>,
    user: UserContext,
) -> ApiResult<Json<Project>> {
    let store = state.dispatcher.store();
    let project = store
        .authorize_project(&user.user_id, project_id)
        .await
        .map_err(store_error)?;
    Ok(Json(project))
}

pub async fn update_project<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    Path(project_id): Path<ProjectId>,
    user: UserContext,
    RequestJson(update): RequestJson<ProjectUpdate>,
) -> ApiResult<Json<Project>> {
    let store = state.dispatcher.store();
    store
        .authorize_project(&user.user_id, project_id)
        .await
        .map_err(store_error)?;
    let project = store
        .update_project(project_id, update)
        .await
        .map_err(store_error)?;
    Ok(Json(project))
}

pub async fn delete_project<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    Path(project_id): Path<ProjectId>,
    user: UserContext,
) -> ApiResult<Json<DeleteProjectSummary>> {
    let store = state.dispatcher.store();
    store
        .authorize_project(&user.user_id, project_id)
        .await
        .map_err(store_error)?;
    let summary = store.delete_project(project_id).await.map_err(store_error)?;
    Ok(Json(summary))
}

pub async fn duplicate_project<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    Path(project_id): Path<ProjectId>,
    user: UserContext,
    request: Option<RequestJson<DuplicateRequest>>,
) -> ApiResult<(StatusCode, Json<DuplicateSummary>)> {
    let store = state.dispatcher.store();
    store
        .authorize_project(&user.user_id, project_id)
        .await
        .map_err(store_error)?;
    let name = request.and_then(|RequestJson(request)| request.name);
    let summary = store
        .duplicate_project(project_id, name)
        .await
        .map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(summary)))
}

pub async fn check_integrity<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    Path(project_id): Path<ProjectId>,
    user: UserContext,
) -> ApiResult<Json<IntegrityReport>> {
    let store = state.dispatcher.store();
    store
        .authorize_project(&user.user_id, project_id)
        .await
        .map_err(store_error)?;
    let report = store.check_integrity(project_id).await.map_err(store_error)?;
    Ok(Json(report))
}

// Pages

pub async fn list_pages<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    Path(project_id): Path<ProjectId>,
    user: UserContext,
) -> ApiResult<Json<Vec<Page>>> {
    let store = state.dispatcher.store();
    store
        .authorize_project(&user.user_id, project_id)
        .await
        .map_err(store_error)?;
    let pages = store.list_pages(project_id).await.map_err(store_error)?;
    Ok(Json(pages))
}

pub async fn create_page<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    Path(project_id): Path<ProjectId>,
    user: UserContext,
    RequestJson(page): RequestJson<NewPage>,
) -> ApiResult<(StatusCode, Json<Page>)> {
    let store = state.dispatcher.store();
    store
        .authorize_project(&user.user_id, project_id)
        .await
        .map_err(store_error)?;
    let page = store.create_page(project_id, page).await.map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(page)))
}

pub async fn get_page<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    Path(page_id): Path<PageId>,
    user: UserContext,
) -> ApiResult<Json<Page>> {
    let store = state.dispatcher.store();
    let page = store
        .authorize_page(&user.user_id, page_id)
        .await
        .map_err(store_error)?;
    Ok(Json(page))
}

pub async fn delete_page<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    Path(page_id): Path<PageId>,
    user: UserContext,
) -> ApiResult<StatusCode> {
    let store = state.dispatcher.store();
    store
        .authorize_page(&user.user_id, page_id)
        .await
        .map_err(store_error)?;
    store.delete_page(page_id).await.map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// Elements

pub async fn get_page_tree<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    Path(page_id): Path<PageId>,
    user: UserContext,
) -> ApiResult<Json<Vec<ElementNode>>> {
    let store = state.dispatcher.store();
    store
        .authorize_page(&user.user_id, page_id)
        .await
        .map_err(store_error)?;
    let tree = store.page_tree(page_id).await.map_err(store_error)?;
    Ok(Json(tree))
}

/// Create one element from a loosely shaped payload, the same normalization
/// and directive handling an agent command gets
pub async fn create_element<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    Path(page_id): Path<PageId>,
    user: UserContext,
    RequestJson(payload): RequestJson<Value>,
) -> ApiResult<(StatusCode, Json<ActionOutcome>)> {
    let command = serde_json::json!({ "type": "createElement", "data": payload });
    let ctx = ActionContext::new(user, Some(page_id));
    let outcome = state
        .dispatcher
        .execute_action(&command, &ctx)
        .await
        .map_err(dispatch_error)?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

pub async fn batch_create_elements<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    Path(page_id): Path<PageId>,
    user: UserContext,
    RequestJson(elements): RequestJson<Vec<NewElement>>,
) -> ApiResult<(StatusCode, Json<Vec<Element>>)> {
    let store = state.dispatcher.store();
    store
        .authorize_page(&user.user_id, page_id)
        .await
        .map_err(store_error)?;
    let created = store
        .batch_create(page_id, elements)
        .await
        .map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Apply a list of agent commands, all or nothing
pub async fn execute_actions<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    Path(page_id): Path<PageId>,
    user: UserContext,
    RequestJson(commands): RequestJson<Vec<Value>>,
) -> ApiResult<Json<Vec<ActionOutcome>>> {
    state
        .dispatcher
        .store()
        .authorize_page(&user.user_id, page_id)
        .await
        .map_err(store_error)?;
    let ctx = ActionContext::new(user, Some(page_id));
    let outcomes = state
        .dispatcher
        .execute_actions(&commands, &ctx)
        .await
        .map_err(dispatch_error)?;
    Ok(Json(outcomes))
}

pub async fn batch_update_elements<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    user: UserContext,
    RequestJson(updates): RequestJson<Vec<ElementUpdate>>,
) -> ApiResult<Json<UpdatedCount>> {
    let store = state.dispatcher.store();
    let targets: BTreeSet<ElementId> = updates.iter().map(|update| update.id).collect();
    for element_id in targets {
        store
            .authorize_element(&user.user_id, element_id)
            .await
            .map_err(store_error)?;
    }
    let updated = store.batch_update(updates).await.map_err(store_error)?;
    Ok(Json(UpdatedCount { updated }))
}

pub async fn get_element<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    Path(element_id): Path<ElementId>,
    user: UserContext,
) -> ApiResult<Json<Element>> {
    let element = state
        .dispatcher
        .store()
        .authorize_element(&user.user_id, element_id)
        .await
        .map_err(store_error)?;
    Ok(Json(element))
}

/// Style and attribute maps are merged into the current ones; a null value
/// removes the key
pub async fn update_element<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    Path(element_id): Path<ElementId>,
    user: UserContext,
    RequestJson(patch): RequestJson<ElementPatch>,
) -> ApiResult<Json<ActionOutcome>> {
    if patch.is_empty() {
        return Err(validation("no fields to update"));
    }
    let action = ElementAction::UpdateElement {
        element_id,
        changes: ElementChanges {
            parent_id: patch.parent_id,
            order: patch.order,
            element_type: patch.element_type,
            content: patch.content,
            styles: patch.styles,
            attributes: patch.attributes,
        },
    };
    let outcome = state
        .dispatcher
        .run(action, &ActionContext::new(user, None))
        .await
        .map_err(dispatch_error)?;
    Ok(Json(outcome))
}

/// Removes the element together with its descendants
pub async fn delete_element<S: ConnectionSource>(
    State(state): State<AppState<S>>,
    Path(element_id): Path<ElementId>,
    user: UserContext,
) -> ApiResult<Json<ActionOutcome>> {
    let outcome = state
        .dispatcher
        .run(
            ElementAction::DeleteElement { element_id },
            &ActionContext::new(user, None),
        )
        .await
        .map_err(dispatch_error)?;
    Ok(Json(outcome))
}
