use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::api::handlers::{self, AppState};
use crate::store::ConnectionSource;

pub fn create_router<S: ConnectionSource>() -> Router<AppState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check::<S>))
        // Projects
        .route(
            "/projects",
            get(handlers::list_projects::<S>).post(handlers::create_project::<S>),
        )
        .route(
            "/projects/:project_id",
            get(handlers::get_project::<S>)
                .patch(handlers::update_project::<S>)
                .delete(handlers::delete_project::<S>),
        )
        .route(
            "/projects/:project_id/duplicate",
            post(handlers::duplicate_project::<S>),
        )
        .route(
            "/projects/:project_id/integrity",
            get(handlers::check_integrity::<S>),
        )
        // Pages
        .route(
            "/projects/:project_id/pages",
            get(handlers::list_pages::<S>).post(handlers::create_page::<S>),
        )
        .route(
            "/pages/:page_id",
            get(handlers::get_page::<S>).delete(handlers::delete_page::<S>),
        )
        // Element trees
        .route(
            "/pages/:page_id/elements",
            get(handlers::get_page_tree::<S>).post(handlers::create_element::<S>),
        )
        .route(
            "/pages/:page_id/elements/batch",
            post(handlers::batch_create_elements::<S>),
        )
        .route(
            "/pages/:page_id/actions",
            post(handlers::execute_actions::<S>),
        )
        .route(
            "/elements/batch",
            patch(handlers::batch_update_elements::<S>),
        )
        .route(
            "/elements/:element_id",
            get(handlers::get_element::<S>)
                .patch(handlers::update_element::<S>)
                .delete(handlers::delete_element::<S>),
        )
}
