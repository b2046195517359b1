//! Route configuration.

use crate::handlers::{admin, tus};
use crate::metrics::metrics_handler;
use crate::state::AppState;
use crate::{cors, ident};
use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, head, post};
use tower_http::trace::TraceLayer;

/// Create the public application router: tus routes under the configured
/// base path plus the admin surface.
pub fn create_router(state: AppState) -> Router {
    let tus_routes = Router::new()
        .route(
            "/",
            post(tus::create_upload).options(tus::options_info),
        )
        .route(
            "/{id}",
            head(tus::head_upload)
                .get(tus::get_upload)
                .patch(tus::patch_upload)
                .delete(tus::delete_upload)
                .options(tus::options_info),
        )
        .route(
            "/{id}/{filename}",
            head(tus::head_upload_named)
                .get(tus::get_upload_named)
                .patch(tus::patch_upload_named)
                .delete(tus::delete_upload_named)
                .options(tus::options_info),
        )
        // Identity runs inside CORS so preflights skip IP resolution.
        .layer(middleware::from_fn_with_state(
            state.clone(),
            ident::identity_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            cors::cors_middleware,
        ));

    let prefix = tus::route_prefix(&state.config.server.base_path);
    let mut router = if prefix.is_empty() {
        Router::new().merge(tus_routes)
    } else {
        Router::new().nest(&prefix, tus_routes)
    };

    // When enabled, the scrape endpoint must be network-restricted to
    // authorized Prometheus scrapers at the infrastructure level.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .nest("/admin", admin::router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Internal router the expirer dispatches termination requests through.
/// No identity middleware and no ownership check.
pub fn expirer_router(state: AppState) -> Router {
    Router::new()
        .route("/{id}", delete(tus::expire_upload))
        .with_state(state)
}
