//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, WebSocket endpoint, and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        ErrorKindView, ErrorResponse, PhaseView, ProviderKeyPayload, SessionView, TransportView,
    },
    state::AppState,
    ws::ws_handler,
};

use axum::{
    Router,
    routing::{get, post, put},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::connect,
        handlers::disconnect,
        handlers::get_session,
        handlers::get_transport,
        handlers::set_provider_key,
        handlers::clear_provider_key,
    ),
    components(
        schemas(SessionView, TransportView, ProviderKeyPayload, ErrorResponse, ErrorKindView, PhaseView)
    ),
    tags(
        (name = "Voxbridge API", description = "Lifecycle control for the real-time voice session")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route("/session", get(handlers::get_session))
        .route("/session/connect", post(handlers::connect))
        .route("/session/disconnect", post(handlers::disconnect))
        .route("/session/transport", get(handlers::get_transport))
        .route("/session/ws", get(ws_handler))
        .route(
            "/provider-key",
            put(handlers::set_provider_key).delete(handlers::clear_provider_key),
        )
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    // Create the final router that merges the stateful routes
    // with the stateless routes (like Swagger UI).
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
