use axum::response::Html;
use axum::{extract::State, routing::get, Router};
use contravider_providers::System;
use tower_http::trace::TraceLayer;

pub mod config;
mod profile;

#[derive(Clone)]
pub struct AppState {
    system: System,
}

impl AppState {
    pub fn new(system: System) -> Self {
        Self { system }
    }
}

pub fn gen_router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/*path", get(profile::get))
        .layer(TraceLayer::new_for_http())
}

/// Lists the configured profiles.
async fn index(State(state): State<AppState>) -> Html<String> {
    let mut page = String::from(
        "<!DOCTYPE html>\n<html>\n<head><title>contravider</title></head>\n<body>\n<h1>Profiles</h1>\n<ul>\n",
    );
    for name in state.system.profiles().names() {
        // profile names are restricted to URL-safe characters
        page.push_str(&format!("<li><a href=\"/{name}/\">{name}</a></li>\n"));
    }
    page.push_str("</ul>\n</body>\n</html>\n");
    Html(page)
}

#[cfg(test)]
mod tests;
