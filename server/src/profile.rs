use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::{authorization::Basic, Authorization};
use axum_extra::TypedHeader;
use contravider_providers::{
    find_protection, load_directory_tree, Error, DIRECTORIES_FILE, PRIVATE_FILES,
};
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{debug, instrument, warn};

use crate::AppState;

const REALM: &str = "Basic realm=\"restricted\"";

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, REALM)],
        "unauthorized",
    )
        .into_response()
}

/// Serves a file below a profile, materializing the profile first and
/// checking the credentials its directory tree asks for.
#[instrument(skip_all, fields(path = %path))]
pub async fn get(
    State(state): State<AppState>,
    Path(path): Path<String>,
    credentials: Option<TypedHeader<Authorization<Basic>>>,
    request: Request,
) -> Response {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return StatusCode::BAD_REQUEST.into_response(),
            _ => segments.push(segment),
        }
    }
    let Some((profile, rest)) = segments.split_first() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if rest.last().is_some_and(|name| PRIVATE_FILES.contains(name)) {
        return unauthorized();
    }

    match state.system.serve(profile).await {
        Ok(()) => {}
        Err(Error::ProfileNotFound(_)) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(profile = %profile, err = %e, "serving profile failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    }

    let root = state.system.web_root().join(profile);
    let tree = match load_directory_tree(&root.join(DIRECTORIES_FILE)).await {
        Ok(tree) => tree,
        Err(e) => {
            warn!(profile = %profile, err = %e, "loading directory tree failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    if let Some(protection) = find_protection(tree.as_ref(), rest) {
        let valid = credentials
            .is_some_and(|TypedHeader(auth)| protection.validate(auth.username(), auth.password()));
        if !valid {
            debug!(profile = %profile, "credentials missing or invalid");
            return unauthorized();
        }
    }

    match ServeDir::new(state.system.web_root()).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(e) => match e {},
    }
}
