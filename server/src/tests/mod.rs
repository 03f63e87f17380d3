use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use contravider_providers::fixtures::SIGNING_KEY;
use contravider_providers::{BaseUrl, Profiles, SigningKey, StaticOracle, System, SystemConfig};
use rstest::rstest;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::{gen_router, AppState};

/// `alice:secret`
const GOOD_CREDENTIALS: &str = "Basic YWxpY2U6c2VjcmV0";
/// `alice:wrong`
const BAD_CREDENTIALS: &str = "Basic YWxpY2U6d3Jvbmc=";

fn write(root: &Path, branch: &str, path: &str, contents: &str) {
    let path = root.join(branch).join("www/html").join(path);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

struct Server {
    _tmpdir: TempDir,
    router: Router,
    token: CancellationToken,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn server() -> Server {
    let tmpdir = TempDir::new().unwrap();
    let branches = tmpdir.path().join("branches");
    write(&branches, "main", "index.html", "main");
    write(
        &branches,
        "extra",
        "protected/.directives.toml",
        "[protection]\nuser = \"alice\"\npassword = \"secret\"\n",
    );
    write(&branches, "extra", "protected/secret.json", "{\"secret\": true}");
    write(&branches, "broken", "bad.json", "$(( .NOPE ))$");

    let oracle = StaticOracle::new(&branches);
    for branch in ["main", "extra", "broken"] {
        oracle.set_revision(branch, "1");
    }
    let profiles: Profiles = toml::from_str(
        r##"
        "all-good" = ["main"]
        "protected" = ["#all-good", "extra"]
        "broken-template" = ["main", "broken"]
        "##,
    )
    .unwrap();

    let cfg = SystemConfig {
        web_root: tmpdir.path().join("web"),
        result_root: tmpdir.path().join("results"),
        base_url: BaseUrl {
            template: "{protocol}://{host}:{port}/{profile}".into(),
            protocol: "http".into(),
            host: "localhost".into(),
            port: 8083,
        },
        update: Duration::from_secs(3600),
        lenient_templates: false,
    };
    let key = Arc::new(SigningKey::parse(SIGNING_KEY, None).unwrap());
    let (system, actor) = System::new(cfg, profiles, Arc::new(oracle), key).unwrap();

    let token = CancellationToken::new();
    tokio::spawn(actor.run(token.clone()));

    Server {
        _tmpdir: tmpdir,
        router: gen_router().with_state(AppState::new(system)),
        token,
    }
}

async fn get(server: &Server, uri: &str, authorization: Option<&str>) -> (StatusCode, String) {
    let mut request = Request::builder().uri(uri);
    if let Some(authorization) = authorization {
        request = request.header(header::AUTHORIZATION, authorization);
    }
    let response = server
        .router
        .clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn index_lists_profiles() {
    let server = server();
    let (status, body) = get(&server, "/", None).await;
    assert_eq!(StatusCode::OK, status);
    for profile in ["all-good", "broken-template", "protected"] {
        assert!(body.contains(&format!("href=\"/{profile}/\"")), "{body}");
    }
}

#[rstest]
#[case::file("/all-good/index.html", None, StatusCode::OK)]
#[case::unknown_profile("/nope/index.html", None, StatusCode::NOT_FOUND)]
#[case::missing_file("/all-good/missing.html", None, StatusCode::NOT_FOUND)]
#[case::unprotected_in_protected_profile("/protected/index.html", None, StatusCode::OK)]
#[case::no_credentials("/protected/protected/secret.json", None, StatusCode::UNAUTHORIZED)]
#[case::bad_credentials("/protected/protected/secret.json", Some(BAD_CREDENTIALS), StatusCode::UNAUTHORIZED)]
#[case::good_credentials("/protected/protected/secret.json", Some(GOOD_CREDENTIALS), StatusCode::OK)]
#[case::encoded_segment("/protected/%70rotected/secret.json", None, StatusCode::UNAUTHORIZED)]
#[case::directory_tree("/protected/.directories.json", Some(GOOD_CREDENTIALS), StatusCode::UNAUTHORIZED)]
#[case::publication_stamp("/all-good/.publication.json", None, StatusCode::UNAUTHORIZED)]
#[case::parent_segment("/all-good/../protected/protected/secret.json", None, StatusCode::BAD_REQUEST)]
#[case::encoded_parent_segment("/all-good/%2e%2e/x", None, StatusCode::BAD_REQUEST)]
#[case::broken_template("/broken-template/index.html", None, StatusCode::INTERNAL_SERVER_ERROR)]
#[tokio::test]
async fn responses(
    #[case] uri: &str,
    #[case] authorization: Option<&str>,
    #[case] expected: StatusCode,
) {
    let server = server();
    let (status, body) = get(&server, uri, authorization).await;
    assert_eq!(expected, status, "{uri}: {body}");
}

#[tokio::test]
async fn challenge_and_content() {
    let server = server();

    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/protected/protected/secret.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(StatusCode::UNAUTHORIZED, response.status());
    assert_eq!(
        "Basic realm=\"restricted\"",
        response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap()
    );

    let (_, body) = get(
        &server,
        "/protected/protected/secret.json",
        Some(GOOD_CREDENTIALS),
    )
    .await;
    assert_eq!("{\"secret\": true}", body);

    let (_, body) = get(&server, "/all-good/index.html", None).await;
    assert_eq!("main", body);
}
