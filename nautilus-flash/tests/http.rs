use std::collections::HashMap;

use axum::{
    extract::Query,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use nautilus_flash::{
    catalog::{GitHubReleases, ReleaseSource},
    error::{CatalogError, FetchError},
    fetch::{HttpFetcher, SegmentFetcher},
    CatalogState, ManifestResolver, Relay, ReleaseCatalog, SegmentSource, Selection,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::net::TcpListener;

const REPOSITORY: &str = "h-i-r/nautilus";

/// Serve `router` on an ephemeral port, returning its base URL
async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    format!("http://{addr}")
}

fn asset(tag: &str, name: &str) -> serde_json::Value {
    json!({
        "name": name,
        "browser_download_url": format!("https://github.com/{REPOSITORY}/releases/download/{tag}/{name}"),
    })
}

async fn releases() -> Json<serde_json::Value> {
    Json(json!([
        {
            "name": "Nautilus 1.5.0-rc1",
            "tag_name": "v1.5.0-rc1",
            "prerelease": true,
            "assets": [
                asset("v1.5.0-rc1", "bootloader.bin"),
                asset("v1.5.0-rc1", "partitions.bin"),
                asset("v1.5.0-rc1", "firmware.bin"),
            ],
        },
        {
            "name": null,
            "tag_name": "v1.4.0",
            "prerelease": false,
            "assets": [asset("v1.4.0", "firmware.bin")],
        },
    ]))
}

async fn rate_limited() -> Response {
    (
        StatusCode::FORBIDDEN,
        [("x-ratelimit-remaining", "0")],
        Json(json!({ "message": "API rate limit exceeded" })),
    )
        .into_response()
}

/// A relay serving 16 bytes per asset, or failing the way the real one does
async fn relay(Query(params): Query<HashMap<String, String>>) -> Response {
    let Some(url) = params.get("url") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing url parameter" })),
        )
            .into_response();
    };

    if url.ends_with("missing.bin") {
        (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": "Upstream returned 404" })),
        )
            .into_response()
    } else if url.ends_with("login.bin") {
        (
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            "<html>Sign in</html>",
        )
            .into_response()
    } else {
        (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            vec![0xe9u8; 16],
        )
            .into_response()
    }
}

fn relay_router() -> Router {
    Router::new().route("/proxy.php", get(relay))
}

#[tokio::test]
async fn lists_releases() {
    let base = serve(Router::new().route("/repos/h-i-r/nautilus/releases", get(releases))).await;
    let mut catalog = ReleaseCatalog::new(GitHubReleases::new(REPOSITORY, &base).unwrap());

    assert_eq!(catalog.refresh().await, 2);

    let releases = catalog.releases();
    assert_eq!(releases[0].display_name(), "Nautilus 1.5.0-rc1");
    assert!(releases[0].prerelease);
    assert_eq!(releases[1].display_name(), "v1.4.0");
    assert_eq!(releases[1].assets.len(), 1);

    // The most recent release is selected
    assert_eq!(catalog.selected_index(), Some(0));
}

#[tokio::test]
async fn rate_limit_degrades_to_local_files() {
    let base = serve(Router::new().route("/repos/h-i-r/nautilus/releases", get(rate_limited))).await;
    let source = GitHubReleases::new(REPOSITORY, &base).unwrap();

    assert!(matches!(source.list().await, Err(CatalogError::RateLimited)));

    let mut catalog = ReleaseCatalog::new(source);
    assert_eq!(catalog.refresh().await, 0);
    assert!(matches!(catalog.state(), CatalogState::Failed(_)));
    assert_eq!(catalog.selection(), Selection::Local);
}

#[tokio::test]
async fn missing_repository_is_a_status_error() {
    let base = serve(Router::new()).await;
    let source = GitHubReleases::new(REPOSITORY, &base).unwrap();

    assert!(matches!(source.list().await, Err(CatalogError::Status(404))));
}

#[tokio::test]
async fn release_assets_are_downloaded_through_the_relay() {
    let api = serve(Router::new().route("/repos/h-i-r/nautilus/releases", get(releases))).await;
    let relay = serve(relay_router()).await;

    let mut catalog = ReleaseCatalog::new(GitHubReleases::new(REPOSITORY, &api).unwrap());
    catalog.refresh().await;

    let resolver = ManifestResolver::new("firmware", Relay::parse(&format!("{relay}/proxy.php")).unwrap());
    let manifest = resolver.resolve(catalog.selection()).unwrap();
    let fetcher = HttpFetcher::new().unwrap();

    for segment in manifest.segments() {
        match segment.source() {
            SegmentSource::Remote(url) => assert!(url.as_str().starts_with(&relay)),
            other => panic!("unexpected source: {other}"),
        }

        let data = fetcher.fetch(segment.source()).await.unwrap();
        assert_eq!(data, vec![0xe9; 16]);
    }
}

#[tokio::test]
async fn relay_errors_are_reported() {
    let relay = serve(relay_router()).await;
    let fetcher = HttpFetcher::new().unwrap();

    let source = SegmentSource::Remote(
        format!("{relay}/proxy.php?url=https://github.com/h-i-r/nautilus/releases/download/v1/missing.bin")
            .parse()
            .unwrap(),
    );

    match fetcher.fetch(&source).await {
        Err(FetchError::Status { status, message }) => {
            assert_eq!(status, 502);
            assert_eq!(message, "Upstream returned 404");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn html_is_not_firmware() {
    let relay = serve(relay_router()).await;
    let fetcher = HttpFetcher::new().unwrap();

    let source = SegmentSource::Remote(
        format!("{relay}/proxy.php?url=https://github.com/h-i-r/nautilus/releases/download/v1/login.bin")
            .parse()
            .unwrap(),
    );

    assert!(matches!(
        fetcher.fetch(&source).await,
        Err(FetchError::UnexpectedContentType(content_type)) if content_type.starts_with("text/html")
    ));
}

#[tokio::test]
async fn non_json_errors_use_the_status_reason() {
    let relay = serve(relay_router()).await;
    let fetcher = HttpFetcher::new().unwrap();

    let source = SegmentSource::Remote(format!("{relay}/elsewhere").parse().unwrap());

    match fetcher.fetch(&source).await {
        Err(FetchError::Status { status, message }) => {
            assert_eq!(status, 404);
            assert_eq!(message, "Not Found");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}
