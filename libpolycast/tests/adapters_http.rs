//! Platform adapters against a local HTTP server
//!
//! Each test stands up an axum router shaped like the slice of the platform
//! API the adapter talks to and points the adapter's `api_base` at it.

use anyhow::Result;
use axum::extract::{Path, Query};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use libpolycast::platforms::google_business::GoogleBusinessPublisher;
use libpolycast::platforms::http::build_client;
use libpolycast::platforms::linkedin::LinkedInPublisher;
use libpolycast::platforms::meta::MetaPublisher;
use libpolycast::platforms::{
    ContentConstraints, PublishRequest, PublishResult, PublishedPost, Publisher,
};
use libpolycast::types::{ChannelSettings, ContentItem, MediaKind, MediaRef, Platform};
use libpolycast::PublishError;
use secrecy::SecretString;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One request as the fake platform saw it
#[derive(Debug, Clone)]
struct Call {
    path: String,
    auth: Option<String>,
    body: Value,
}

type Calls = Arc<Mutex<Vec<Call>>>;

fn record(calls: &Calls, path: String, headers: &HeaderMap, body: Value) {
    calls.lock().unwrap().push(Call {
        path,
        auth: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });
}

async fn serve(app: Router) -> Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { axum::serve(listener, app).await });
    Ok(format!("http://{}", addr))
}

fn client() -> reqwest::Client {
    build_client(Duration::from_secs(5)).unwrap()
}

fn request(text: &str, account_ref: &str, settings: ChannelSettings) -> PublishRequest {
    PublishRequest {
        entry_id: "entry-1".into(),
        idempotency_key: "key-1".into(),
        content: ContentItem::new(text),
        account_ref: account_ref.into(),
        settings,
        credential: SecretString::from("page-token".to_string()),
    }
}

fn media(url: &str, kind: MediaKind) -> MediaRef {
    MediaRef {
        url: url.into(),
        kind,
        alt_text: None,
    }
}

fn meta(base: &str) -> MetaPublisher {
    MetaPublisher::new(
        client(),
        Some(base.to_string()),
        ContentConstraints::for_platform(Platform::Meta),
    )
}

fn linkedin(base: &str) -> LinkedInPublisher {
    LinkedInPublisher::new(
        client(),
        Some(base.to_string()),
        ContentConstraints::for_platform(Platform::LinkedIn),
    )
}

fn google(base: &str) -> GoogleBusinessPublisher {
    GoogleBusinessPublisher::new(
        client(),
        Some(base.to_string()),
        ContentConstraints::for_platform(Platform::GoogleBusiness),
    )
}

/// Meta page whose every endpoint answers `status` with `body`
fn meta_failing(
    status: StatusCode,
    retry_after: Option<&'static str>,
    body: &'static str,
) -> Router {
    Router::new().route(
        "/{page}/feed",
        post(move || async move {
            let mut headers = HeaderMap::new();
            if let Some(value) = retry_after {
                headers.insert(header::RETRY_AFTER, value.parse().unwrap());
            }
            (status, headers, body)
        }),
    )
}

#[tokio::test]
async fn test_meta_text_post_goes_to_feed() -> Result<()> {
    let calls = Calls::default();
    let recorded = calls.clone();
    let app = Router::new().route(
        "/{page}/feed",
        post(
            move |Path(page): Path<String>, headers: HeaderMap, Json(body): Json<Value>| {
                record(&recorded, format!("/{}/feed", page), &headers, body);
                async move { Json(json!({ "id": format!("{}_900", page) })) }
            },
        ),
    );
    let base = serve(app).await?;

    let result = meta(&base)
        .publish(&request("Doors open at nine", "page-1", ChannelSettings::default()))
        .await;
    assert_eq!(
        result,
        PublishResult::Success(PublishedPost {
            external_post_id: "page-1_900".into(),
            external_url: Some("https://www.facebook.com/page-1_900".into()),
        })
    );

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].path, "/page-1/feed");
    assert_eq!(calls[0].auth.as_deref(), Some("Bearer page-token"));
    assert_eq!(calls[0].body["message"], "Doors open at nine");
    assert!(calls[0].body.get("attached_media").is_none());
    Ok(())
}

#[tokio::test]
async fn test_meta_photos_are_uploaded_then_attached() -> Result<()> {
    let calls = Calls::default();
    let photos = calls.clone();
    let feed = calls.clone();
    let app = Router::new()
        .route(
            "/{page}/photos",
            post(
                move |Path(page): Path<String>, headers: HeaderMap, Json(body): Json<Value>| {
                    record(&photos, format!("/{}/photos", page), &headers, body);
                    let n = photos.lock().unwrap().len();
                    async move { Json(json!({ "id": format!("photo-{}", n) })) }
                },
            ),
        )
        .route(
            "/{page}/feed",
            post(
                move |Path(page): Path<String>, headers: HeaderMap, Json(body): Json<Value>| {
                    record(&feed, format!("/{}/feed", page), &headers, body);
                    async move { Json(json!({ "id": "page-1_901" })) }
                },
            ),
        );
    let base = serve(app).await?;

    let mut req = request("New patio", "page-1", ChannelSettings::default());
    req.content.media = vec![
        media("https://cdn.example.com/a.jpg", MediaKind::Image),
        media("https://cdn.example.com/b.jpg", MediaKind::Image),
    ];
    let result = meta(&base).publish(&req).await;
    assert!(matches!(result, PublishResult::Success(_)));

    let calls = calls.lock().unwrap();
    let paths: Vec<_> = calls.iter().map(|c| c.path.as_str()).collect();
    assert_eq!(paths, vec!["/page-1/photos", "/page-1/photos", "/page-1/feed"]);
    assert_eq!(calls[0].body["published"], false);
    assert_eq!(calls[1].body["url"], "https://cdn.example.com/b.jpg");
    assert_eq!(
        calls[2].body["attached_media"],
        json!([{ "media_fbid": "photo-1" }, { "media_fbid": "photo-2" }])
    );
    Ok(())
}

#[tokio::test]
async fn test_meta_single_video_uses_videos_endpoint() -> Result<()> {
    let calls = Calls::default();
    let videos = calls.clone();
    let feed = calls.clone();
    let app = Router::new()
        .route(
            "/{page}/videos",
            post(
                move |Path(page): Path<String>, headers: HeaderMap, Json(body): Json<Value>| {
                    record(&videos, format!("/{}/videos", page), &headers, body);
                    async move { Json(json!({ "id": "video-77" })) }
                },
            ),
        )
        .route(
            "/{page}/feed",
            post(
                move |Path(page): Path<String>, headers: HeaderMap, Json(body): Json<Value>| {
                    record(&feed, format!("/{}/feed", page), &headers, body);
                    async move { Json(json!({ "id": "unexpected" })) }
                },
            ),
        );
    let base = serve(app).await?;

    let mut req = request(
        "Behind the scenes",
        "page-1",
        ChannelSettings::default().with("page_id", "page-override"),
    );
    req.content.media = vec![media("https://cdn.example.com/v.mp4", MediaKind::Video)];
    let result = meta(&base).publish(&req).await;
    assert_eq!(
        result,
        PublishResult::Success(PublishedPost {
            external_post_id: "video-77".into(),
            external_url: Some("https://www.facebook.com/video-77".into()),
        })
    );

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].path, "/page-override/videos");
    assert_eq!(calls[0].body["file_url"], "https://cdn.example.com/v.mp4");
    assert_eq!(calls[0].body["description"], "Behind the scenes");
    Ok(())
}

#[tokio::test]
async fn test_meta_status_classification() -> Result<()> {
    let req = request("Hello", "page-1", ChannelSettings::default());

    let base = serve(meta_failing(StatusCode::INTERNAL_SERVER_ERROR, None, "oops")).await?;
    let result = meta(&base).publish(&req).await;
    assert!(matches!(result, PublishResult::Transient(PublishError::Network(_))));

    let base = serve(meta_failing(StatusCode::UNAUTHORIZED, None, "token expired")).await?;
    let result = meta(&base).publish(&req).await;
    assert!(matches!(
        result,
        PublishResult::Permanent(PublishError::Authentication(_))
    ));

    let base = serve(meta_failing(StatusCode::TOO_MANY_REQUESTS, Some("30"), "slow down")).await?;
    match meta(&base).publish(&req).await {
        PublishResult::Transient(err @ PublishError::RateLimit { .. }) => {
            assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        }
        other => panic!("expected a rate limit, got {:?}", other),
    }

    let base = serve(meta_failing(
        StatusCode::BAD_REQUEST,
        None,
        r#"{"error":{"message":"Blocked: violates community policy"}}"#,
    ))
    .await?;
    let result = meta(&base).publish(&req).await;
    assert!(matches!(
        result,
        PublishResult::Permanent(PublishError::ContentPolicy(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_meta_success_without_readable_id_is_ambiguous() -> Result<()> {
    let req = request("Hello", "page-1", ChannelSettings::default());

    let base = serve(Router::new().route(
        "/{page}/feed",
        post(|| async { (StatusCode::OK, "<html>gateway</html>") }),
    ))
    .await?;
    assert!(matches!(
        meta(&base).publish(&req).await,
        PublishResult::Ambiguous(_)
    ));

    let base = serve(Router::new().route(
        "/{page}/feed",
        post(|| async { Json(json!({ "success": true })) }),
    ))
    .await?;
    assert!(matches!(
        meta(&base).publish(&req).await,
        PublishResult::Ambiguous(_)
    ));
    Ok(())
}

#[tokio::test]
async fn test_meta_lookup_matches_message_text() -> Result<()> {
    let seen: Arc<Mutex<Vec<HashMap<String, String>>>> = Arc::default();
    let recorded = seen.clone();
    let app = Router::new().route(
        "/{page}/posts",
        get(move |Query(query): Query<HashMap<String, String>>| {
            recorded.lock().unwrap().push(query);
            async {
                Json(json!({
                    "data": [
                        { "id": "page-1_1", "message": "Something else" },
                        {
                            "id": "page-1_2",
                            "message": "Doors open at nine",
                            "permalink_url": "https://www.facebook.com/acme/posts/2"
                        }
                    ]
                }))
            }
        }),
    );
    let base = serve(app).await?;
    let publisher = meta(&base);

    let found = publisher
        .find_existing(&request("Doors open at nine", "page-1", ChannelSettings::default()))
        .await?;
    assert_eq!(
        found,
        Some(PublishedPost {
            external_post_id: "page-1_2".into(),
            external_url: Some("https://www.facebook.com/acme/posts/2".into()),
        })
    );

    let missing = publisher
        .find_existing(&request("Never posted", "page-1", ChannelSettings::default()))
        .await?;
    assert_eq!(missing, None);

    let queries = seen.lock().unwrap();
    assert_eq!(queries[0].get("limit").map(String::as_str), Some("25"));
    Ok(())
}

#[tokio::test]
async fn test_meta_lookup_failure_is_transient() -> Result<()> {
    let base = serve(Router::new().route(
        "/{page}/posts",
        get(|| async { (StatusCode::BAD_GATEWAY, "upstream") }),
    ))
    .await?;

    let err = meta(&base)
        .find_existing(&request("Hello", "page-1", ChannelSettings::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::Network(_)));
    Ok(())
}

#[tokio::test]
async fn test_linkedin_post_id_comes_from_restli_header() -> Result<()> {
    let calls = Calls::default();
    let recorded = calls.clone();
    let versions: Arc<Mutex<Vec<String>>> = Arc::default();
    let seen_versions = versions.clone();
    let app = Router::new().route(
        "/rest/posts",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            if let Some(version) = headers.get("linkedin-version").and_then(|v| v.to_str().ok()) {
                seen_versions.lock().unwrap().push(version.to_string());
            }
            record(&recorded, "/rest/posts".into(), &headers, body);
            async { (StatusCode::CREATED, [("x-restli-id", "urn:li:share:987")]) }
        }),
    );
    let base = serve(app).await?;

    let result = linkedin(&base)
        .publish(&request("Hiring!", "4242", ChannelSettings::default()))
        .await;
    assert_eq!(
        result,
        PublishResult::Success(PublishedPost {
            external_post_id: "urn:li:share:987".into(),
            external_url: Some("https://www.linkedin.com/feed/update/urn:li:share:987".into()),
        })
    );

    let calls = calls.lock().unwrap();
    assert_eq!(calls[0].body["author"], "urn:li:organization:4242");
    assert_eq!(calls[0].body["commentary"], "Hiring!");
    assert_eq!(calls[0].auth.as_deref(), Some("Bearer page-token"));
    assert_eq!(*versions.lock().unwrap(), vec!["202409"]);
    Ok(())
}

#[tokio::test]
async fn test_linkedin_created_without_id_is_ambiguous() -> Result<()> {
    let base = serve(Router::new().route(
        "/rest/posts",
        post(|| async { StatusCode::CREATED }),
    ))
    .await?;

    let result = linkedin(&base)
        .publish(&request("Hiring!", "4242", ChannelSettings::default()))
        .await;
    assert!(matches!(result, PublishResult::Ambiguous(_)));
    Ok(())
}

#[tokio::test]
async fn test_linkedin_forbidden_is_permanent() -> Result<()> {
    let base = serve(Router::new().route(
        "/rest/posts",
        post(|| async { (StatusCode::FORBIDDEN, "missing w_organization_social") }),
    ))
    .await?;

    let result = linkedin(&base)
        .publish(&request("Hiring!", "4242", ChannelSettings::default()))
        .await;
    assert!(matches!(
        result,
        PublishResult::Permanent(PublishError::Authentication(_))
    ));
    Ok(())
}

fn google_settings() -> ChannelSettings {
    ChannelSettings::default().with("account_id", "acc-1")
}

#[tokio::test]
async fn test_google_publish_and_lookup() -> Result<()> {
    let calls = Calls::default();
    let recorded = calls.clone();
    let page_sizes: Arc<Mutex<Vec<String>>> = Arc::default();
    let seen_sizes = page_sizes.clone();
    let app = Router::new().route(
        "/accounts/{account}/locations/{location}/localPosts",
        post(
            move |Path((account, location)): Path<(String, String)>,
                  headers: HeaderMap,
                  Json(body): Json<Value>| {
                let path = format!("/accounts/{}/locations/{}/localPosts", account, location);
                record(&recorded, path, &headers, body);
                async {
                    Json(json!({
                        "name": "accounts/acc-1/locations/loc-9/localPosts/55",
                        "searchUrl": "https://local.google.com/place?lpsid=55"
                    }))
                }
            },
        )
        .get(move |Query(query): Query<HashMap<String, String>>| {
            if let Some(size) = query.get("pageSize") {
                seen_sizes.lock().unwrap().push(size.clone());
            }
            async {
                Json(json!({
                    "localPosts": [
                        { "name": "accounts/acc-1/locations/loc-9/localPosts/54", "summary": "Older" },
                        { "name": "accounts/acc-1/locations/loc-9/localPosts/55", "summary": "Open late on Friday" }
                    ]
                }))
            }
        }),
    );
    let base = serve(app).await?;
    let publisher = google(&base);
    let req = request("Open late on Friday", "loc-9", google_settings());

    let expected = PublishedPost {
        external_post_id: "accounts/acc-1/locations/loc-9/localPosts/55".into(),
        external_url: Some("https://local.google.com/place?lpsid=55".into()),
    };
    assert_eq!(
        publisher.publish(&req).await,
        PublishResult::Success(expected.clone())
    );
    {
        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].path, "/accounts/acc-1/locations/loc-9/localPosts");
        assert_eq!(calls[0].body["summary"], "Open late on Friday");
    }

    let found = publisher.find_existing(&req).await?;
    assert_eq!(found.map(|p| p.external_post_id), Some(expected.external_post_id));
    assert_eq!(*page_sizes.lock().unwrap(), vec!["20"]);

    let missing = publisher
        .find_existing(&request("Closed Monday", "loc-9", google_settings()))
        .await?;
    assert_eq!(missing, None);
    Ok(())
}

#[tokio::test]
async fn test_google_unavailable_is_transient() -> Result<()> {
    let base = serve(Router::new().route(
        "/accounts/{account}/locations/{location}/localPosts",
        post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "backend error") }),
    ))
    .await?;

    let result = google(&base)
        .publish(&request("Open late on Friday", "loc-9", google_settings()))
        .await;
    assert!(matches!(result, PublishResult::Transient(PublishError::Network(_))));
    Ok(())
}

#[tokio::test]
async fn test_refused_connection_is_transient() -> Result<()> {
    // Bind and release a port so nothing listens on it
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let base = format!("http://{}", listener.local_addr()?);
    drop(listener);

    let result = google(&base)
        .publish(&request("Open late on Friday", "loc-9", google_settings()))
        .await;
    assert!(matches!(result, PublishResult::Transient(PublishError::Network(_))));
    Ok(())
}
