use std::sync::Arc;
use std::time::Duration;

use stream_proxy::database::{DynResultCache, MockResultCache, ResultCacheService};
use stream_proxy::server::error::{Error, UpstreamError};
use stream_proxy::server::services::manifest_services::{
    ManifestParseError, ManifestService, rewrite_manifest_body,
};
use stream_proxy::server::services::session_services::{DynSessionCache, SessionCache};
use stream_proxy::server::services::UpstreamClientFactory;
use stream_proxy::server::utils::proxy_url_utils::decode_url;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PROXY_BASE: &str = "https://api.example/proxy";

fn manifest_service(cache: DynResultCache) -> ManifestService {
    let sessions =
        Arc::new(SessionCache::new(Duration::from_secs(300), Duration::from_secs(5))) as DynSessionCache;
    let upstream = Arc::new(UpstreamClientFactory::new(sessions, Duration::from_secs(5)).unwrap());
    ManifestService::new(upstream, cache, 10)
}

fn memory_cache() -> DynResultCache {
    Arc::new(ResultCacheService::memory_only(16))
}

/// pulls the `url` param back out of a rewritten line
fn proxied_target(line: &str) -> String {
    let url = Url::parse(line).unwrap();
    url.query_pairs()
        .find(|(k, _)| k == "url")
        .map(|(_, v)| v.into_owned())
        .unwrap()
}

#[test]
fn test_rewrite_points_segments_at_the_proxy() {
    let body = "#EXTM3U\n#EXT-X-VERSION:3\nsegment1.ts\nsegment2.ts";
    let rewritten = rewrite_manifest_body(
        body,
        "https://cdn.example/path/index.m3u8",
        PROXY_BASE,
        None,
        None,
    )
    .unwrap();

    let lines: Vec<&str> = rewritten.split('\n').collect();
    assert_eq!(
        lines,
        vec![
            "#EXTM3U",
            "#EXT-X-VERSION:3",
            "https://api.example/proxy?url=https%3A%2F%2Fcdn.example%2Fpath%2Fsegment1.ts",
            "https://api.example/proxy?url=https%3A%2F%2Fcdn.example%2Fpath%2Fsegment2.ts",
        ]
    );
}

#[test]
fn test_directives_and_blank_lines_stay_in_place() {
    let body = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n\n#EXTINF:6.0,\nseg-1.ts\n#EXT-X-ENDLIST";
    let rewritten = rewrite_manifest_body(
        body,
        "https://cdn.example/vod/index.m3u8",
        PROXY_BASE,
        Some("https://site.example/watch"),
        None,
    )
    .unwrap();

    let original: Vec<&str> = body.split('\n').collect();
    let lines: Vec<&str> = rewritten.split('\n').collect();
    assert_eq!(lines.len(), original.len());

    for (before, after) in original.iter().zip(lines.iter()) {
        if before.is_empty() || before.starts_with('#') {
            assert_eq!(before, after);
        } else {
            assert!(after.starts_with(PROXY_BASE));
        }
    }
}

#[test]
fn test_relative_uris_follow_url_join() {
    let body = "#EXTM3U\n../low/seg.ts\n/abs/seg.ts\nhttps://other.example/seg.ts\nnested/seg.ts?t=1";
    let rewritten = rewrite_manifest_body(
        body,
        "https://cdn.example/live/hi/index.m3u8?token=abc",
        PROXY_BASE,
        Some("https://site.example/watch"),
        Some("https://site.example"),
    )
    .unwrap();

    let targets: Vec<String> = rewritten.lines().skip(1).map(proxied_target).collect();
    assert_eq!(
        targets,
        vec![
            "https://cdn.example/live/low/seg.ts",
            "https://cdn.example/abs/seg.ts",
            "https://other.example/seg.ts",
            "https://cdn.example/live/hi/nested/seg.ts?t=1",
        ]
    );

    // referer and origin ride along on every line
    for line in rewritten.lines().skip(1) {
        let url = Url::parse(line).unwrap();
        let params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(params.contains(&("referer".to_string(), "https://site.example/watch".to_string())));
        assert!(params.contains(&("origin".to_string(), "https://site.example".to_string())));
    }
}

#[test]
fn test_referer_is_left_out_when_absent() {
    let rewritten = rewrite_manifest_body(
        "#EXTM3U\nseg.ts",
        "https://cdn.example/index.m3u8",
        PROXY_BASE,
        None,
        None,
    )
    .unwrap();

    assert!(!rewritten.contains("referer="));
}

#[test]
fn test_key_uris_pass_through_unchanged() {
    let key_line = "#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"";
    let body = format!("#EXTM3U\n{}\nseg.ts", key_line);
    let rewritten = rewrite_manifest_body(
        &body,
        "https://cdn.example/index.m3u8",
        PROXY_BASE,
        None,
        None,
    )
    .unwrap();

    assert_eq!(rewritten.lines().nth(1), Some(key_line));
}

#[test]
fn test_non_playlists_are_refused() {
    assert_eq!(
        rewrite_manifest_body(
            "<html>blocked</html>",
            "https://cdn.example/index.m3u8",
            PROXY_BASE,
            None,
            None
        ),
        Err(ManifestParseError::NotAPlaylist)
    );
}

#[test]
fn test_uppercase_scheme_lines_survive_the_follow_up_request() {
    let body = "#EXTM3U\nHTTPS://cdn.example/x.ts";
    let rewritten = rewrite_manifest_body(
        body,
        "https://cdn.example/index.m3u8",
        PROXY_BASE,
        None,
        None,
    )
    .unwrap();

    let line = rewritten.lines().nth(1).unwrap();
    let target = proxied_target(line);
    assert_eq!(target, "HTTPS://cdn.example/x.ts");
    assert_eq!(decode_url(&target).unwrap(), "HTTPS://cdn.example/x.ts");
}

#[tokio::test]
async fn test_fetch_sends_referer_and_rewrites() {
    let server = MockServer::start().await;
    let referer = format!("{}/watch/42", server.uri());

    Mock::given(method("GET"))
        .and(path("/watch/42"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Set-Cookie", "sid=abc123; Path=/; HttpOnly")
                .set_body_string("<html></html>"),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/live/index.m3u8"))
        .and(header("Referer", referer.as_str()))
        .and(header("Cookie", "sid=abc123"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/vnd.apple.mpegurl")
                .set_body_string("#EXTM3U\n#EXTINF:6.0,\nseg-1.ts"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let service = manifest_service(memory_cache());
    let manifest_url = format!("{}/live/index.m3u8", server.uri());

    let rewritten = service
        .rewrite_manifest(&manifest_url, PROXY_BASE, Some(&referer), None)
        .await
        .unwrap();

    let last = rewritten.lines().last().unwrap();
    assert_eq!(proxied_target(last), format!("{}/live/seg-1.ts", server.uri()));
}

#[tokio::test]
async fn test_gzip_manifests_are_decompressed() {
    use flate2::{Compression, write::GzEncoder};
    use std::io::Write;

    let server = MockServer::start().await;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"#EXTM3U\nseg.ts").unwrap();
    let compressed = encoder.finish().unwrap();

    Mock::given(method("GET"))
        .and(path("/index.m3u8"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Encoding", "gzip")
                .set_body_bytes(compressed),
        )
        .mount(&server)
        .await;

    let service = manifest_service(memory_cache());
    let rewritten = service
        .rewrite_manifest(&format!("{}/index.m3u8", server.uri()), PROXY_BASE, None, None)
        .await
        .unwrap();

    assert!(rewritten.starts_with("#EXTM3U\nhttps://api.example/proxy?url="));
}

#[tokio::test]
async fn test_upstream_403_is_an_upstream_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let service = manifest_service(memory_cache());
    let result = service
        .rewrite_manifest(&format!("{}/index.m3u8", server.uri()), PROXY_BASE, None, None)
        .await;

    match result {
        Err(Error::Upstream(UpstreamError::Status { status, .. })) => {
            assert_eq!(status.as_u16(), 403)
        }
        other => panic!("expected an upstream 403, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_non_playlist_body_is_served_unmodified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not a playlist\nseg.ts"))
        .mount(&server)
        .await;

    let service = manifest_service(memory_cache());
    let body = service
        .rewrite_manifest(&format!("{}/index.m3u8", server.uri()), PROXY_BASE, None, None)
        .await
        .unwrap();

    assert_eq!(body, "not a playlist\nseg.ts");
}

#[tokio::test]
async fn test_cached_manifest_skips_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let mut cache = MockResultCache::new();
    cache
        .expect_get()
        .times(1)
        .returning(|_| Some("#EXTM3U\nseg.ts".to_string()));
    cache.expect_set().never();

    let service = manifest_service(Arc::new(cache));
    let rewritten = service
        .rewrite_manifest(&format!("{}/index.m3u8", server.uri()), PROXY_BASE, None, None)
        .await
        .unwrap();

    assert_eq!(
        proxied_target(rewritten.lines().last().unwrap()),
        format!("{}/seg.ts", server.uri())
    );
}

#[tokio::test]
async fn test_fresh_manifest_is_cached_raw() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("#EXTM3U\nseg.ts"))
        .expect(1)
        .mount(&server)
        .await;

    let mut cache = MockResultCache::new();
    cache.expect_get().times(1).returning(|_| None);
    cache
        .expect_set()
        .withf(|key, value, ttl| key.starts_with("manifest:") && value == "#EXTM3U\nseg.ts" && *ttl == 10)
        .times(1)
        .return_const(());

    let service = manifest_service(Arc::new(cache));
    service
        .rewrite_manifest(&format!("{}/index.m3u8", server.uri()), PROXY_BASE, None, None)
        .await
        .unwrap();
}
