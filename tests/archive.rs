//! Archive downloads and the on-disk cache.

mod common;

use std::time::Duration;

use common::{TestEnv, COMMIT};
use futures_util::StreamExt;
use reqwest::StatusCode;

const ARCHIVE_PATH: &str = "/group/project/repository/archive.tar";

fn archive_calls(env: &TestEnv) -> usize {
    env.git_calls().iter().filter(|line| line.contains(" archive ")).count()
}

/// Wait for the background fill task to settle the cache directory.
async fn wait_for_cache(env: &TestEnv, expected: usize) -> Vec<String> {
    for _ in 0..100 {
        let entries = env.cache_entries();
        if entries.len() == expected {
            return entries;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    env.cache_entries()
}

#[tokio::test]
async fn test_second_download_is_served_from_cache() {
    let env = TestEnv::start().await;

    let first = reqwest::get(env.url(ARCHIVE_PATH)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["content-type"], "application/x-tar");
    assert_eq!(first.headers()["cache-control"], "private");
    assert_eq!(
        first.headers()["content-disposition"],
        format!("attachment; filename=\"project-{COMMIT}.tar\"")
    );
    let first_body = first.bytes().await.unwrap();
    assert_eq!(
        &first_body[..],
        format!("archive --format=tar --prefix=project-{COMMIT}/ {COMMIT}\n").as_bytes()
    );
    assert_eq!(archive_calls(&env), 1);

    // Published under the cache root, with no temp files left behind.
    let cached = env.cache_entries();
    assert_eq!(cached.len(), 1);
    assert!(cached[0].starts_with(COMMIT));
    assert!(cached[0].ends_with(".tar"));

    let second = reqwest::get(env.url(ARCHIVE_PATH)).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["content-type"], "application/x-tar");
    assert_eq!(second.bytes().await.unwrap(), first_body);
    assert_eq!(archive_calls(&env), 1);
}

#[tokio::test]
async fn test_compressed_archive_is_cached() {
    let env = TestEnv::start().await;
    let path = "/group/project/repository/archive.tar.gz";

    let first = reqwest::get(env.url(path)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["content-type"], "application/x-gzip");
    assert_eq!(
        first.headers()["content-disposition"],
        format!("attachment; filename=\"project-{COMMIT}.tar.gz\"")
    );
    let first_body = first.bytes().await.unwrap();
    assert_eq!(
        &first_body[..],
        format!("gzip:archive --format=tar --prefix=project-{COMMIT}/ {COMMIT}\n").as_bytes()
    );
    assert_eq!(env.gzip_calls(), vec!["-c -n".to_string()]);

    let cached = env.cache_entries();
    assert_eq!(cached.len(), 1);
    assert!(cached[0].ends_with(".tar.gz"));

    let second = reqwest::get(env.url(path)).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.bytes().await.unwrap(), first_body);
    assert_eq!(archive_calls(&env), 1);
    assert_eq!(env.gzip_calls().len(), 1);
}

#[tokio::test]
async fn test_cached_archive_supports_ranges() {
    let env = TestEnv::start().await;
    reqwest::get(env.url(ARCHIVE_PATH)).await.unwrap().bytes().await.unwrap();

    let response = reqwest::Client::new()
        .get(env.url(ARCHIVE_PATH))
        .header("range", "bytes=0-6")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(&response.bytes().await.unwrap()[..], b"archive");
    assert_eq!(archive_calls(&env), 1);
}

#[tokio::test]
async fn test_unstartable_generation_is_not_cached() {
    // The mock authorizes this path, but git cannot run at all.
    let env = TestEnv::start_with(|config| {
        config.git.binary = "/nonexistent/git".into();
    })
    .await;

    let response = reqwest::get(env.url(ARCHIVE_PATH)).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(env.cache_entries().is_empty());
}

#[tokio::test]
async fn test_failure_after_headers_truncates_and_cleans_up() {
    let env = TestEnv::start().await;

    let response = reqwest::get(env.url("/group/broken/repository/archive.tar")).await.unwrap();
    // Headers were committed before git failed.
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.bytes().await.is_err());

    assert_eq!(wait_for_cache(&env, 0).await, Vec::<String>::new());
    assert_eq!(archive_calls(&env), 1);
}

#[tokio::test]
async fn test_client_disconnect_aborts_generation() {
    let env = TestEnv::start().await;

    let response = reqwest::get(env.url("/group/endless/repository/archive.tar")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.bytes_stream();
    let chunk = body.next().await.unwrap().unwrap();
    assert!(chunk.starts_with(b"archive"));
    drop(body);

    assert_eq!(wait_for_cache(&env, 0).await, Vec::<String>::new());
}

#[tokio::test]
async fn test_concurrent_misses_both_succeed() {
    let env = TestEnv::start().await;
    let url = env.url("/group/slow/repository/archive.tar");

    let (first, second) = tokio::join!(reqwest::get(&url), reqwest::get(&url));
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);
    let (first, second) = tokio::join!(first.bytes(), second.bytes());
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first, second);
    assert_eq!(
        &first[..],
        b"archive --format=tar --prefix=slow-slow/ slow\n"
    );
    // Both generated; one link won and the other found the file present.
    assert_eq!(archive_calls(&env), 2);
    let cached = wait_for_cache(&env, 1).await;
    assert_eq!(cached.len(), 1);
    assert!(cached[0].starts_with("slow-"));
}

#[tokio::test]
async fn test_prefixed_archive_names_the_project() {
    let env = TestEnv::start_with(|config| {
        config.backend.url = format!("{}gitlab", config.backend.url);
    })
    .await;

    let response = reqwest::get(env.url(&format!("/gitlab{ARCHIVE_PATH}"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-disposition"],
        format!("attachment; filename=\"project-{COMMIT}.tar\"")
    );
    assert_eq!(
        &response.bytes().await.unwrap()[..],
        format!("archive --format=tar --prefix=project-{COMMIT}/ {COMMIT}\n").as_bytes()
    );
}
