use std::{
    net::TcpListener,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use http::{
    HeaderValue, Method, StatusCode,
    header::{CONTENT_TYPE, COOKIE},
};
use offline_comments::{
    Credentials, Error, MessageCatalog, OfflineComments, Request, RetryQueue, SyncOptions,
};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::sleep,
};
use url::Url;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_string, header, method, path, query_param},
};

const COMMENT_PATH: &str = "/wp-comments-post.php?_wp_amp_action_xhr_converted=1";

/// A local address with nothing listening on it.
fn unreachable_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

fn site_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}/")
}

fn comment(site: &str, payload: &'static str) -> Result<Request> {
    let url = Url::parse(site)?.join(COMMENT_PATH)?;
    Ok(Request::post(url)
        .header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        )
        .header(COOKIE, HeaderValue::from_static("wordpress_logged_in=abc"))
        .credentials(Credentials::Include)
        .referrer(Url::parse(site)?.join("/hello-world/")?)
        .body(payload))
}

async fn wait_for_len(service: &OfflineComments, expected: usize) -> Result<()> {
    for _ in 0..300 {
        if service.queue().len().await? == expected {
            return Ok(());
        }
        sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("queue never reached {expected} entries");
}

async fn mock_comment_post(server: &MockServer, response: ResponseTemplate, expected: u64) {
    Mock::given(method("POST"))
        .and(path("/wp-comments-post.php"))
        .and(query_param("_wp_amp_action_xhr_converted", "1"))
        .respond_with(response)
        .expect(expected)
        .mount(server)
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_server_gets_queued_acknowledgment() -> Result<()> {
    let port = unreachable_port()?;
    let site = site_url(port);
    let storage = tempfile::tempdir()?;
    let service = OfflineComments::builder(&site)?
        .storage_dir(storage.path())
        .messages(MessageCatalog::new("Comment saved, it will be sent later."))
        .connect_timeout(Duration::from_secs(2))
        .build()
        .await?;

    let resp = service.fetch(comment(&site, "comment=offline")?).await?;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(
        resp.json::<Value>()?,
        json!({ "error": "Comment saved, it will be sent later." })
    );

    let origin = format!("http://127.0.0.1:{port}");
    let h = |name: &str| resp.headers.get(name).and_then(|v| v.to_str().ok());
    assert_eq!(h("access-control-allow-origin"), Some(origin.as_str()));
    assert_eq!(h("access-control-allow-credentials"), Some("true"));
    assert_eq!(h("content-type"), Some("application/json; charset=UTF-8"));
    assert_eq!(
        h("amp-access-control-allow-source-origin"),
        Some(origin.as_str())
    );

    wait_for_len(&service, 1).await?;
    let entries = service.queue().entries().await?;
    assert_eq!(entries[0].request.body, "comment=offline");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_success_is_returned_verbatim() -> Result<()> {
    let server = MockServer::start().await;
    mock_comment_post(
        &server,
        ResponseTemplate::new(200)
            .append_header("X-Comment-Id", "17")
            .set_body_json(json!({ "comment_id": 17 })),
        1,
    )
    .await;

    let site = format!("{}/", server.uri());
    let storage = tempfile::tempdir()?;
    let service = OfflineComments::builder(&site)?
        .storage_dir(storage.path())
        .build()
        .await?;

    let resp = service.fetch(comment(&site, "comment=hello")?).await?;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.json::<Value>()?, json!({ "comment_id": 17 }));
    assert_eq!(
        resp.headers.get("x-comment-id").and_then(|v| v.to_str().ok()),
        Some("17")
    );

    sleep(Duration::from_millis(20)).await;
    assert_eq!(service.queue().len().await?, 0);
    server.verify().await;
    Ok(())
}

// Server-side errors are not retried: only a failed connection queues.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_error_is_passed_through_and_not_queued() -> Result<()> {
    let server = MockServer::start().await;
    mock_comment_post(
        &server,
        ResponseTemplate::new(500).set_body_string("database error"),
        1,
    )
    .await;

    let site = format!("{}/", server.uri());
    let storage = tempfile::tempdir()?;
    let service = OfflineComments::builder(&site)?
        .storage_dir(storage.path())
        .build()
        .await?;

    let outcome = service
        .interceptor()
        .dispatch(comment(&site, "comment=hello")?)
        .await?;
    assert!(!outcome.is_queued());
    let resp = outcome.into_response();
    assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.text_lossy(), "database error");
    assert_eq!(service.queue().len().await?, 0);

    server.verify().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_matching_requests_bypass_the_queue() -> Result<()> {
    let port = unreachable_port()?;
    let site = site_url(port);
    let storage = tempfile::tempdir()?;
    let service = OfflineComments::builder(&site)?
        .storage_dir(storage.path())
        .build()
        .await?;

    let url = Url::parse(&site)?.join(COMMENT_PATH)?;
    let err = service
        .fetch(Request::get(url))
        .await
        .expect_err("GET is not intercepted");
    assert!(err.is_network_failure());

    let plain = Url::parse(&site)?.join("/wp-comments-post.php")?;
    let err = service
        .fetch(Request::post(plain).body("comment=plain"))
        .await
        .expect_err("form post without the XHR marker is not intercepted");
    assert!(matches!(err, Error::Transport { .. }));

    let lowercase = Method::from_bytes(b"post")?;
    let url = Url::parse(&site)?.join(COMMENT_PATH)?;
    assert!(service.fetch(Request::new(lowercase, url)).await.is_err());

    sleep(Duration::from_millis(20)).await;
    assert_eq!(service.queue().len().await?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_comments_replay_in_order_once_back_online() -> Result<()> {
    let port = unreachable_port()?;
    let site = site_url(port);
    let storage = tempfile::tempdir()?;

    let service = OfflineComments::builder(&site)?
        .storage_dir(storage.path())
        .request_hook(|ctx| {
            ctx.headers
                .insert("x-wp-nonce", HeaderValue::from_static("fresh-nonce"));
            Ok(())
        })
        .build()
        .await?;

    for payload in ["comment=one", "comment=two", "comment=three"] {
        let outcome = service
            .interceptor()
            .dispatch(comment(&site, payload)?)
            .await?;
        let offline_comments::Outcome::Queued { persistence, .. } = outcome else {
            anyhow::bail!("expected {payload} to be queued");
        };
        persistence.wait().await?;
    }
    assert_eq!(service.queue().len().await?, 3);

    // Offline: a replay attempt keeps everything.
    let report = service.replayer().replay().await?;
    assert_eq!(report.delivered, 0);
    assert_eq!(report.remaining, 3);

    let listener = TcpListener::bind(("127.0.0.1", port))?;
    let server = MockServer::builder().listener(listener).start().await;
    Mock::given(method("POST"))
        .and(path("/wp-comments-post.php"))
        .and(header("cookie", "wordpress_logged_in=abc"))
        .and(header("x-wp-nonce", "fresh-nonce"))
        .respond_with(ResponseTemplate::new(302).append_header("Location", "/hello-world/#comment-1"))
        .expect(3)
        .mount(&server)
        .await;

    let report = service.replayer().replay().await?;
    assert_eq!(report.delivered, 3);
    assert_eq!(report.remaining, 0);

    let received = server.received_requests().await.unwrap_or_default();
    let bodies: Vec<_> = received
        .iter()
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .collect();
    assert_eq!(bodies, ["comment=one", "comment=two", "comment=three"]);
    assert_eq!(
        received[0].headers.get("referer").and_then(|v| v.to_str().ok()),
        Some(format!("{site}hello-world/").as_str())
    );

    server.verify().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_survives_restart_and_background_sync_drains_it() -> Result<()> {
    let port = unreachable_port()?;
    let site = site_url(port);
    let storage = tempfile::tempdir()?;

    {
        let service = OfflineComments::builder(&site)?
            .storage_dir(storage.path())
            .build()
            .await?;
        service.fetch(comment(&site, "comment=persisted")?).await?;
        wait_for_len(&service, 1).await?;
    }

    let listener = TcpListener::bind(("127.0.0.1", port))?;
    let server = MockServer::builder().listener(listener).start().await;
    Mock::given(method("POST"))
        .and(path("/wp-comments-post.php"))
        .and(body_string("comment=persisted"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let service = OfflineComments::builder(&site)?
        .storage_dir(storage.path())
        .build()
        .await?;
    assert_eq!(service.queue().len().await?, 1);

    let sync = service.spawn_sync(SyncOptions {
        initial_pass: false,
        period: None,
    });
    sync.notify();
    wait_for_len(&service, 0).await?;
    sync.shutdown().await?;

    server.verify().await;
    Ok(())
}

/// Answers every connection with a status line and headers promising more
/// body than it sends, then hangs up.
async fn truncating_server() -> Result<(u16, Arc<AtomicUsize>)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut seen = Vec::new();
            let mut buf = [0u8; 1024];
            while !String::from_utf8_lossy(&seen).contains("comment=once") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => seen.extend_from_slice(&buf[..n]),
                }
            }
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nshort")
                .await;
            let _ = socket.shutdown().await;
        }
    });
    Ok((port, hits))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncated_answer_counts_as_delivered() -> Result<()> {
    let (port, hits) = truncating_server().await?;
    let site = site_url(port);
    let storage = tempfile::tempdir()?;
    let service = OfflineComments::builder(&site)?
        .storage_dir(storage.path())
        .build()
        .await?;

    let outcome = service
        .interceptor()
        .dispatch(comment(&site, "comment=once")?)
        .await?;
    assert!(!outcome.is_queued());
    let resp = outcome.into_response();
    assert_eq!(resp.status, StatusCode::OK);
    // Whatever arrived before the hang-up is kept.
    assert!("short".starts_with(resp.text_lossy().as_ref()));

    sleep(Duration::from_millis(20)).await;
    assert_eq!(service.queue().len().await?, 0);

    let report = service.replayer().replay().await?;
    assert_eq!(report.delivered, 0);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    Ok(())
}
