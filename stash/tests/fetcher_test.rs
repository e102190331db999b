use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use stash::scraping::{
    FetchError, FetchOptions, HttpFetcher, PageFetcher, UrlPolicy, BROWSER_USER_AGENT,
};
use url::Url;

/// Answers every known name with a fixed address, like a hosts file.
struct StaticResolver(HashMap<String, IpAddr>);

impl StaticResolver {
    fn loopback(names: &[&str]) -> Arc<Self> {
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Arc::new(Self(names.iter().map(|n| (n.to_string(), loopback)).collect()))
    }
}

impl Resolve for StaticResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let result: Result<Addrs, Box<dyn std::error::Error + Send + Sync>> =
            match self.0.get(name.as_str()) {
                Some(ip) => Ok(Box::new(std::iter::once(SocketAddr::new(*ip, 0)))),
                None => Err(format!("unknown host {}", name.as_str()).into()),
            };
        Box::pin(async move { result })
    }
}

fn local_fetcher() -> HttpFetcher {
    HttpFetcher::new(FetchOptions {
        policy: UrlPolicy::allow_private(),
        ..FetchOptions::default()
    })
    .unwrap()
}

fn port(server: &mockito::Server) -> u16 {
    let host = server.host_with_port();
    host.rsplit(':').next().unwrap().parse().unwrap()
}

fn target(server: &mockito::Server, path: &str) -> Url {
    Url::parse(&format!("{}{}", server.url(), path)).unwrap()
}

#[tokio::test]
async fn sends_browser_user_agent() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/page")
        .match_header("user-agent", BROWSER_USER_AGENT)
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body("<html><title>Hi</title></html>")
        .create_async()
        .await;

    let html = local_fetcher().fetch(&target(&server, "/page")).await.unwrap();

    assert_eq!(html, "<html><title>Hi</title></html>");
    mock.assert_async().await;
}

#[tokio::test]
async fn follows_redirects() {
    let mut server = mockito::Server::new_async().await;
    let _moved = server
        .mock("GET", "/old")
        .with_status(301)
        .with_header("location", "/new")
        .create_async()
        .await;
    let _new = server
        .mock("GET", "/new")
        .with_status(200)
        .with_body("moved here")
        .create_async()
        .await;

    let html = local_fetcher().fetch(&target(&server, "/old")).await.unwrap();
    assert_eq!(html, "moved here");
}

#[tokio::test]
async fn redirect_loop_fails() {
    let mut server = mockito::Server::new_async().await;
    let _loop = server
        .mock("GET", "/loop")
        .with_status(302)
        .with_header("location", "/loop")
        .expect_at_least(1)
        .create_async()
        .await;

    let err = local_fetcher()
        .fetch(&target(&server, "/loop"))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Transport { .. }), "{:?}", err);
}

#[tokio::test]
async fn error_status_is_reported() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/missing")
        .with_status(404)
        .with_body("not here")
        .create_async()
        .await;

    let err = local_fetcher()
        .fetch(&target(&server, "/missing"))
        .await
        .unwrap_err();

    match err {
        FetchError::Status { status, .. } => assert_eq!(status.as_u16(), 404),
        other => panic!("expected status error, got {:?}", other),
    }
}

#[tokio::test]
async fn default_policy_never_contacts_loopback() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/internal")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    let fetcher = HttpFetcher::new(FetchOptions::default()).unwrap();
    let err = fetcher
        .fetch(&target(&server, "/internal"))
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Blocked(_)), "{:?}", err);
    mock.assert_async().await;
}

#[tokio::test]
async fn connection_refused_is_a_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let url = Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();
    let err = local_fetcher().fetch(&url).await.unwrap_err();

    assert!(matches!(err, FetchError::Transport { .. }), "{:?}", err);
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/big")
        .with_status(200)
        .with_body("x".repeat(4096))
        .create_async()
        .await;

    let fetcher = HttpFetcher::new(FetchOptions {
        policy: UrlPolicy::allow_private(),
        max_response_bytes: Some(1024),
        ..FetchOptions::default()
    })
    .unwrap();
    let err = fetcher.fetch(&target(&server, "/big")).await.unwrap_err();

    assert!(matches!(err, FetchError::TooLarge { limit: 1024, .. }), "{:?}", err);
}

#[tokio::test]
async fn body_under_the_cap_is_returned() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/small")
        .with_status(200)
        .with_body("<p>small</p>")
        .create_async()
        .await;

    let fetcher = HttpFetcher::new(FetchOptions {
        policy: UrlPolicy::allow_private(),
        max_response_bytes: Some(1024),
        ..FetchOptions::default()
    })
    .unwrap();
    let html = fetcher.fetch(&target(&server, "/small")).await.unwrap();

    assert_eq!(html, "<p>small</p>");
}

#[tokio::test]
async fn slow_server_times_out() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/slow")
        .with_status(200)
        .with_chunked_body(|w| {
            std::thread::sleep(Duration::from_secs(3));
            w.write_all(b"too late")
        })
        .create_async()
        .await;

    let fetcher = HttpFetcher::new(FetchOptions {
        policy: UrlPolicy::allow_private(),
        timeout: Duration::from_secs(1),
        ..FetchOptions::default()
    })
    .unwrap();
    let err = fetcher.fetch(&target(&server, "/slow")).await.unwrap_err();

    assert!(matches!(err, FetchError::Timeout { .. }), "{:?}", err);
}

#[tokio::test]
async fn name_resolving_to_private_address_is_blocked() {
    let mut server = mockito::Server::new_async().await;
    let port = port(&server);
    let mock = server
        .mock("GET", "/")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    let fetcher = HttpFetcher::new(FetchOptions {
        resolver: Some(StaticResolver::loopback(&["intranet.corp.example"])),
        ..FetchOptions::default()
    })
    .unwrap();
    let url = Url::parse(&format!("http://intranet.corp.example:{}/", port)).unwrap();
    let err = fetcher.fetch(&url).await.unwrap_err();

    assert!(matches!(err, FetchError::Blocked(_)), "{:?}", err);
    mock.assert_async().await;
}

#[tokio::test]
async fn redirect_to_private_address_is_blocked() {
    let mut server = mockito::Server::new_async().await;
    let port = port(&server);
    let start = server
        .mock("GET", "/start")
        .with_status(302)
        .with_header(
            "location",
            &format!("http://intranet.corp.example:{}/secret", port),
        )
        .create_async()
        .await;
    let secret = server
        .mock("GET", "/secret")
        .with_status(200)
        .with_body("internal")
        .expect(0)
        .create_async()
        .await;

    // public.test stands in for a public site; only it is exempt.
    let fetcher = HttpFetcher::new(FetchOptions {
        policy: UrlPolicy::default().allow_host("public.test"),
        resolver: Some(StaticResolver::loopback(&["public.test", "intranet.corp.example"])),
        ..FetchOptions::default()
    })
    .unwrap();
    let url = Url::parse(&format!("http://public.test:{}/start", port)).unwrap();
    let err = fetcher.fetch(&url).await.unwrap_err();

    assert!(matches!(err, FetchError::Blocked(_)), "{:?}", err);
    start.assert_async().await;
    secret.assert_async().await;
}

#[tokio::test]
async fn allowed_host_is_fetched_through_the_resolver() {
    let mut server = mockito::Server::new_async().await;
    let port = port(&server);
    let _mock = server
        .mock("GET", "/wiki")
        .with_status(200)
        .with_body("wiki page")
        .create_async()
        .await;

    let fetcher = HttpFetcher::new(FetchOptions {
        policy: UrlPolicy::default().allow_host("wiki.corp.example"),
        resolver: Some(StaticResolver::loopback(&["wiki.corp.example"])),
        ..FetchOptions::default()
    })
    .unwrap();
    let url = Url::parse(&format!("http://wiki.corp.example:{}/wiki", port)).unwrap();

    assert_eq!(fetcher.fetch(&url).await.unwrap(), "wiki page");
}
