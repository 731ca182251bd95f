//! Routing scenarios over real sockets: basic routing, host scoping with
//! longest prefix, and the weighted split

use futures::StreamExt;
use switchyard_integration_tests::{Harness, HarnessConfig, http_client};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn named_backend(name: &'static str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(name))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_basic_routing() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/anything"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&backend)
        .await;

    let harness = Harness::start(
        &format!("route add svc / {}/", backend.uri()),
        HarnessConfig::default(),
    )
    .await;

    let response = http_client()
        .get(harness.url("/anything"))
        .header("host", "any.host")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");

    let received = backend.received_requests().await.unwrap();
    assert_eq!(received[0].url.path(), "/anything");
    assert_eq!(received[0].headers["host"], "any.host");
}

#[tokio::test]
async fn test_host_scoped_longest_prefix() {
    let h1 = named_backend("h1").await;
    let h2 = named_backend("h2").await;
    let harness = Harness::start(
        &format!(
            "route add a app.com/ {}/\nroute add b app.com/api/ {}/",
            h1.uri(),
            h2.uri()
        ),
        HarnessConfig::default(),
    )
    .await;
    let client = http_client();

    let body = client
        .get(harness.url("/api/v1"))
        .header("host", "app.com")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "h2");
    let received = h2.received_requests().await.unwrap();
    assert_eq!(received[0].url.path(), "/api/v1");

    let body = client
        .get(harness.url("/x"))
        .header("host", "app.com")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "h1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_weighted_split() {
    let h1 = named_backend("h1").await;
    let h2 = named_backend("h2").await;
    let harness = Harness::start(
        &format!(
            "route add s / {}/ weight 0.25\nroute add s / {}/ weight 0.75",
            h1.uri(),
            h2.uri()
        ),
        HarnessConfig::default(),
    )
    .await;
    let client = http_client();
    let url = harness.url("/");

    let bodies: Vec<String> = futures::stream::iter(0..10_000)
        .map(|_| {
            let client = client.clone();
            let url = url.clone();
            async move {
                client
                    .get(&url)
                    .send()
                    .await
                    .unwrap()
                    .text()
                    .await
                    .unwrap()
            }
        })
        .buffer_unordered(32)
        .collect()
        .await;

    let h1_count = bodies.iter().filter(|b| *b == "h1").count();
    let h2_count = bodies.iter().filter(|b| *b == "h2").count();
    assert_eq!(h1_count + h2_count, 10_000);
    assert!((2400..=2600).contains(&h1_count), "h1 = {}", h1_count);
    assert!((7400..=7600).contains(&h2_count), "h2 = {}", h2_count);
}
