//! Upstream client behaviour against a mock backend

use reqwest::Method;
use std::time::Duration;
use switchyard_egress::{ClientFlavor, UpstreamClientConfig, UpstreamClients};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(url: &str) -> reqwest::Request {
    reqwest::Request::new(Method::GET, url.parse().unwrap())
}

#[tokio::test]
async fn test_redirects_are_not_followed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", "/new"))
        .mount(&server)
        .await;

    let clients = UpstreamClients::new(&UpstreamClientConfig::default()).unwrap();
    let response = clients
        .send(ClientFlavor::Verified, request(&format!("{}/old", server.uri())))
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 301);
    assert_eq!(response.headers()["location"], "/new");
}

#[tokio::test]
async fn test_response_header_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let config = UpstreamClientConfig {
        response_header_timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let clients = UpstreamClients::new(&config).unwrap();
    let err = clients
        .send(ClientFlavor::Verified, request(&server.uri()))
        .await
        .unwrap_err();

    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_connection_reuse() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(5)
        .mount(&server)
        .await;

    let clients = UpstreamClients::new(&UpstreamClientConfig::default()).unwrap();
    for i in 0..5 {
        let response = clients
            .send(ClientFlavor::Verified, request(&format!("{}/r/{}", server.uri(), i)))
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "ok");
    }
}
