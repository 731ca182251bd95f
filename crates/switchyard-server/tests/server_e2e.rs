//! Full server runs: file registry, admin API and proxy listener together

use std::time::Duration;
use switchyard_ingress::ListenerConfig;
use switchyard_server::config::RegistryBackend;
use switchyard_server::{App, ServerConfig};
use wiremock::matchers::path;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn wait_for_status(client: &reqwest::Client, url: &str, status: u16) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(response) = client.get(url).send().await
                && response.status().as_u16() == status
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never returned {}", url, status));
}

#[tokio::test]
async fn test_manual_override_through_admin_api() {
    let backend = MockServer::start().await;
    Mock::given(path("/hello"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hi"))
        .mount(&backend)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let services = dir.path().join("services");
    std::fs::write(&services, format!("route add svc / {}/\n", backend.uri())).unwrap();

    let mut config = ServerConfig::default();
    config.listeners = vec![ListenerConfig::http("127.0.0.1:0")];
    config.admin.addr = "127.0.0.1:0".to_string();
    config.registry.backend = RegistryBackend::File;
    config.registry.services_path = Some(services.clone());
    config.registry.manual_dir = Some(dir.path().join("manual.d"));
    config.proxy.shutdown_wait_ms = 1000;
    config.validate().unwrap();

    let app = App::build(config).unwrap().bind().await.unwrap();
    let proxy = app.listener_addrs()[0];
    let admin = app.admin_addr().unwrap();
    let drain = app.drain();
    let serving = tokio::spawn(app.serve(std::future::pending()));

    let client = reqwest::Client::new();
    let proxied = format!("http://{}/hello", proxy);
    wait_for_status(&client, &proxied, 200).await;
    wait_for_status(&client, &format!("http://{}/readyz", admin), 200).await;

    let routes: serde_json::Value = client
        .get(format!("http://{}/api/routes", admin))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(routes[0]["service"], "svc");
    let cmd = routes[0]["cmd"].as_str().unwrap();
    assert!(
        cmd.starts_with(&format!("route add svc / {}/ weight", backend.uri())),
        "{}",
        cmd
    );

    let response = client
        .put(format!("http://{}/api/manual", admin))
        .json(&serde_json::json!({"value": "route del svc", "version": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    wait_for_status(&client, &proxied, 404).await;

    let stale = client
        .put(format!("http://{}/api/manual", admin))
        .json(&serde_json::json!({"value": "", "version": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(stale.status().as_u16(), 409);

    let current: serde_json::Value = client
        .get(format!("http://{}/api/manual", admin))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let response = client
        .put(format!("http://{}/api/manual", admin))
        .json(&serde_json::json!({"value": "", "version": current["version"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    wait_for_status(&client, &proxied, 200).await;

    drain.start();
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_services_file_changes_are_picked_up() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    Mock::given(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("a"))
        .mount(&a)
        .await;
    Mock::given(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("b"))
        .mount(&b)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let services = dir.path().join("services");
    std::fs::write(&services, format!("route add svc / {}/\n", a.uri())).unwrap();

    let mut config = ServerConfig::default();
    config.listeners = vec![ListenerConfig::http("127.0.0.1:0")];
    config.admin.enabled = false;
    config.registry.backend = RegistryBackend::File;
    config.registry.services_path = Some(services.clone());
    config.proxy.shutdown_wait_ms = 1000;

    let app = App::build(config).unwrap().bind().await.unwrap();
    let proxy = format!("http://{}/", app.listener_addrs()[0]);
    let drain = app.drain();
    let serving = tokio::spawn(app.serve(std::future::pending()));
    let client = reqwest::Client::new();

    let body_is = |expected: &'static str| {
        let client = client.clone();
        let proxy = proxy.clone();
        async move {
            tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    if let Ok(response) = client.get(&proxy).send().await
                        && response.text().await.ok().as_deref() == Some(expected)
                    {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("proxy never answered {}", expected));
        }
    };

    body_is("a").await;
    std::fs::write(&services, format!("route add svc / {}/\n", b.uri())).unwrap();
    body_is("b").await;

    drain.start();
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
