#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{body::Body, http::Request, response::Response};
use bytes::Bytes;
use reqwest::Client;
use variant_balancer::config::{CacheConfig, NodeConfig};
use variant_balancer::services::Proxy;
use wiremock::{MockServer, Respond, ResponseTemplate};

pub const COOKIE_NAME: &str = "testCookie";

pub fn node_config(id: &str, server: &MockServer) -> NodeConfig {
    NodeConfig {
        id: id.to_string(),
        server: server.uri(),
        cookie: COOKIE_NAME.to_string(),
        max_connections: 100,
    }
}

pub fn make_proxy(server: &MockServer) -> Proxy {
    Proxy::new(
        &[node_config("n-1", server)],
        Client::new(),
        &CacheConfig::default(),
        1024 * 1024,
    )
    .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn get_with_session(uri: &str, session_id: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("cookie", format!("{}={}", COOKIE_NAME, session_id))
        .body(Body::empty())
        .unwrap()
}

pub async fn body_bytes(response: Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

/// 没有会话Cookie时签发新会话的后端
pub struct SessionBackend {
    pub id: String,
    pub counter: Arc<AtomicUsize>,
}

impl Respond for SessionBackend {
    fn respond(&self, request: &wiremock::Request) -> ResponseTemplate {
        let has_session = request
            .headers
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains(&format!("{}=", COOKIE_NAME)))
            .unwrap_or(false);

        let template = ResponseTemplate::new(200).set_body_string(format!("hello-{}", self.id));
        if has_session {
            return template;
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        template.insert_header(
            "set-cookie",
            format!("{}=sess-{}-{}; Path=/", COOKIE_NAME, self.id, n).as_str(),
        )
    }
}
