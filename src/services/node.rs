use std::sync::{Arc, Mutex, PoisonError};

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, Request, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::{Client, Url};
use tracing::{debug, error};

use crate::config::NodeConfig;
use crate::error::BalancerError;
use crate::services::sniffer::CapturedResponse;

// 逐跳头部，不转发
const HOP_BY_HOP_HEADERS: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// 打开的连接数，只能通过 `ConnectionSlot` 修改
#[derive(Debug, Default)]
struct ConnectionCounter {
    open: Mutex<i64>,
}

impl ConnectionCounter {
    fn add(&self, delta: i64) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        *open += delta;
    }

    fn get(&self) -> i64 {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 占用一个连接，drop 时释放（包括出错和 panic 展开）
#[derive(Debug)]
pub struct ConnectionSlot {
    counter: Arc<ConnectionCounter>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.counter.add(-1);
    }
}

/// 一个后端节点
#[derive(Debug)]
pub struct Node {
    pub id: String,
    pub server: String,
    pub url: Url,
    pub session_cookie_name: String,
    max_connections: usize,
    connections: Arc<ConnectionCounter>,
    client: Client,
}

impl Node {
    pub fn new(config: &NodeConfig, client: Client) -> Result<Self, BalancerError> {
        let url = Url::parse(&config.server).map_err(|e| {
            BalancerError::Config(format!("节点 {} 地址无效 {}: {}", config.id, config.server, e))
        })?;
        if config.max_connections == 0 {
            return Err(BalancerError::Config(format!(
                "节点 {} 的最大连接数必须大于0",
                config.id
            )));
        }

        Ok(Self {
            id: config.id.clone(),
            server: config.server.clone(),
            url,
            session_cookie_name: config.cookie.clone(),
            max_connections: config.max_connections,
            connections: Arc::new(ConnectionCounter::default()),
            client,
        })
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn open_connections(&self) -> i64 {
        self.connections.get()
    }

    /// 负载 = 打开连接数 / 最大连接数，过载时可以大于1
    pub fn load(&self) -> f64 {
        let open = self.open_connections();
        if open > 0 {
            open as f64 / self.max_connections as f64
        } else {
            0.0
        }
    }

    pub fn acquire_slot(&self) -> ConnectionSlot {
        self.connections.add(1);
        ConnectionSlot {
            counter: self.connections.clone(),
        }
    }

    /// 实时转发，响应体以流的形式返回；连接在响应体读完或被丢弃时才释放
    pub async fn forward(&self, request: Request<Bytes>) -> Response {
        let slot = self.acquire_slot();
        let outbound = match self.build_request(request) {
            Ok(outbound) => outbound,
            Err(e) => {
                error!("节点 {} 构建上游请求失败: {}", self.id, e);
                return bad_gateway();
            }
        };

        debug!("转发到节点 {}: {}", self.id, outbound.url());
        match self.client.execute(outbound).await {
            Ok(upstream) => {
                let status = upstream.status();
                let headers = strip_hop_by_hop(upstream.headers());
                let mut chunks = upstream.bytes_stream();
                let body = async_stream::stream! {
                    let _slot = slot;
                    while let Some(chunk) = chunks.next().await {
                        yield chunk;
                    }
                };

                let mut response = Response::new(Body::from_stream(body));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            Err(e) => {
                error!("节点 {} 请求失败: {}", self.id, e);
                bad_gateway()
            }
        }
    }

    /// 完整读取上游响应，供缓存填充使用
    pub async fn fetch(&self, request: Request<Bytes>) -> Result<CapturedResponse, BalancerError> {
        let _slot = self.acquire_slot();
        let outbound = self.build_request(request)?;

        debug!("从节点 {} 获取: {}", self.id, outbound.url());
        let upstream = self.client.execute(outbound).await?;
        let status = upstream.status();
        let headers = strip_hop_by_hop(upstream.headers());
        let body = upstream.bytes().await?;

        Ok(CapturedResponse {
            status,
            headers,
            body,
        })
    }

    fn build_request(&self, request: Request<Bytes>) -> Result<reqwest::Request, BalancerError> {
        let (parts, body) = request.into_parts();
        let url = self.target_url(parts.uri.path(), parts.uri.query());

        // Host 由 reqwest 按节点地址重新生成
        let mut headers = strip_hop_by_hop(&parts.headers);
        headers.remove(header::HOST);

        let outbound = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .build()?;
        Ok(outbound)
    }

    fn target_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.url.clone();
        let base = self.url.path().trim_end_matches('/');
        url.set_path(&format!("{}{}", base, path));
        url.set_query(query);
        url
    }
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut headers = headers.clone();
    for name in HOP_BY_HOP_HEADERS.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers
}

fn bad_gateway() -> Response {
    (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
}
