use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    http::{header, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use bytes::Bytes;
use chrono::Utc;
use flate2::{write::GzEncoder, Compression};
use reqwest::Client;
use sha1::{Digest, Sha1};
use tracing::{debug, error, info, warn};

use crate::config::{CacheConfig, NodeConfig};
use crate::error::BalancerError;
use crate::services::cache::{Cache, Item, Outcome, PopulateGuard};
use crate::services::node::Node;
use crate::services::sniffer::{is_gzip_encoded, request_cookie, sniff_session_cookie};

const CACHEABLE_PREFIXES: [&str; 1] = ["/images"];
const CACHEABLE_SUFFIXES: [&str; 5] = [".txt", ".png", ".css", ".js", ".jpg"];
const COMPRESSIBLE_SUFFIXES: [&str; 2] = [".js", ".css"];
const CACHE_EXPIRES_DAYS: i64 = 30;

/// 一个变体的代理：持有节点并负责节点选择和缓存
#[derive(Debug)]
pub struct Proxy {
    nodes: Vec<Arc<Node>>,
    cache: Arc<Cache>,
    max_request_body: usize,
}

impl Proxy {
    pub fn new(
        configs: &[NodeConfig],
        client: Client,
        cache_config: &CacheConfig,
        max_request_body: usize,
    ) -> Result<Self, BalancerError> {
        let nodes = configs
            .iter()
            .map(|config| Node::new(config, client.clone()).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            nodes,
            cache: Arc::new(Cache::new(
                cache_config.ttl(),
                cache_config.populate_timeout(),
            )),
            max_request_body,
        })
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// 按会话Cookie找出候选节点并选择负载最低的一个
    ///
    /// 请求携带某节点的会话Cookie时只在匹配的节点中选择，会话ID取Cookie的原始值；
    /// 否则在所有节点中选择，会话ID为空。
    pub fn resolve_node<B>(&self, request: &Request<B>) -> (Option<Arc<Node>>, String) {
        let mut session_id = String::new();
        let mut available: Vec<Arc<Node>> = Vec::new();

        for node in &self.nodes {
            if let Some(value) = request_cookie(request.headers(), &node.session_cookie_name) {
                if !value.is_empty() {
                    session_id = value;
                    available.push(node.clone());
                }
            }
        }

        if available.is_empty() {
            debug!("没有会话Cookie，在所有节点中选择");
            return (balance(&self.nodes), session_id);
        }

        debug!("找到会话所在的节点组: {} 个节点", available.len());
        (balance(&available), session_id)
    }

    /// 处理请求，返回响应和会话ID
    pub async fn serve(&self, request: Request<Body>) -> Result<(Response, String), BalancerError> {
        let (node, session_id) = self.resolve_node(&request);
        let node = node.ok_or(BalancerError::NoNode)?;
        debug!("由节点 {} 处理, 会话: {}", node.id, session_id);

        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, self.max_request_body)
            .await
            .map_err(|e| BalancerError::InvalidRequest(format!("读取请求体失败: {}", e)))?;
        let request = Request::from_parts(parts, body);

        if is_cacheable(request.method(), raw_uri(&request)) {
            // 可缓存的资源不会设置Cookie
            let response = self.serve_from_cache_with_node(request, node).await?;
            return Ok((response, session_id));
        }

        let response = node.forward(request).await;
        match sniff_session_cookie(response.headers(), &node.session_cookie_name) {
            Some(sniffed) => {
                debug!("后端返回会话: {}", sniffed);
                Ok((response, sniffed))
            }
            None => Ok((response, session_id)),
        }
    }

    async fn serve_from_cache_with_node(
        &self,
        request: Request<Bytes>,
        node: Arc<Node>,
    ) -> Result<Response, BalancerError> {
        let uri = raw_uri(&request).to_string();
        let key = cache_key(&uri);

        let deadline = Instant::now() + self.cache.populate_timeout();

        // 同一个键任何时候最多只有一个请求在访问后端
        loop {
            if let Some(item) = self.cache.get(&key) {
                debug!("缓存命中: {}", uri);
                return serve_from_cache(&item);
            }

            if let Some(guard) = self.cache.try_acquire(&key) {
                // 在独立任务中填充，客户端断开也会走到保存或取消
                let response = tokio::spawn(populate(guard, node, request, uri)).await?;
                return Ok(response);
            }

            if Instant::now() >= deadline {
                warn!("等待缓存填充超时: {}", uri);
                return Err(BalancerError::PopulateTimeout);
            }

            match self.cache.wait_for(&key).await {
                Some(Outcome::Saved(item)) => return serve_from_cache(&item),
                Some(Outcome::Uncached(captured)) => return Ok(captured.into_response()),
                Some(Outcome::Failed) => return Ok(bad_gateway()),
                // 填充者放弃或已经结束，重新竞争填充锁
                Some(Outcome::Cancelled) | None => {
                    debug!("重新尝试获取缓存: {}", uri);
                }
            }
        }
    }
}

/// 线性扫描负载最低的节点，负载相同时取第一个
pub fn balance(nodes: &[Arc<Node>]) -> Option<Arc<Node>> {
    let mut iter = nodes.iter();
    let mut best = iter.next()?;
    let mut best_load = best.load();

    for node in iter {
        let load = node.load();
        debug!("节点 {} 负载 {}", node.id, load);
        if load < best_load {
            best = node;
            best_load = load;
        }
    }

    debug!("负载最低的节点 {} ({})", best.id, best_load);
    Some(best.clone())
}

/// 只有 GET 请求的图片和静态文件可以缓存，大小写敏感
pub fn is_cacheable(method: &Method, uri: &str) -> bool {
    method == Method::GET
        && (CACHEABLE_PREFIXES.iter().any(|prefix| uri.starts_with(prefix))
            || CACHEABLE_SUFFIXES.iter().any(|suffix| uri.ends_with(suffix)))
}

/// 缓存键：原始URI的SHA-1摘要的URL安全base64编码
pub fn cache_key(uri: &str) -> String {
    URL_SAFE.encode(Sha1::digest(uri.as_bytes()))
}

fn raw_uri<B>(request: &Request<B>) -> &str {
    request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
}

async fn populate(
    guard: PopulateGuard,
    node: Arc<Node>,
    request: Request<Bytes>,
    uri: String,
) -> Response {
    let mut captured = match node.fetch(request).await {
        Ok(captured) => captured,
        Err(e) => {
            error!("填充缓存时请求节点 {} 失败: {}", node.id, e);
            guard.fail();
            return bad_gateway();
        }
    };
    // 经过缓存的响应不下发会话Cookie
    captured.headers.remove(header::SET_COOKIE);

    if captured.status == StatusCode::NOT_MODIFIED || captured.body.is_empty() {
        debug!("没有可缓存的内容({}): {}", captured.status, uri);
        guard.skip(captured.clone());
        return captured.into_response();
    }

    if COMPRESSIBLE_SUFFIXES.iter().any(|suffix| uri.ends_with(suffix))
        && !is_gzip_encoded(&captured.headers)
    {
        match compress(&captured.body) {
            Ok(data) => {
                info!("压缩 {}: {} -> {} bytes", uri, captured.body.len(), data.len());
                captured.body = Bytes::from(data);
                captured
                    .headers
                    .insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                captured.headers.remove(header::CONTENT_LENGTH);
            }
            Err(e) => warn!("压缩失败，按原样缓存 {}: {}", uri, e),
        }
    }

    guard.save(&uri, captured.body.clone(), captured.headers.clone());
    captured.into_response()
}

fn bad_gateway() -> Response {
    (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
}

fn serve_from_cache(item: &Item) -> Result<Response, BalancerError> {
    if item.data.is_empty() {
        return Err(BalancerError::EmptyCacheItem);
    }

    let mut response = Response::new(Body::from(item.data.clone()));
    let headers = response.headers_mut();
    if let Some(content_type) = item.headers.get(header::CONTENT_TYPE) {
        headers.insert(header::CONTENT_TYPE, content_type.clone());
    }
    if let Some(encoding) = item.headers.get(header::CONTENT_ENCODING) {
        if !encoding.is_empty() {
            headers.insert(header::CONTENT_ENCODING, encoding.clone());
        }
    }
    let expires = (Utc::now() + chrono::Duration::days(CACHE_EXPIRES_DAYS))
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    if let Ok(expires) = HeaderValue::from_str(&expires) {
        headers.insert(header::EXPIRES, expires);
    }

    Ok(response)
}

fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_proxy(cookies: &[&str]) -> Proxy {
        let configs: Vec<NodeConfig> = cookies
            .iter()
            .enumerate()
            .map(|(i, cookie)| NodeConfig {
                id: format!("n-{}", i + 1),
                server: format!("http://127.0.0.1:{}", 9000 + i),
                cookie: cookie.to_string(),
                max_connections: 10,
            })
            .collect();
        Proxy::new(&configs, Client::new(), &CacheConfig::default(), 1024).unwrap()
    }

    fn request_with_cookie(cookie: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_cacheable_paths() {
        assert!(is_cacheable(&Method::GET, "/images/logo"));
        assert!(is_cacheable(&Method::GET, "/static/app.js"));
        assert!(is_cacheable(&Method::GET, "/robots.txt"));
        assert!(is_cacheable(&Method::GET, "/a/b.jpg"));
        assert!(!is_cacheable(&Method::GET, "/static/app.JS"));
        assert!(!is_cacheable(&Method::GET, "/static/app.js?v=2"));
        assert!(!is_cacheable(&Method::GET, "/"));
        assert!(!is_cacheable(&Method::POST, "/images/upload"));
    }

    #[test]
    fn test_cache_key_is_url_safe_sha1() {
        assert_eq!(cache_key("/images/logo.png"), "ZkTKlvlxz1RJHfCgpo5XT-A38fg=");
        assert_eq!(cache_key("/"), "QgmbSvAh5T_Y_U4FbCVo18Lj_6g=");
    }

    #[test]
    fn test_balance_picks_strictly_minimal_load() {
        let proxy = make_proxy(&["sid", "sid", "sid"]);
        let nodes = proxy.nodes();
        let _a = nodes[0].acquire_slot();
        let _b = (nodes[0].acquire_slot(), nodes[1].acquire_slot());

        let chosen = balance(nodes).unwrap();
        assert_eq!(chosen.id, "n-3");
    }

    #[test]
    fn test_balance_first_wins_ties() {
        let proxy = make_proxy(&["sid", "sid", "sid"]);
        let nodes = proxy.nodes();
        let _a = nodes[0].acquire_slot();

        assert_eq!(balance(nodes).unwrap().id, "n-2");
        assert!(balance(&[]).is_none());
    }

    #[test]
    fn test_resolve_without_cookie_uses_all_nodes() {
        let proxy = make_proxy(&["sid-1", "sid-2"]);
        let _busy = proxy.nodes()[0].acquire_slot();

        let (node, session_id) = proxy.resolve_node(&request_with_cookie(None));
        assert_eq!(node.unwrap().id, "n-2");
        assert!(session_id.is_empty());
    }

    #[test]
    fn test_resolve_with_cookie_only_uses_matching_nodes() {
        let proxy = make_proxy(&["sid-1", "sid-2"]);
        let _busy = proxy.nodes()[0].acquire_slot();

        // 即使 n-1 更忙，也要留在会话所在的节点
        let (node, session_id) = proxy.resolve_node(&request_with_cookie(Some("sid-1=abc")));
        assert_eq!(node.unwrap().id, "n-1");
        assert_eq!(session_id, "abc");
    }

    #[test]
    fn test_resolve_ignores_empty_cookie_value() {
        let proxy = make_proxy(&["sid-1", "sid-2"]);
        let (_, session_id) = proxy.resolve_node(&request_with_cookie(Some("sid-1=")));
        assert!(session_id.is_empty());
    }

    #[test]
    fn test_serve_from_cache_copies_headers() {
        let cache = Arc::new(Cache::new(
            std::time::Duration::from_secs(60),
            std::time::Duration::from_secs(1),
        ));
        let mut stored = axum::http::HeaderMap::new();
        stored.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/css"));
        stored.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        stored.insert(header::SET_COOKIE, HeaderValue::from_static("sid=leak"));
        let item = cache
            .try_acquire("k")
            .unwrap()
            .save("/x.css", Bytes::from("x"), stored)
            .unwrap();

        let response = serve_from_cache(&item).unwrap();
        let headers = response.headers();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "text/css");
        assert_eq!(headers[header::CONTENT_ENCODING], "gzip");
        assert!(headers[header::EXPIRES].to_str().unwrap().ends_with("GMT"));
        assert!(headers.get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_waiting_on_stuck_populator_times_out() {
        let config = NodeConfig {
            id: "n-1".to_string(),
            server: "http://127.0.0.1:9000".to_string(),
            cookie: "sid".to_string(),
            max_connections: 10,
        };
        // 存活60秒，等待超时为1秒
        let proxy =
            Proxy::new(&[config], Client::new(), &CacheConfig::with_ttl(60, 60), 1024).unwrap();
        let _stuck = proxy.cache().try_acquire(&cache_key("/images/a.png")).unwrap();

        let request = Request::builder()
            .uri("/images/a.png")
            .body(Body::empty())
            .unwrap();
        let started = Instant::now();
        let result = proxy.serve(request).await;
        assert!(matches!(result, Err(BalancerError::PopulateTimeout)));
        assert!(started.elapsed() >= std::time::Duration::from_secs(1));
        assert_eq!(proxy.nodes()[0].open_connections(), 0);
    }

    #[test]
    fn test_compress_produces_gzip() {
        let data = compress(b"body { color: red; }").unwrap();
        assert_eq!(&data[..2], &[0x1f, 0x8b]);
    }
}
