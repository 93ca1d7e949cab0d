//! Backend 抽象 - 认证请求/响应交换
//!
//! SDK 核心只依赖 [`MatrixBackend`] trait，便于测试时注入 mock；
//! 生产实现 [`HttpBackend`] 使用 reqwest 作为底层 HTTP 客户端。

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::{Client, Method, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{MatrixSdkError, Result};

/// Home server 请求/响应能力
///
/// 错误分类见 [`MatrixSdkError`]：Transport（可重试）、
/// Server（带协议错误码）、Validation（不重试）。
#[async_trait]
pub trait MatrixBackend: Send + Sync {
    async fn get(&self, path: &str, authenticated: bool) -> Result<Value>;
    async fn post(&self, path: &str, authenticated: bool, body: Option<Value>) -> Result<Value>;
    async fn put(&self, path: &str, authenticated: bool, body: Value) -> Result<Value>;
    async fn delete(&self, path: &str, authenticated: bool) -> Result<Value>;
    /// 原始字节上传（媒体仓库）
    async fn post_bytes(
        &self,
        path: &str,
        authenticated: bool,
        body: Bytes,
        content_type: &str,
    ) -> Result<Value>;
    fn set_access_token(&self, token: String);
}

/// 生产 HTTP 实现
pub struct HttpBackend {
    client: Client,
    base_url: String,
    access_token: RwLock<Option<String>>,
    /// Application Service 模式下代操作的虚拟用户 ID（以 user_id 查询参数附加）
    impersonate_user_id: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, sync_timeout_ms: u64) -> Result<Self> {
        Self::build(base_url, None, sync_timeout_ms)
    }

    /// Application Service 模式：静态 token + 虚拟用户
    pub fn new_app_service(
        base_url: &str,
        token: &str,
        user_id: &str,
        sync_timeout_ms: u64,
    ) -> Result<Self> {
        let backend = Self::build(base_url, Some(user_id.to_string()), sync_timeout_ms)?;
        backend.set_access_token(token.to_string());
        Ok(backend)
    }

    /// 请求超时 = 长轮询超时 + 余量，保证长轮询不被本地掐断
    fn request_timeout(sync_timeout_ms: u64) -> Duration {
        Duration::from_millis(sync_timeout_ms) + Duration::from_secs(30)
    }

    fn build(
        base_url: &str,
        impersonate_user_id: Option<String>,
        sync_timeout_ms: u64,
    ) -> Result<Self> {
        Url::parse(base_url)
            .map_err(|e| MatrixSdkError::Config(format!("无效的 home server URL: {}", e)))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Self::request_timeout(sync_timeout_ms))
            .build()
            .map_err(|e| MatrixSdkError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ HTTP backend 已创建 (base_url: {})", base_url);

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: RwLock::new(None),
            impersonate_user_id,
        })
    }

    fn build_url(&self, path: &str) -> String {
        let mut url = format!("{}{}", self.base_url, path);
        if let Some(ref user_id) = self.impersonate_user_id {
            let sep = if path.contains('?') { '&' } else { '?' };
            url.push(sep);
            url.push_str("user_id=");
            url.push_str(user_id);
        }
        url
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        authenticated: bool,
        body: Option<Value>,
    ) -> Result<Value> {
        let url = self.build_url(path);
        debug!("{} {}", method, url);

        let mut request = self.client.request(method, &url);
        if authenticated {
            if let Some(token) = self.access_token.read().clone() {
                request = request.bearer_auth(token);
            }
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MatrixSdkError::Transport(e.to_string()))?;
        Self::read_response(response).await
    }

    async fn read_response(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| MatrixSdkError::Transport(e.to_string()))?;

        if status.is_success() {
            if text.is_empty() {
                return Ok(Value::Object(Default::default()));
            }
            return serde_json::from_str(&text)
                .map_err(|e| MatrixSdkError::Decode(format!("响应不是合法 JSON: {}", e)));
        }

        // 非 2xx：优先解析协议错误体 {"errcode": ..., "error": ...}
        if let Ok(err_body) = serde_json::from_str::<Value>(&text) {
            if let Some(errcode) = err_body.get("errcode").and_then(Value::as_str) {
                let message = err_body
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                return Err(MatrixSdkError::Server {
                    errcode: errcode.to_string(),
                    message,
                });
            }
        }
        Err(MatrixSdkError::Transport(format!(
            "HTTP {} without protocol error body",
            status
        )))
    }
}

#[async_trait]
impl MatrixBackend for HttpBackend {
    async fn get(&self, path: &str, authenticated: bool) -> Result<Value> {
        self.execute(Method::GET, path, authenticated, None).await
    }

    async fn post(&self, path: &str, authenticated: bool, body: Option<Value>) -> Result<Value> {
        self.execute(Method::POST, path, authenticated, body).await
    }

    async fn put(&self, path: &str, authenticated: bool, body: Value) -> Result<Value> {
        self.execute(Method::PUT, path, authenticated, Some(body))
            .await
    }

    async fn delete(&self, path: &str, authenticated: bool) -> Result<Value> {
        self.execute(Method::DELETE, path, authenticated, None).await
    }

    async fn post_bytes(
        &self,
        path: &str,
        authenticated: bool,
        body: Bytes,
        content_type: &str,
    ) -> Result<Value> {
        let url = self.build_url(path);
        debug!("POST {} ({} bytes, {})", url, body.len(), content_type);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", content_type.to_string())
            .body(body);
        if authenticated {
            if let Some(token) = self.access_token.read().clone() {
                request = request.bearer_auth(token);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| MatrixSdkError::Transport(e.to_string()))?;
        Self::read_response(response).await
    }

    fn set_access_token(&self, token: String) {
        *self.access_token.write() = Some(token);
    }
}
