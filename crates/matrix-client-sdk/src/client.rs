//! 客户端门面 - 组合同步引擎、出站队列与事件注册表
//!
//! 功能包括：
//! - 登录与会话管理（access token 透传给 backend）
//! - 后台同步循环的启动/停止（单实例，停止时补一次最终冲刷）
//! - 房间消息异步发送（入队即返回；AS 模式提交时同步冲刷）
//! - 资料 / 房间管理 / 目录 / 媒体等无状态 REST 封装

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::{HttpBackend, MatrixBackend};
use crate::config::ClientConfig;
use crate::error::{MatrixSdkError, Result};
use crate::outbound::OutboundQueue;
use crate::registry::EventTypeRegistry;
use crate::sync::SyncEngine;
use crate::types::{
    CreateRoomRequest, EventContent, LoginRequest, LoginResponse, MediaUploadResponse,
    MessageContent, Profile, PublicRooms, RoomDelta, RoomTags, VersionsResponse,
};

/// 登录后的用户会话
///
/// 只在显式登录时写入；调用方不应让登录与后台同步并发（文档约定，
/// 不在内部加锁保证）。
#[derive(Debug, Clone)]
pub struct UserSession {
    pub user_id: String,
    pub access_token: String,
    pub device_id: Option<String>,
}

pub struct MatrixClient {
    config: ClientConfig,
    backend: Arc<dyn MatrixBackend>,
    registry: Arc<EventTypeRegistry>,
    sync: Arc<SyncEngine>,
    outbound: Arc<OutboundQueue>,
    session: RwLock<Option<UserSession>>,
    /// AS（application service）模式：静态 token 代多个虚拟用户操作
    is_app_service: bool,
    loop_running: Arc<AtomicBool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MatrixClient {
    /// 普通客户端，HTTP backend
    pub fn new(homeserver_url: &str, config: ClientConfig) -> Result<Self> {
        let backend: Arc<dyn MatrixBackend> =
            Arc::new(HttpBackend::new(homeserver_url, config.sync_timeout_ms)?);
        Ok(Self::assemble(backend, config, false, None))
    }

    /// Application Service 客户端：静态 token + 虚拟用户 ID，无交互登录
    pub fn new_app_service(
        homeserver_url: &str,
        as_token: &str,
        user_id: &str,
        config: ClientConfig,
    ) -> Result<Self> {
        let backend: Arc<dyn MatrixBackend> = Arc::new(HttpBackend::new_app_service(
            homeserver_url,
            as_token,
            user_id,
            config.sync_timeout_ms,
        )?);
        Ok(Self::assemble(backend, config, true, Some(user_id.to_string())))
    }

    /// 注入自定义 backend（测试或非 HTTP 传输）
    pub fn with_backend(backend: Arc<dyn MatrixBackend>, config: ClientConfig) -> Self {
        Self::assemble(backend, config, false, None)
    }

    /// 注入自定义 backend 的 AS 模式客户端
    pub fn with_app_service_backend(
        backend: Arc<dyn MatrixBackend>,
        user_id: &str,
        config: ClientConfig,
    ) -> Self {
        Self::assemble(backend, config, true, Some(user_id.to_string()))
    }

    fn assemble(
        backend: Arc<dyn MatrixBackend>,
        config: ClientConfig,
        is_app_service: bool,
        as_user_id: Option<String>,
    ) -> Self {
        let registry = Arc::new(EventTypeRegistry::new());
        let sync = Arc::new(SyncEngine::new(backend.clone(), registry.clone(), &config));
        let outbound = Arc::new(OutboundQueue::new(
            backend.clone(),
            config.retry_config.clone(),
        ));
        let session = as_user_id.map(|user_id| UserSession {
            user_id,
            access_token: String::new(),
            device_id: None,
        });
        Self {
            config,
            backend,
            registry,
            sync,
            outbound,
            session: RwLock::new(session),
            is_app_service,
            loop_running: Arc::new(AtomicBool::new(false)),
            loop_handle: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // 会话
    // -----------------------------------------------------------------------

    /// 密码登录，成功后把 access token 透传给 backend
    pub async fn login(&self, user: &str, password: &str) -> Result<UserSession> {
        let request = serde_json::to_value(LoginRequest::password(user, password))?;
        let response = self
            .backend
            .post("/_matrix/client/r0/login", false, Some(request))
            .await?;
        let login: LoginResponse = serde_json::from_value(response)
            .map_err(|e| MatrixSdkError::Decode(format!("无法解码登录响应: {}", e)))?;

        self.backend.set_access_token(login.access_token.clone());
        let session = UserSession {
            user_id: login.user_id,
            access_token: login.access_token,
            device_id: login.device_id,
        };
        *self.session.write() = Some(session.clone());
        info!("登录成功: {}", session.user_id);
        Ok(session)
    }

    /// 刷新 access token
    pub async fn token_refresh(&self, refresh_token: &str) -> Result<()> {
        self.backend
            .post(
                "/_matrix/client/r0/tokenrefresh",
                true,
                Some(json!({ "refresh_token": refresh_token })),
            )
            .await?;
        Ok(())
    }

    pub fn session(&self) -> Option<UserSession> {
        self.session.read().clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.user_id.clone())
    }

    fn require_user_id(&self) -> Result<String> {
        self.user_id().ok_or(MatrixSdkError::NotLoggedIn)
    }

    /// 服务端支持的协议版本
    pub async fn versions(&self) -> Result<Vec<String>> {
        let response = self.backend.get("/_matrix/client/versions", false).await?;
        let versions: VersionsResponse = serde_json::from_value(response)
            .map_err(|e| MatrixSdkError::Decode(format!("无法解码 versions 响应: {}", e)))?;
        Ok(versions.versions)
    }

    // -----------------------------------------------------------------------
    // 后台同步循环
    // -----------------------------------------------------------------------

    /// 启动后台同步循环
    ///
    /// 同一客户端只允许一个循环实例，重复启动返回 `AlreadyRunning`。
    /// 循环内的错误只记录日志，不会终止循环。
    pub fn start_sync_loop(&self) -> Result<()> {
        if self.loop_running.swap(true, Ordering::SeqCst) {
            return Err(MatrixSdkError::AlreadyRunning);
        }

        let sync = self.sync.clone();
        let outbound = self.outbound.clone();
        let running = self.loop_running.clone();
        let interval = self.config.loop_interval_ms;

        let handle = tokio::spawn(async move {
            info!("后台同步循环启动");
            while running.load(Ordering::SeqCst) {
                if let Err(e) = sync.run_once(true).await {
                    warn!("同步迭代失败: {}", e);
                }
                outbound.flush().await;
                tokio::time::sleep(Duration::from_millis(interval)).await;
            }
            info!("后台同步循环退出");
        });
        *self.loop_handle.lock() = Some(handle);
        Ok(())
    }

    /// 停止后台同步循环
    ///
    /// 等待当前迭代结束，再补一次最终冲刷，保证待发事件在关停前
    /// 至少再尝试一次投递。
    pub async fn stop_sync_loop(&self) {
        self.loop_running.store(false, Ordering::SeqCst);
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("同步循环任务异常退出: {}", e);
            }
        }
        self.outbound.flush().await;
    }

    pub fn is_sync_running(&self) -> bool {
        self.loop_running.load(Ordering::SeqCst)
    }

    /// 阻塞执行一次同步（不经过后台循环），失败立即返回
    pub async fn sync_once(&self) -> Result<()> {
        self.sync.run_once(false).await
    }

    pub fn is_connected(&self) -> bool {
        self.sync.is_connected()
    }

    pub fn is_initial_syncing(&self) -> bool {
        self.sync.is_initial_syncing()
    }

    pub fn sync_cursor(&self) -> String {
        self.sync.cursor()
    }

    /// 注入外部持久化的同步游标，跨重启续传
    pub fn set_sync_cursor(&self, token: impl Into<String>) {
        self.sync.set_cursor(token);
    }

    /// 订阅房间增量（joined / invited）
    pub fn subscribe_deltas(&self) -> broadcast::Receiver<RoomDelta> {
        self.sync.subscribe()
    }

    // -----------------------------------------------------------------------
    // 事件类型注册
    // -----------------------------------------------------------------------

    pub fn register_event_type<F>(&self, tag: &str, decoder: F)
    where
        F: Fn(&Value) -> serde_json::Result<EventContent> + Send + Sync + 'static,
    {
        self.registry.register_event_type(tag, decoder);
    }

    pub fn register_message_type<F>(&self, tag: &str, decoder: F)
    where
        F: Fn(&Value) -> serde_json::Result<MessageContent> + Send + Sync + 'static,
    {
        self.registry.register_message_type(tag, decoder);
    }

    // -----------------------------------------------------------------------
    // 消息发送（异步队列路径）
    // -----------------------------------------------------------------------

    /// 发送房间消息：入队即返回事务 ID，由后台循环投递
    ///
    /// AS 模式下提交后立即同步冲刷一次。
    pub async fn send_message(&self, room_id: &str, message: MessageContent) -> Result<u32> {
        let content = message.to_wire()?;
        self.send_room_event(room_id, "m.room.message", content).await
    }

    /// 发送任意类型的房间事件（走同一出站队列）
    pub async fn send_room_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<u32> {
        let txn_id = self.outbound.submit(room_id, event_type, content)?;
        if self.is_app_service {
            self.outbound.flush().await;
        }
        Ok(txn_id)
    }

    /// 当前待投递事件数
    pub fn pending_outbound(&self) -> usize {
        self.outbound.pending_count()
    }

    // -----------------------------------------------------------------------
    // 无状态 REST 封装
    // -----------------------------------------------------------------------

    pub async fn profile(&self, user_id: &str) -> Result<Profile> {
        let response = self
            .backend
            .get(&format!("/_matrix/client/r0/profile/{}", user_id), true)
            .await?;
        serde_json::from_value(response)
            .map_err(|e| MatrixSdkError::Decode(format!("无法解码 profile 响应: {}", e)))
    }

    pub async fn set_display_name(&self, display_name: &str) -> Result<()> {
        let user_id = self.require_user_id()?;
        self.backend
            .put(
                &format!("/_matrix/client/r0/profile/{}/displayname", user_id),
                true,
                json!({ "displayname": display_name }),
            )
            .await?;
        Ok(())
    }

    pub async fn set_avatar_url(&self, avatar_url: &str) -> Result<()> {
        let user_id = self.require_user_id()?;
        self.backend
            .put(
                &format!("/_matrix/client/r0/profile/{}/avatar_url", user_id),
                true,
                json!({ "avatar_url": avatar_url }),
            )
            .await?;
        Ok(())
    }

    /// 加入房间（ID 或别名），返回规范化的房间 ID
    pub async fn join_room(&self, room_id_or_alias: &str) -> Result<String> {
        let response = self
            .backend
            .post(
                &format!("/_matrix/client/r0/join/{}", room_id_or_alias),
                true,
                None,
            )
            .await?;
        response
            .get("room_id")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| MatrixSdkError::Decode("join 响应缺少 room_id".to_string()))
    }

    pub async fn leave_room(&self, room_id: &str) -> Result<()> {
        self.backend
            .post(
                &format!("/_matrix/client/r0/rooms/{}/leave", room_id),
                true,
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn create_room(&self, request: CreateRoomRequest) -> Result<String> {
        let response = self
            .backend
            .post(
                "/_matrix/client/r0/createRoom",
                true,
                Some(serde_json::to_value(request)?),
            )
            .await?;
        response
            .get("room_id")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| MatrixSdkError::Decode("createRoom 响应缺少 room_id".to_string()))
    }

    pub async fn invite_user(&self, room_id: &str, user_id: &str) -> Result<()> {
        self.backend
            .post(
                &format!("/_matrix/client/r0/rooms/{}/invite", room_id),
                true,
                Some(json!({ "user_id": user_id })),
            )
            .await?;
        Ok(())
    }

    /// 写房间状态事件（非队列路径，阻塞到服务端确认）
    pub async fn send_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: Value,
    ) -> Result<()> {
        self.backend
            .put(
                &format!(
                    "/_matrix/client/r0/rooms/{}/state/{}/{}",
                    room_id, event_type, state_key
                ),
                true,
                content,
            )
            .await?;
        Ok(())
    }

    /// 发送输入状态指示
    pub async fn send_typing(
        &self,
        room_id: &str,
        typing: bool,
        timeout_ms: Option<u64>,
    ) -> Result<()> {
        let user_id = self.require_user_id()?;
        let body = match timeout_ms {
            Some(timeout) => json!({ "typing": typing, "timeout": timeout }),
            None => json!({ "typing": typing }),
        };
        self.backend
            .put(
                &format!("/_matrix/client/r0/rooms/{}/typing/{}", room_id, user_id),
                true,
                body,
            )
            .await?;
        Ok(())
    }

    pub async fn room_tags(&self, room_id: &str) -> Result<RoomTags> {
        let user_id = self.require_user_id()?;
        let response = self
            .backend
            .get(
                &format!("/_matrix/client/r0/user/{}/rooms/{}/tags", user_id, room_id),
                true,
            )
            .await?;
        serde_json::from_value(response)
            .map_err(|e| MatrixSdkError::Decode(format!("无法解码 tags 响应: {}", e)))
    }

    /// 公开房间列表（分页）
    pub async fn public_rooms(
        &self,
        limit: Option<u64>,
        since: Option<&str>,
        server: Option<&str>,
    ) -> Result<PublicRooms> {
        let mut query = Vec::new();
        if let Some(limit) = limit {
            query.push(format!("limit={}", limit));
        }
        if let Some(since) = since {
            query.push(format!("since={}", since));
        }
        if let Some(server) = server {
            query.push(format!("server={}", server));
        }
        let mut path = "/_matrix/client/r0/publicRooms".to_string();
        if !query.is_empty() {
            path.push('?');
            path.push_str(&query.join("&"));
        }
        let response = self.backend.get(&path, true).await?;
        serde_json::from_value(response)
            .map_err(|e| MatrixSdkError::Decode(format!("无法解码 publicRooms 响应: {}", e)))
    }

    /// 从房间目录删除别名
    pub async fn delete_room_alias(&self, alias: &str) -> Result<()> {
        self.backend
            .delete(
                &format!("/_matrix/client/r0/directory/room/{}", alias),
                true,
            )
            .await?;
        Ok(())
    }

    /// 上传媒体，返回 content URI（mxc://...）
    pub async fn upload_media(&self, content_type: &str, data: Bytes) -> Result<String> {
        let response = self
            .backend
            .post_bytes("/_matrix/media/r0/upload", true, data, content_type)
            .await?;
        let upload: MediaUploadResponse = serde_json::from_value(response)
            .map_err(|e| MatrixSdkError::Decode(format!("无法解码 upload 响应: {}", e)))?;
        Ok(upload.content_uri)
    }

    /// 注册 AS 虚拟用户（仅 AS 模式客户端可用）
    pub async fn register_app_service_user(&self, localpart: &str) -> Result<()> {
        if !self.is_app_service {
            return Err(MatrixSdkError::NotAppService);
        }
        self.backend
            .post(
                "/_matrix/client/r0/register",
                true,
                Some(json!({
                    "type": "m.login.application_service",
                    "user": localpart,
                })),
            )
            .await?;
        Ok(())
    }
}
