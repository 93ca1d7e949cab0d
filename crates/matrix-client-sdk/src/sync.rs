//! 同步引擎 - 针对 home server 的增量长轮询
//!
//! 引擎持有同步游标（opaque token，空串表示首次全量同步），每次
//! `run_once` 发起一次 `/sync` 长轮询：
//! - 成功：解码响应、推进游标、置连接标记，并把本次响应的全部
//!   房间增量派发给订阅者（先已加入房间，后被邀请房间）
//! - 请求失败：长轮询模式下清连接标记并退避一段时间再返回；
//!   快速失败模式下立即返回错误
//! - 解码失败：仅作为本次尝试的错误上抛，游标与连接标记都不动
//!
//! 游标只由后台循环任务写入（外部通过 `set_cursor` 注入续传点除外）。

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::backend::MatrixBackend;
use crate::config::ClientConfig;
use crate::error::{MatrixSdkError, Result};
use crate::registry::EventTypeRegistry;
use crate::types::{
    InvitedRoom, InvitedRoomWire, JoinedRoom, JoinedRoomWire, RoomDelta, RoomDeltaKind, RoomEvent,
    SyncResponse,
};

pub struct SyncEngine {
    backend: Arc<dyn MatrixBackend>,
    registry: Arc<EventTypeRegistry>,
    cursor: RwLock<String>,
    connected: AtomicBool,
    initial_sync: AtomicBool,
    delta_tx: broadcast::Sender<RoomDelta>,
    sync_timeout_ms: u64,
    bad_sync_interval_ms: u64,
}

impl SyncEngine {
    pub fn new(
        backend: Arc<dyn MatrixBackend>,
        registry: Arc<EventTypeRegistry>,
        config: &ClientConfig,
    ) -> Self {
        let (delta_tx, _) = broadcast::channel(config.delta_buffer_size);
        Self {
            backend,
            registry,
            cursor: RwLock::new(String::new()),
            connected: AtomicBool::new(false),
            initial_sync: AtomicBool::new(true),
            delta_tx,
            sync_timeout_ms: config.sync_timeout_ms,
            bad_sync_interval_ms: config.bad_sync_interval_ms,
        }
    }

    /// 订阅房间增量
    pub fn subscribe(&self) -> broadcast::Receiver<RoomDelta> {
        self.delta_tx.subscribe()
    }

    /// 当前同步游标（空串表示尚未完成过同步）
    pub fn cursor(&self) -> String {
        self.cursor.read().clone()
    }

    /// 注入外部持久化的游标，跨重启续传
    ///
    /// 注入后视为非首次同步。
    pub fn set_cursor(&self, token: impl Into<String>) {
        *self.cursor.write() = token.into();
        self.initial_sync.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// 首次同步是否仍在进行中
    pub fn is_initial_syncing(&self) -> bool {
        self.initial_sync.load(Ordering::SeqCst)
    }

    /// 执行一次同步
    ///
    /// `long_poll` 为真时失败后退避 `bad_sync_interval_ms` 再返回，
    /// 供后台循环使用；为假时快速失败，供阻塞调用方使用。
    /// 无论结果如何，首次同步标记在第一次调用后清除。
    pub async fn run_once(&self, long_poll: bool) -> Result<()> {
        let result = self.attempt(long_poll).await;
        self.initial_sync.store(false, Ordering::SeqCst);
        result
    }

    async fn attempt(&self, long_poll: bool) -> Result<()> {
        let mut path = format!("/_matrix/client/r0/sync?timeout={}", self.sync_timeout_ms);
        {
            let cursor = self.cursor.read();
            if !cursor.is_empty() {
                path.push_str("&since=");
                path.push_str(&cursor);
            }
        }

        let response = match self.backend.get(&path, true).await {
            Ok(response) => response,
            Err(e) => {
                if long_poll {
                    self.connected.store(false, Ordering::SeqCst);
                    warn!("sync 请求失败，{}ms 后继续: {}", self.bad_sync_interval_ms, e);
                    sleep(Duration::from_millis(self.bad_sync_interval_ms)).await;
                }
                return Err(e);
            }
        };

        // 解码失败只中止本次尝试，游标与连接标记保持不变
        let sync: SyncResponse = serde_json::from_value(response)
            .map_err(|e| MatrixSdkError::Decode(format!("无法解码 sync 响应: {}", e)))?;

        self.process_sync(sync);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// 推进游标并派发本次响应的全部房间增量
    fn process_sync(&self, sync: SyncResponse) {
        *self.cursor.write() = sync.next_batch;

        for (room_id, wire) in sync.rooms.join {
            self.dispatch(RoomDelta {
                room_id,
                kind: RoomDeltaKind::Joined(self.decode_joined(wire)),
            });
        }
        for (room_id, wire) in sync.rooms.invite {
            self.dispatch(RoomDelta {
                room_id,
                kind: RoomDeltaKind::Invited(self.decode_invited(wire)),
            });
        }
    }

    fn decode_joined(&self, wire: JoinedRoomWire) -> JoinedRoom {
        JoinedRoom {
            timeline_events: self.decode_events(&wire.timeline.events),
            state_events: self.decode_events(&wire.state.events),
        }
    }

    fn decode_invited(&self, wire: InvitedRoomWire) -> InvitedRoom {
        InvitedRoom {
            invite_state_events: self.decode_events(&wire.invite_state.events),
        }
    }

    fn decode_events(&self, raw_events: &[Value]) -> Vec<RoomEvent> {
        raw_events
            .iter()
            .map(|raw| self.registry.decode_event(raw))
            .collect()
    }

    fn dispatch(&self, delta: RoomDelta) {
        // 无订阅者时 send 失败属正常场景（如纯发送型客户端），仅打 debug
        if let Err(e) = self.delta_tx.send(delta) {
            debug!("房间增量无人接收: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    use crate::types::{EventContent, MessageContent};

    struct MockBackend {
        get_results: Mutex<VecDeque<Result<Value>>>,
        get_paths: Mutex<Vec<String>>,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                get_results: Mutex::new(VecDeque::new()),
                get_paths: Mutex::new(Vec::new()),
            }
        }

        fn script_get(&self, results: Vec<Result<Value>>) {
            *self.get_results.lock() = results.into();
        }
    }

    #[async_trait]
    impl MatrixBackend for MockBackend {
        async fn get(&self, path: &str, _authenticated: bool) -> Result<Value> {
            self.get_paths.lock().push(path.to_string());
            self.get_results
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"next_batch": "s_default"})))
        }
        async fn post(
            &self,
            _path: &str,
            _authenticated: bool,
            _body: Option<Value>,
        ) -> Result<Value> {
            Ok(json!({}))
        }
        async fn put(&self, _path: &str, _authenticated: bool, _body: Value) -> Result<Value> {
            Ok(json!({}))
        }
        async fn delete(&self, _path: &str, _authenticated: bool) -> Result<Value> {
            Ok(json!({}))
        }
        async fn post_bytes(
            &self,
            _path: &str,
            _authenticated: bool,
            _body: Bytes,
            _content_type: &str,
        ) -> Result<Value> {
            Ok(json!({}))
        }
        fn set_access_token(&self, _token: String) {}
    }

    fn engine_with(backend: Arc<MockBackend>) -> SyncEngine {
        SyncEngine::new(
            backend,
            Arc::new(EventTypeRegistry::new()),
            &ClientConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_cursor_advances_and_is_sent_back() {
        let backend = Arc::new(MockBackend::new());
        backend.script_get(vec![
            Ok(json!({"next_batch": "s1"})),
            Ok(json!({"next_batch": "s2"})),
        ]);
        let engine = engine_with(backend.clone());

        engine.run_once(false).await.unwrap();
        assert_eq!(engine.cursor(), "s1");
        engine.run_once(false).await.unwrap();
        assert_eq!(engine.cursor(), "s2");

        let paths = backend.get_paths.lock();
        assert!(!paths[0].contains("since="));
        assert!(paths[1].contains("since=s1"));
    }

    #[tokio::test]
    async fn test_initial_sync_flag_clears_after_first_attempt() {
        let backend = Arc::new(MockBackend::new());
        backend.script_get(vec![Err(MatrixSdkError::Transport("down".into()))]);
        let engine = engine_with(backend);

        assert!(engine.is_initial_syncing());
        // 失败也要清首次同步标记
        assert!(engine.run_once(false).await.is_err());
        assert!(!engine.is_initial_syncing());
    }

    #[tokio::test]
    async fn test_injected_cursor_resumes() {
        let backend = Arc::new(MockBackend::new());
        let engine = engine_with(backend.clone());

        engine.set_cursor("s_saved");
        assert!(!engine.is_initial_syncing());
        engine.run_once(false).await.unwrap();
        assert!(backend.get_paths.lock()[0].contains("since=s_saved"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_failure_backs_off() {
        let backend = Arc::new(MockBackend::new());
        backend.script_get(vec![Err(MatrixSdkError::Server {
            errcode: "M_UNKNOWN".into(),
            message: "boom".into(),
        })]);
        let engine = engine_with(backend);

        let start = Instant::now();
        assert!(engine.run_once(true).await.is_err());
        assert!(!engine.is_connected());
        assert_eq!(engine.cursor(), "");
        assert_eq!(start.elapsed(), Duration::from_millis(25_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_fail_does_not_sleep() {
        let backend = Arc::new(MockBackend::new());
        backend.script_get(vec![Err(MatrixSdkError::Transport("down".into()))]);
        let engine = engine_with(backend);

        let start = Instant::now();
        assert!(engine.run_once(false).await.is_err());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_cursor_and_connection() {
        let backend = Arc::new(MockBackend::new());
        backend.script_get(vec![
            Ok(json!({"next_batch": "s1"})),
            // 缺 next_batch，信封解码失败
            Ok(json!({"rooms": {}})),
        ]);
        let engine = engine_with(backend);

        engine.run_once(false).await.unwrap();
        assert!(engine.is_connected());

        let err = engine.run_once(false).await.unwrap_err();
        assert!(matches!(err, MatrixSdkError::Decode(_)));
        assert_eq!(engine.cursor(), "s1");
        assert!(engine.is_connected());
    }

    #[tokio::test]
    async fn test_joined_deltas_dispatched_before_invited() {
        let backend = Arc::new(MockBackend::new());
        backend.script_get(vec![Ok(json!({
            "next_batch": "s1",
            "rooms": {
                "join": {
                    "!joined:x": {"timeline": {"events": [
                        {"type": "m.room.message",
                         "content": {"msgtype": "m.text", "body": "hi"}}
                    ]}}
                },
                "invite": {
                    "!invited:x": {"invite_state": {"events": [
                        {"type": "m.room.member",
                         "state_key": "@me:x",
                         "content": {"membership": "invite"}}
                    ]}}
                }
            }
        }))]);
        let engine = engine_with(backend);
        let mut deltas = engine.subscribe();

        engine.run_once(false).await.unwrap();

        let first = deltas.try_recv().unwrap();
        assert_eq!(first.room_id, "!joined:x");
        match first.kind {
            RoomDeltaKind::Joined(room) => {
                assert_eq!(room.timeline_events.len(), 1);
                assert!(matches!(
                    room.timeline_events[0].content,
                    EventContent::Message(MessageContent::Text(_))
                ));
            }
            other => panic!("unexpected delta: {:?}", other),
        }

        let second = deltas.try_recv().unwrap();
        assert_eq!(second.room_id, "!invited:x");
        assert!(matches!(second.kind, RoomDeltaKind::Invited(_)));
    }

    #[tokio::test]
    async fn test_unknown_event_tag_does_not_abort_sync() {
        let backend = Arc::new(MockBackend::new());
        backend.script_get(vec![Ok(json!({
            "next_batch": "s1",
            "rooms": {
                "join": {
                    "!a:x": {"timeline": {"events": [
                        {"type": "com.example.widget", "content": {"raw": true}}
                    ]}},
                    "!b:x": {"timeline": {"events": [
                        {"type": "m.room.message",
                         "content": {"msgtype": "m.text", "body": "still here"}}
                    ]}}
                }
            }
        }))]);
        let engine = engine_with(backend);
        let mut deltas = engine.subscribe();

        engine.run_once(false).await.unwrap();
        assert_eq!(engine.cursor(), "s1");

        let mut rooms_seen = Vec::new();
        while let Ok(delta) = deltas.try_recv() {
            if let RoomDeltaKind::Joined(room) = &delta.kind {
                assert_eq!(room.timeline_events.len(), 1);
                if delta.room_id == "!a:x" {
                    assert!(matches!(
                        room.timeline_events[0].content,
                        EventContent::Raw(_)
                    ));
                }
            }
            rooms_seen.push(delta.room_id);
        }
        rooms_seen.sort();
        assert_eq!(rooms_seen, vec!["!a:x", "!b:x"]);
    }
}
