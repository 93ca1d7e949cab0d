//! 出站投递队列 - 带退避重试的可靠消息发送
//!
//! 特性：
//! - 多生产者入队（`submit` 任意任务可调），单消费者冲刷（`flush` 由
//!   后台循环或 AS 模式的同步路径调用，互斥锁保证同一时刻只有一次）
//! - 事务 ID 在待发集合内唯一，home server 以此去重
//! - 可重试失败按退避规则延迟重投，累计退避超过阈值后永久放弃
//! - 校验类失败（内容被服务端拒绝）直接丢弃，不重试

use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::backend::MatrixBackend;
use crate::config::RetryConfig;
use crate::error::{MatrixSdkError, Result};

/// 待发送的出站事件
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub txn_id: u32,
    pub room_id: String,
    pub event_type: String,
    pub content: Value,
    /// 当前退避延迟（秒），0 表示尚未失败过
    backoff_secs: u64,
    /// 累计已退避时长（秒）
    backoff_elapsed_secs: u64,
}

pub struct OutboundQueue {
    backend: Arc<dyn MatrixBackend>,
    pending: Mutex<VecDeque<PendingEvent>>,
    /// Flush 互斥：后台循环与 AS 同步路径不允许并发冲刷
    flush_lock: tokio::sync::Mutex<()>,
    retry: RetryConfig,
}

impl OutboundQueue {
    pub fn new(backend: Arc<dyn MatrixBackend>, retry: RetryConfig) -> Self {
        Self {
            backend,
            pending: Mutex::new(VecDeque::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            retry,
        }
    }

    /// 入队一条出站事件，立即返回事务 ID
    ///
    /// 校验 `body` 字段非空，否则拒绝且不入队。事务 ID 在有界空间内
    /// 随机采样，与在途事件冲突时重采样。
    pub fn submit(&self, room_id: &str, event_type: &str, content: Value) -> Result<u32> {
        let body_ok = content
            .get("body")
            .and_then(Value::as_str)
            .map(|b| !b.is_empty())
            .unwrap_or(false);
        if !body_ok {
            return Err(MatrixSdkError::Validation(
                "message content requires a non-empty body".to_string(),
            ));
        }

        let mut pending = self.pending.lock();
        // ID 空间占满时重采样无法终止
        if pending.len() as u32 >= self.retry.txn_id_space - 1 {
            return Err(MatrixSdkError::Other(
                "transaction id space exhausted".to_string(),
            ));
        }
        let mut rng = rand::thread_rng();
        let txn_id = loop {
            let candidate = rng.gen_range(1..self.retry.txn_id_space);
            if !pending.iter().any(|e| e.txn_id == candidate) {
                break candidate;
            }
        };
        pending.push_back(PendingEvent {
            txn_id,
            room_id: room_id.to_string(),
            event_type: event_type.to_string(),
            content,
            backoff_secs: 0,
            backoff_elapsed_secs: 0,
        });
        debug!(
            "出站事件入队: room={} type={} txn={} (队列 {} 条)",
            room_id,
            event_type,
            txn_id,
            pending.len()
        );
        Ok(txn_id)
    }

    /// 冲刷当前待发事件
    ///
    /// 只处理进入时的快照：冲刷期间新提交的事件留到下一轮。
    /// 失败重试的退避 sleep 阻塞冲刷调用方（后台循环或 AS 提交路径）。
    pub async fn flush(&self) {
        let _guard = self.flush_lock.lock().await;

        let batch: Vec<PendingEvent> = {
            let mut pending = self.pending.lock();
            pending.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }
        debug!("开始冲刷出站队列: {} 条", batch.len());

        for mut event in batch {
            match self.deliver(&event).await {
                Ok(_) => {
                    debug!("投递成功: room={} txn={}", event.room_id, event.txn_id);
                }
                Err(e) if e.is_retryable() => {
                    // 退避规则：首次 base 秒，之后每次对前一延迟取平方。
                    // 增长远快于常规 2^n，按原有行为保留。
                    let next_backoff = if event.backoff_secs == 0 {
                        self.retry.base_backoff_secs
                    } else {
                        event.backoff_secs.saturating_mul(event.backoff_secs)
                    };
                    event.backoff_elapsed_secs =
                        event.backoff_elapsed_secs.saturating_add(next_backoff);

                    if event.backoff_elapsed_secs > self.retry.give_up_after_secs {
                        warn!(
                            "累计退避 {}s 超过上限 {}s，放弃投递: room={} txn={}",
                            event.backoff_elapsed_secs,
                            self.retry.give_up_after_secs,
                            event.room_id,
                            event.txn_id
                        );
                        continue;
                    }

                    event.backoff_secs = next_backoff;
                    warn!(
                        "投递失败（{}），{}s 后重试: room={} txn={}",
                        e, next_backoff, event.room_id, event.txn_id
                    );
                    sleep(Duration::from_secs(next_backoff)).await;
                    self.pending.lock().push_back(event);
                }
                Err(e) => {
                    warn!(
                        "内容被拒绝，丢弃: room={} txn={} err={}",
                        event.room_id, event.txn_id, e
                    );
                }
            }
        }
    }

    async fn deliver(&self, event: &PendingEvent) -> Result<Value> {
        let path = format!(
            "/_matrix/client/r0/rooms/{}/send/{}/{}",
            event.room_id, event.event_type, event.txn_id
        );
        self.backend.put(&path, true, event.content.clone()).await
    }

    /// 当前待发事件数
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
