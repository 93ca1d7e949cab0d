//! 客户端配置

use serde::{Deserialize, Serialize};

/// 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// sync 长轮询超时（毫秒）
    pub sync_timeout_ms: u64,
    /// sync 失败后的退避间隔（毫秒）
    pub bad_sync_interval_ms: u64,
    /// 后台循环两次迭代之间的间隔（毫秒）
    pub loop_interval_ms: u64,
    /// 出站重试配置
    pub retry_config: RetryConfig,
    /// 房间增量广播缓冲区大小
    pub delta_buffer_size: usize,
}

/// 出站投递重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 首次重试延迟（秒）
    pub base_backoff_secs: u64,
    /// 累计退避超过该阈值后放弃投递（秒）
    pub give_up_after_secs: u64,
    /// 事务 ID 采样空间上界（ID 取 1..space）
    pub txn_id_space: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_backoff_secs: 2,
            give_up_after_secs: 300,
            txn_id_space: 64,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: 10_000,
            bad_sync_interval_ms: 25_000,
            loop_interval_ms: 250,
            retry_config: RetryConfig::default(),
            delta_buffer_size: 256,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }
}

/// 配置构建器
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn sync_timeout_ms(mut self, ms: u64) -> Self {
        self.config.sync_timeout_ms = ms;
        self
    }

    pub fn bad_sync_interval_ms(mut self, ms: u64) -> Self {
        self.config.bad_sync_interval_ms = ms;
        self
    }

    pub fn loop_interval_ms(mut self, ms: u64) -> Self {
        self.config.loop_interval_ms = ms;
        self
    }

    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.config.retry_config = retry;
        self
    }

    pub fn delta_buffer_size(mut self, size: usize) -> Self {
        self.config.delta_buffer_size = size;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
