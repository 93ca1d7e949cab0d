//! Matrix Client SDK
//!
//! 面向 Matrix 风格 home server 的客户端引擎，提供：
//! - 🔄 增量同步：/sync 长轮询 + 游标续传，房间增量以广播派发
//! - 📤 出站队列：客户端事务 ID 去重，失败平方退避重试，累计超限放弃
//! - 🧩 事件注册表:按事件类型 / 消息类型两级注册自定义解码器，未知类型回退 Raw
//! - 🤖 Application Service 模式：静态 token 代虚拟用户操作，发送同步冲刷
//! - 🌐 REST 封装：登录、资料、房间管理、目录、媒体上传
//!
//! # 快速开始
//!
//! ```no_run
//! use matrix_client_sdk::{ClientConfig, MatrixClient, MessageContent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = MatrixClient::new("https://matrix.example.org", ClientConfig::default())?;
//!     client.login("alice", "secret").await?;
//!
//!     let mut deltas = client.subscribe_deltas();
//!     client.start_sync_loop()?;
//!
//!     let room_id = client.join_room("#general:example.org").await?;
//!     client.send_message(&room_id, MessageContent::text("hello")).await?;
//!
//!     while let Ok(delta) = deltas.recv().await {
//!         println!("房间增量: {}", delta.room_id);
//!     }
//!
//!     client.stop_sync_loop().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod outbound;
pub mod registry;
pub mod sync;
pub mod types;

pub use backend::{HttpBackend, MatrixBackend};
pub use client::{MatrixClient, UserSession};
pub use config::{ClientConfig, ClientConfigBuilder, RetryConfig};
pub use error::{ErrorCode, MatrixSdkError, Result};
pub use registry::EventTypeRegistry;
pub use sync::SyncEngine;
pub use types::{
    CreateRoomRequest, EventContent, InvitedRoom, JoinedRoom, MessageContent, Profile,
    PublicRoomEntry, PublicRooms, RoomDelta, RoomDeltaKind, RoomEvent, RoomTags, TextMessage,
};
