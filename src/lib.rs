// 云盘分片上传队列引擎核心库
// 可恢复、可持久化的分片上传队列

// 上传会话协议客户端
pub mod api;

// 分片规划
pub mod chunk;

// 配置管理
pub mod config;

// 错误分类
pub mod error;

// 队列事件与节流
pub mod events;

// 日志初始化
pub mod logging;

// 单文件上传操作
pub mod operation;

// 上传队列调度
pub mod queue;

// 磁盘空间服务
pub mod space;

// 上传记录持久化
pub mod store;

// 导出常用类型
pub use api::{ChunkAck, ConflictResolution, RemoteFile, SessionClient, SessionToken};
pub use chunk::{plan_chunks, ChunkPlan, FileIdentity};
pub use config::{EngineConfig, LogConfig, UploadConfig};
pub use error::UploadError;
pub use events::{SuspendReason, UploadEvent};
pub use logging::{init_logging, LogGuard};
pub use queue::{
    DeviceConditions, NetworkClass, QueueOptions, UploadQueue, DEFAULT_PARALLELISM_CEILING,
};
pub use space::FreeSpaceService;
pub use store::{
    MemoryUploadStore, PendingScope, SqliteUploadStore, UploadRecord, UploadStore,
};
