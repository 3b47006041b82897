// 持久化存储模块
//
// 记录操作一律走 fetch-mutate-commit 事务：按 id 取、改、写回，
// 上层不持有可变的存储内对象

pub mod memory;
pub mod record;
pub mod sqlite;

pub use memory::MemoryUploadStore;
pub use record::{
    ChunkTask, RecordedError, UploadRecord, UploadSessionState, DEFAULT_MAX_RETRY_COUNT,
};
pub use sqlite::SqliteUploadStore;

use thiserror::Error;

/// 存储层错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 记录不存在（被并发删除或从未插入）
    #[error("记录不存在: {id}")]
    RecordNotFound { id: String },

    /// 存储后端失败
    #[error("存储后端失败: {0}")]
    Backend(String),
}

impl From<StoreError> for crate::error::UploadError {
    fn from(error: StoreError) -> Self {
        match error {
            // 记录消失：操作静默取消
            StoreError::RecordNotFound { .. } => {
                crate::error::UploadError::Queue(crate::error::QueueStateError::RecordVanished)
            }
            // 后端瞬时失败按可重试的传输层错误处理
            StoreError::Backend(message) => {
                crate::error::UploadError::Transport(crate::error::TransportError::Network {
                    message,
                })
            }
        }
    }
}

/// 待上传记录的查询范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingScope {
    pub user_id: u64,
    pub drive_id: u64,
    /// 只取进程外扩展创建（true）或进程内创建（false）的记录
    pub owned_by_extension: bool,
}

/// 上传记录存储
///
/// 实现必须保证 `with_record` 的取-改-写回在单个事务内完成
pub trait UploadStore: Send + Sync {
    /// 插入记录；id 已存在时不覆盖，返回 false
    fn insert(&self, record: UploadRecord) -> Result<bool, StoreError>;

    /// 按 id 取记录快照
    fn get(&self, id: &str) -> Result<Option<UploadRecord>, StoreError>;

    /// 事务内取-改-写回，返回修改后的快照
    fn with_record(
        &self,
        id: &str,
        mutate: &mut dyn FnMut(&mut UploadRecord),
    ) -> Result<UploadRecord, StoreError>;

    /// 删除记录（不存在时静默成功）
    fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// 范围内所有待上传记录（upload_date 为空），按入队时间排序
    fn pending_records(&self, scope: &PendingScope) -> Result<Vec<UploadRecord>, StoreError>;

    /// 范围内指定父目录下的待上传记录
    fn pending_in_parent(
        &self,
        scope: &PendingScope,
        parent_folder_id: u64,
    ) -> Result<Vec<UploadRecord>, StoreError>;

    /// 按会话令牌查找记录（后台传输归队用）
    fn find_by_session_token(&self, token: &str) -> Result<Option<UploadRecord>, StoreError>;

    /// 所有仍在上传中的源文件路径（缓存审计用）
    fn uploading_source_paths(&self) -> Result<Vec<std::path::PathBuf>, StoreError>;
}
