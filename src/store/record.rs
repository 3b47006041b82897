// 上传记录数据模型
//
// 持久化存储是唯一事实来源：
// 内存中的操作状态只是缓存，任何挂起点之后都必须按 id 重新读取，
// 绝不跨挂起点持有旧快照

use crate::api::types::{ChunkAck, ConflictResolution, SessionToken};
use crate::chunk::{ByteRange, FileIdentity};
use crate::error::{SessionError, UploadError};
use bit_set::BitSet;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 默认重试预算
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;

/// 记录上持久化的错误（类别 + 包装原因）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    /// 稳定的类别标签（见 `UploadError::kind_label`）
    pub kind: String,
    /// 原始错误描述
    pub cause: String,
}

impl RecordedError {
    pub fn from_upload_error(error: &UploadError) -> Self {
        Self {
            kind: error.kind_label().to_string(),
            cause: error.to_string(),
        }
    }
}

/// 会话中单个分片的任务状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTask {
    /// 分片序号（从 1 开始）
    pub chunk_number: u64,
    /// 区间起始偏移
    pub range_start: u64,
    /// 区间末字节偏移（含）
    pub range_end: u64,
    /// 服务器确认（已上传时存在）
    pub ack: Option<ChunkAck>,
    /// 最近一次分片错误描述
    pub error: Option<String>,
}

impl ChunkTask {
    pub fn range(&self) -> ByteRange {
        self.range_start..=self.range_end
    }

    pub fn size(&self) -> u64 {
        self.range_end - self.range_start + 1
    }
}

/// 分片上传会话状态
///
/// 不变式：一旦过期或源文件身份变化，整个会话必须废弃重建，
/// 已上传分片不可跨身份变化复用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSessionState {
    /// 远端会话令牌
    pub token: SessionToken,
    /// 会话过期时间（Unix 秒）
    pub expires_at: i64,
    /// 声明的分片总数
    pub total_chunks: u64,
    /// 分片大小
    pub chunk_size: u64,
    /// 会话建立时的源文件身份快照
    pub file_identity: FileIdentity,
    /// 各分片任务状态
    pub chunk_tasks: Vec<ChunkTask>,
}

impl UploadSessionState {
    /// 会话是否已过期
    pub fn is_expired(&self, now_epoch: i64) -> bool {
        self.expires_at <= now_epoch
    }

    /// 源文件身份是否仍与会话建立时一致
    pub fn file_identity_matches(&self, current: &FileIdentity) -> bool {
        self.file_identity == *current
    }

    /// 已确认分片位图（位 = chunk_number - 1）
    pub fn acked_bitmap(&self) -> BitSet {
        let mut bitmap = BitSet::with_capacity(self.total_chunks as usize);
        for task in &self.chunk_tasks {
            if task.ack.is_some() {
                bitmap.insert(task.chunk_number as usize - 1);
            }
        }
        bitmap
    }

    /// 尚未确认的分片任务
    pub fn remaining_chunks(&self) -> Vec<ChunkTask> {
        self.chunk_tasks
            .iter()
            .filter(|t| t.ack.is_none())
            .cloned()
            .collect()
    }

    /// 是否所有声明分片都已确认
    pub fn all_chunks_acked(&self) -> bool {
        self.acked_bitmap().len() == self.total_chunks as usize
    }

    /// 已确认分片数
    pub fn acked_count(&self) -> usize {
        self.acked_bitmap().len()
    }

    /// 记录一个分片确认
    ///
    /// 分片序号不在声明范围内时返回 `ChunkMismatch`
    pub fn record_ack(&mut self, ack: ChunkAck) -> Result<(), UploadError> {
        let task = self
            .chunk_tasks
            .iter_mut()
            .find(|t| t.chunk_number == ack.chunk_number)
            .ok_or(UploadError::Session(SessionError::ChunkMismatch {
                chunk_number: ack.chunk_number,
            }))?;

        task.error = None;
        task.ack = Some(ack);
        Ok(())
    }
}

/// 上传记录
///
/// 一个排队中或已完成上传的文件的持久化描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    /// 记录 id（进程重启后保持稳定）
    pub id: String,
    /// 所属用户 id
    pub user_id: u64,
    /// 所属云盘 id
    pub drive_id: u64,
    /// 目标父目录 id
    pub parent_folder_id: u64,
    /// 本地源文件路径
    pub source_path: PathBuf,
    /// 目标文件名
    pub file_name: String,
    /// 入队时声明的文件大小
    pub declared_size: u64,
    /// 源文件创建时间（Unix 秒）
    pub created_at: i64,
    /// 源文件修改时间（Unix 秒，身份标记的一部分）
    pub modified_at: i64,
    /// 冲突解决方式覆盖
    pub conflict: Option<ConflictResolution>,
    /// 当前进度（0..1，未开始为 None）
    pub progress: Option<f64>,
    /// 最近记录的错误
    pub error: Option<RecordedError>,
    /// 剩余重试预算（0 = 需要用户介入）
    pub max_retry_count: u32,
    /// 是否由进程外扩展创建
    pub owned_by_extension: bool,
    /// 是否从受管文件系统视图发起
    pub initiated_from_file_manager: bool,
    /// 分片会话状态（开始分片后存在）
    pub session: Option<UploadSessionState>,
    /// 上传完成时间（挂起 = None）
    pub upload_date: Option<i64>,
    /// 入队时间（调度排序依据）
    pub task_creation_date: i64,
}

impl UploadRecord {
    /// 创建一条新的待上传记录
    pub fn new(
        user_id: u64,
        drive_id: u64,
        parent_folder_id: u64,
        source_path: PathBuf,
        file_name: String,
        declared_size: u64,
        modified_at: i64,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            drive_id,
            parent_folder_id,
            source_path,
            file_name,
            declared_size,
            created_at: now,
            modified_at,
            conflict: None,
            progress: None,
            error: None,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            owned_by_extension: false,
            initiated_from_file_manager: false,
            session: None,
            upload_date: None,
            task_creation_date: now,
        }
    }

    /// 是否仍待上传
    pub fn is_pending(&self) -> bool {
        self.upload_date.is_none()
    }

    /// 重试预算耗尽且带错误：需要用户介入，调度时跳过
    pub fn needs_user_attention(&self) -> bool {
        self.max_retry_count == 0 && self.error.is_some()
    }

    /// 记录错误（类别 + 原因）
    pub fn set_error(&mut self, error: &UploadError) {
        self.error = Some(RecordedError::from_upload_error(error));
    }

    /// 入队时声明的文件身份
    pub fn declared_identity(&self) -> FileIdentity {
        FileIdentity {
            size: self.declared_size,
            modified_at: self.modified_at,
        }
    }

    /// 清除会话状态（会话失效/分片不匹配/从头重试时调用）
    pub fn clean_session(&mut self) {
        self.session = None;
        self.progress = None;
    }

    /// 手动重试：清除错误并恢复重试预算，回到待上传状态
    pub fn reset_for_retry(&mut self) {
        self.error = None;
        self.progress = None;
        self.max_retry_count = DEFAULT_MAX_RETRY_COUNT;
    }
}
