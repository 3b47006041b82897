// 上传会话协议类型定义

use crate::error::RemoteError;
use serde::{Deserialize, Serialize};

/// 冲突解决方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    /// 不创建文件/会话，直接报错
    Error,
    /// 以可用名称重命名新文件（file.txt -> file(3).txt）
    Rename,
    /// 替换已有文件内容（创建新版本）
    Version,
}

/// 会话令牌
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken(pub String);

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 日志中只保留前 8 位，避免令牌泄露
        let shown: String = self.0.chars().take(8).collect();
        write!(f, "{}…", shown)
    }
}

/// 开启会话请求参数
///
/// 目标目录必须通过 `directory_id` 或 `directory_path` 之一指定
#[derive(Debug, Clone, Serialize)]
pub struct StartSessionRequest {
    /// 目标云盘 id
    pub drive_id: u64,
    /// 文件总大小（字节）
    pub total_size: u64,
    /// 文件名
    pub file_name: String,
    /// 声明的分片总数
    pub total_chunks: u64,
    /// 冲突解决方式
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictResolution>,
    /// 覆盖创建时间（Unix 秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    /// 覆盖修改时间（Unix 秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<i64>,
    /// 目标目录 id（1 为用户根目录）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_id: Option<u64>,
    /// 目标目录路径（不含文件名；目录不存在时自动创建）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_path: Option<String>,
    /// 更新已有文件时的文件 id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<u64>,
}

/// 开启会话响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSessionData {
    /// 会话令牌
    pub token: SessionToken,
    /// 会话过期时间（Unix 秒）
    pub expires_at: i64,
}

/// 分片确认
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAck {
    /// 分片序号（从 1 开始）
    pub chunk_number: u64,
    /// 服务器确认的分片校验哈希
    pub checksum: String,
    /// 分片大小
    pub size: u64,
}

/// 远端文件句柄（关闭会话后返回）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFile {
    /// 文件 id
    pub id: u64,
    /// 文件名（冲突重命名后可能与请求不同）
    pub name: String,
    /// 文件大小
    pub size: u64,
    /// 所在目录 id
    pub parent_id: u64,
}

/// API 响应信封
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub result: String,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    #[serde(default = "Option::default")]
    pub error: Option<ApiErrorBody>,
}

/// API 错误体
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: String,
    #[serde(default)]
    pub description: String,
}

impl ApiErrorBody {
    /// 将服务端错误码映射到封闭错误分类
    pub fn to_remote_error(&self) -> RemoteError {
        match self.code.as_str() {
            "file_already_exists_error" | "destination_already_exists" => {
                RemoteError::FileAlreadyExists
            }
            "lock_error" => RemoteError::Lock,
            "not_authorized" | "forbidden_error" => RemoteError::NotAuthorized,
            "product_maintenance" => RemoteError::ProductMaintenance,
            "drive_is_in_maintenance_error" => RemoteError::DriveMaintenance,
            "quota_exceeded_error" => RemoteError::QuotaExceeded,
            "upload_not_terminated_error" | "upload_not_terminated" => {
                RemoteError::UploadNotTerminated
            }
            "invalid_upload_token_error" | "upload_token_is_not_valid" | "upload_error"
            | "upload_failed_error" => RemoteError::InvalidUploadToken,
            "upload_token_canceled" => RemoteError::UploadTokenCanceled,
            "object_not_found" => RemoteError::ObjectNotFound,
            "upload_destination_not_found_error" => RemoteError::DestinationNotFound,
            "upload_destination_not_writable_error" => RemoteError::DestinationNotWritable,
            "network_error" => RemoteError::NetworkError,
            _ => RemoteError::Server {
                code: self.code.clone(),
                message: self.description.clone(),
            },
        }
    }
}
