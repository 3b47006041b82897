// 上传错误分类体系
//
// 封闭的标签联合类型，替代字符串键控的错误包装：
// - LocalError     本地环境问题（本设备/本文件，通常需用户介入）
// - SessionError   会话协议问题（会话失效需重建）
// - TransportError 传输层问题（网络抖动，可静默重试）
// - RemoteError    远端服务问题（按结构性/瞬时性区分处理）
// - QueueStateError 队列内部状态（静默处理，不面向用户）

use std::path::PathBuf;
use thiserror::Error;

/// 本地环境错误
///
/// 与本设备或源文件相关，一般无法通过重试自愈
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocalError {
    /// 源文件已不存在
    #[error("源文件不存在: {path:?}")]
    FileNotFound { path: PathBuf },
    /// 源文件在会话建立后发生了变化（大小或修改时间不一致）
    #[error("源文件身份已变化，会话不可续传")]
    FileIdentityChanged,
    /// 暂存空间不足，无法开始分片上传
    #[error("本地暂存空间不足")]
    NotEnoughSpace,
}

/// 会话协议错误
///
/// 会话或分片状态不一致，处理方式统一为清除会话后重新开始
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// 目标目录既未指定 id 也未指定路径
    #[error("目标目录参数无效：directory_id 与 directory_path 至少提供一个")]
    InvalidDirectoryParameters,
    /// 文件名为空
    #[error("文件名不能为空")]
    FileNameIsEmpty,
    /// 声明的分片数超出 API 允许范围
    #[error("分片数超出范围: {total_chunks}")]
    ChunksNumberOutOfBounds { total_chunks: u64 },
    /// 分片大小无效（fileSize > 0 时必须大于 0）
    #[error("分片大小无效")]
    InvalidChunkSize,
    /// 服务器确认的分片与本地声明不匹配
    #[error("分片 #{chunk_number} 无法与会话匹配")]
    ChunkMismatch { chunk_number: u64 },
    /// 分片缺少校验哈希
    #[error("分片 #{chunk_number} 缺少校验哈希")]
    MissingChunkHash { chunk_number: u64 },
    /// 会话令牌已过期
    #[error("上传会话已过期")]
    Expired,
    /// 记录上没有会话但流程要求存在
    #[error("上传会话缺失")]
    TaskMissing,
    /// 会话状态无效（声明分片数与计划不一致等）
    #[error("上传会话状态无效")]
    Invalid,
    /// 重试预算耗尽
    #[error("重试次数已用尽")]
    RetryCountIsZero,
}

/// 传输层错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// 请求被系统或用户中止（静默处理，不记录错误）
    #[error("请求已被取消")]
    Cancelled,
    /// 请求超时（按普通网络错误重试）
    #[error("请求超时")]
    Timeout,
    /// 任务被队列重新调度（非失败）
    #[error("任务已重新调度")]
    TaskRescheduled,
    /// 其他网络层失败
    #[error("网络错误: {message}")]
    Network { message: String },
}

/// 远端服务错误
///
/// 结构性错误（配额、目标缺失、冲突）重试无意义，
/// 其余默认按普通退避重试
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// 目标位置已存在同名文件且未指定自动冲突解决
    #[error("目标位置已存在同名文件")]
    FileAlreadyExists,
    /// 目标被锁定
    #[error("目标文件被锁定")]
    Lock,
    /// 无权限（可能是令牌刷新间隙，重试）
    #[error("没有操作权限")]
    NotAuthorized,
    /// 产品维护中
    #[error("产品维护中")]
    ProductMaintenance,
    /// 云盘维护中
    #[error("云盘维护中")]
    DriveMaintenance,
    /// 配额已满
    #[error("存储配额已满")]
    QuotaExceeded,
    /// 会话未正常终结
    #[error("上传会话未正常终结")]
    UploadNotTerminated,
    /// 上传令牌无效
    #[error("上传令牌无效")]
    InvalidUploadToken,
    /// 上传令牌已被取消（主动取消会话的预期后果）
    #[error("上传令牌已取消")]
    UploadTokenCanceled,
    /// 目标对象不存在
    #[error("目标对象不存在")]
    ObjectNotFound,
    /// 上传目标目录不存在
    #[error("上传目标目录不存在")]
    DestinationNotFound,
    /// 上传目标目录不可写
    #[error("上传目标目录不可写")]
    DestinationNotWritable,
    /// 服务端报告的网络类错误
    #[error("远端网络错误")]
    NetworkError,
    /// 其他服务端错误
    #[error("服务端错误: code={code}, message={message}")]
    Server { code: String, message: String },
}

/// 队列内部状态错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueStateError {
    /// 记录已不在持久化存储中
    #[error("上传记录已不存在")]
    RecordVanished,
    /// 操作已正常结束
    #[error("操作已结束")]
    OperationFinished,
    /// 操作已被取消
    #[error("操作已取消")]
    OperationCancelled,
}

/// 上传错误（顶层分类）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("本地环境错误: {0}")]
    Local(#[from] LocalError),
    #[error("会话协议错误: {0}")]
    Session(#[from] SessionError),
    #[error("传输层错误: {0}")]
    Transport(#[from] TransportError),
    #[error("远端服务错误: {0}")]
    Remote(#[from] RemoteError),
    #[error("队列状态错误: {0}")]
    Queue(#[from] QueueStateError),
}

impl UploadError {
    /// 持久化到记录错误字段时使用的稳定标签
    pub fn kind_label(&self) -> &'static str {
        match self {
            UploadError::Local(LocalError::FileNotFound { .. }) => "local.file_not_found",
            UploadError::Local(LocalError::FileIdentityChanged) => "local.file_identity_changed",
            UploadError::Local(LocalError::NotEnoughSpace) => "local.not_enough_space",
            UploadError::Session(_) => "session.invalid",
            UploadError::Transport(TransportError::Cancelled) => "transport.cancelled",
            UploadError::Transport(TransportError::Timeout) => "transport.timeout",
            UploadError::Transport(TransportError::TaskRescheduled) => "transport.rescheduled",
            UploadError::Transport(TransportError::Network { .. }) => "transport.network",
            UploadError::Remote(RemoteError::FileAlreadyExists) => "remote.conflict",
            UploadError::Remote(RemoteError::QuotaExceeded) => "remote.quota_exceeded",
            UploadError::Remote(RemoteError::ProductMaintenance)
            | UploadError::Remote(RemoteError::DriveMaintenance) => "remote.maintenance",
            UploadError::Remote(RemoteError::ObjectNotFound)
            | UploadError::Remote(RemoteError::DestinationNotFound)
            | UploadError::Remote(RemoteError::DestinationNotWritable) => {
                "remote.destination_invalid"
            }
            UploadError::Remote(_) => "remote.server",
            UploadError::Queue(_) => "queue.state",
        }
    }

    /// 是否属于远端分类（网络类或服务端类）
    ///
    /// 只有远端分类的错误才进入第二阶段（远端）错误处理
    pub fn is_remote_class(&self) -> bool {
        matches!(self, UploadError::Remote(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_label_stability() {
        let e = UploadError::Local(LocalError::NotEnoughSpace);
        assert_eq!(e.kind_label(), "local.not_enough_space");

        let e = UploadError::Remote(RemoteError::QuotaExceeded);
        assert_eq!(e.kind_label(), "remote.quota_exceeded");

        let e = UploadError::Remote(RemoteError::DestinationNotFound);
        assert_eq!(e.kind_label(), "remote.destination_invalid");
    }

    #[test]
    fn test_remote_class() {
        assert!(UploadError::Remote(RemoteError::Lock).is_remote_class());
        assert!(!UploadError::Transport(TransportError::Timeout).is_remote_class());
        assert!(!UploadError::Local(LocalError::FileIdentityChanged).is_remote_class());
    }
}
