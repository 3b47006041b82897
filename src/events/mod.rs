// 队列事件模块
//
// 通过 tokio broadcast 向观察者推送类型化事件，
// 计数类事件经节流器合并后发出

pub mod throttle;

pub use throttle::{Clock, Coalescer, ManualClock, SystemClock};

use crate::api::types::RemoteFile;

/// 队列挂起原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    /// 用户显式暂停
    Explicit,
    /// 网络不可用（或仅限 Wi-Fi 时处于蜂窝网络）
    Network,
    /// 远端维护中
    Maintenance,
    /// 配额耗尽
    QuotaExceeded,
    /// 本地可用空间不足
    NotEnoughSpace,
}

/// 队列事件
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// 单个文件上传完成
    ///
    /// `remote_file` 在关闭会话成功时存在；
    /// 观察者处理完本事件后记录才会被删除
    FileUploaded {
        record_id: String,
        file_name: String,
        parent_folder_id: u64,
        drive_id: u64,
        remote_file: Option<RemoteFile>,
    },
    /// 指定父目录下待上传数变化（节流合并后）
    UploadCountInParentChanged {
        parent_folder_id: u64,
        user_id: u64,
        drive_id: u64,
        pending: usize,
    },
    /// 云盘范围待上传数变化（节流合并后）
    UploadCountInDriveChanged {
        user_id: u64,
        drive_id: u64,
        pending: usize,
    },
    /// 队列已挂起
    QueueSuspended { reason: SuspendReason },
    /// 队列已恢复
    QueueResumed,
    /// 空间不足，无法上传该文件
    NotEnoughSpace { file_name: String },
    /// 照片自动备份目标目录失效，自动备份已停用
    PhotoBackupDisabled { parent_folder_id: u64 },
    /// 操作终态失败的诊断信息
    OperationDiagnostic {
        record_id: String,
        payload: serde_json::Value,
    },
}
