// 操作错误处理
//
// 两阶段分发：先本地阶段（环境/会话/传输/队列状态），
// 未命中再进远端阶段（服务端错误码）。取消与队列状态类错误
// 静默结束，其余在记录上留下错误并视情况触发队列级动作

use crate::api::SessionToken;
use crate::error::{LocalError, RemoteError, SessionError, TransportError, UploadError};
use crate::events::SuspendReason;
use crate::operation::{OperationDeps, OperationOutcome};
use crate::store::UploadRecord;
use tracing::{debug, error, warn};

/// 错误收束入口：分类处理后返回操作终态
pub(crate) async fn catching(
    deps: &OperationDeps,
    record_id: &str,
    error: UploadError,
) -> OperationOutcome {
    match &error {
        // 取消与队列状态类：静默结束，不记录、不发事件
        UploadError::Queue(_) | UploadError::Transport(TransportError::Cancelled) => {
            debug!("操作静默结束: record={}, {}", record_id, error);
            return OperationOutcome::Cancelled;
        }
        // 重新调度不是失败：记录但不消耗预算，下一轮调度重来，
        // 不发完成事件也不发诊断
        UploadError::Transport(TransportError::TaskRescheduled) => {
            debug!("操作让出，等待重新调度: record={}", record_id);
            if let Err(e) = deps.store.with_record(record_id, &mut |r| r.set_error(&error)) {
                warn!("记录调度错误失败: {}", e);
            }
            return OperationOutcome::Cancelled;
        }
        _ => {}
    }

    // 级联取消可能删除记录本身，先取快照供诊断兜底
    let snapshot = deps.store.get(record_id).ok().flatten();

    let handled = handle_local_errors(deps, record_id, &error).await;
    if !handled && !handle_remote_errors(deps, record_id, &error).await {
        // 封闭分类下不应到达；兜底按可重试记录
        warn!("未分类错误，按可重试处理: record={}, {}", record_id, error);
        record_failure(deps, record_id, &error, false);
    }

    // 终态失败的诊断快照；记录已被级联删除时退回处理前的快照
    if let Some(record) = deps.store.get(record_id).ok().flatten().or(snapshot) {
        error!("上传失败: {} ({})", record.file_name, error);
        deps.control
            .emit_diagnostic(record_id, error_metadata(&record, &error));
    }

    OperationOutcome::Failed
}

/// 本地阶段错误处理
///
/// 返回 true 表示错误已在本阶段收束
async fn handle_local_errors(deps: &OperationDeps, record_id: &str, error: &UploadError) -> bool {
    match error {
        // 网络抖动：普通重试
        UploadError::Transport(TransportError::Timeout)
        | UploadError::Transport(TransportError::Network { .. }) => {
            record_failure(deps, record_id, error, false);
            true
        }

        // 源文件消失：致命，本记录作废
        UploadError::Local(LocalError::FileNotFound { .. }) => {
            clean_session(deps, record_id).await;
            record_failure(deps, record_id, error, true);
            true
        }

        // 空间不足：通知观察者并挂起整个队列
        UploadError::Local(LocalError::NotEnoughSpace) => {
            if let Ok(Some(record)) = deps.store.get(record_id) {
                deps.control.notify_not_enough_space(&record.file_name);
            }
            deps.control
                .suspend_all_operations(SuspendReason::NotEnoughSpace);
            record_failure(deps, record_id, error, true);
            true
        }

        // 身份变化与会话协议类：会话作废，需用户重新发起
        UploadError::Local(LocalError::FileIdentityChanged) | UploadError::Session(_) => {
            clean_session(deps, record_id).await;
            record_failure(deps, record_id, error, true);
            true
        }

        _ => false,
    }
}

/// 远端阶段错误处理
async fn handle_remote_errors(deps: &OperationDeps, record_id: &str, error: &UploadError) -> bool {
    let UploadError::Remote(remote) = error else {
        return false;
    };

    match remote {
        // 冲突未指定自动解决：致命，等用户决定
        RemoteError::FileAlreadyExists => {
            record_failure(deps, record_id, error, true);
            true
        }

        // 锁定/权限间隙/服务端瞬时错误：普通重试
        RemoteError::Lock
        | RemoteError::NotAuthorized
        | RemoteError::NetworkError
        | RemoteError::Server { .. } => {
            record_failure(deps, record_id, error, false);
            true
        }

        // 维护中：记录但不消耗预算，挂起整个队列等恢复
        RemoteError::ProductMaintenance | RemoteError::DriveMaintenance => {
            if let Err(e) = deps.store.with_record(record_id, &mut |r| r.set_error(error)) {
                warn!("记录维护错误失败: {}", e);
            }
            deps.control
                .suspend_all_operations(SuspendReason::Maintenance);
            true
        }

        // 配额耗尽：致命并挂起队列
        RemoteError::QuotaExceeded => {
            record_failure(deps, record_id, error, true);
            deps.control
                .suspend_all_operations(SuspendReason::QuotaExceeded);
            true
        }

        // 会话令牌失效：清会话后重试（下一轮从头重建会话）
        RemoteError::UploadNotTerminated | RemoteError::InvalidUploadToken => {
            clean_session(deps, record_id).await;
            record_failure(deps, record_id, error, false);
            true
        }

        // 主动取消会话的预期后果：只清进度，不算错误
        RemoteError::UploadTokenCanceled => {
            if let Err(e) = deps
                .store
                .with_record(record_id, &mut |r| r.clean_session())
            {
                warn!("清除已取消会话失败: {}", e);
            }
            true
        }

        // 目标目录失效：致命，并级联取消同目录操作
        RemoteError::ObjectNotFound
        | RemoteError::DestinationNotFound
        | RemoteError::DestinationNotWritable => {
            let snapshot = deps.store.get(record_id).ok().flatten();
            clean_session(deps, record_id).await;
            record_failure(deps, record_id, error, true);

            if let Some(record) = snapshot {
                deps.control.cancel_all_operations_with_parent(
                    record.parent_folder_id,
                    record.user_id,
                    record.drive_id,
                );
                // 照片自动备份的目标目录失效时停用自动备份
                if deps.control.photo_backup_parent() == Some(record.parent_folder_id) {
                    warn!(
                        "照片备份目标目录失效，停用自动备份: parent={}",
                        record.parent_folder_id
                    );
                    deps.control.disable_photo_backup();
                }
            }
            true
        }
    }
}

/// 在记录上登记失败
///
/// `fatal` 为 true 时清零重试预算并清除进度（需用户介入），
/// 否则消耗一次重试预算
fn record_failure(deps: &OperationDeps, record_id: &str, error: &UploadError, fatal: bool) {
    let result = deps.store.with_record(record_id, &mut |r| {
        r.set_error(error);
        if fatal {
            r.max_retry_count = 0;
            r.progress = None;
        } else {
            r.max_retry_count = r.max_retry_count.saturating_sub(1);
        }
    });
    if let Err(e) = result {
        warn!("记录失败状态出错: record={}, {}", record_id, e);
    }
}

/// 清除本地会话状态并尽力取消远端会话
async fn clean_session(deps: &OperationDeps, record_id: &str) {
    let mut stale_token: Option<SessionToken> = None;
    let result = deps.store.with_record(record_id, &mut |r| {
        stale_token = r.session.as_ref().map(|s| s.token.clone());
        r.clean_session();
    });
    if let Err(e) = result {
        warn!("清除会话状态失败: record={}, {}", record_id, e);
        return;
    }

    if let Some(token) = stale_token {
        if let Err(e) = deps.client.cancel_session(&token).await {
            debug!("取消远端会话失败（忽略）: token={}, {}", token, e);
        }
    }
}

/// 终态失败时的诊断快照
pub fn error_metadata(record: &UploadRecord, error: &UploadError) -> serde_json::Value {
    serde_json::json!({
        "record_id": record.id,
        "file_name": record.file_name,
        "user_id": record.user_id,
        "drive_id": record.drive_id,
        "parent_folder_id": record.parent_folder_id,
        "declared_size": record.declared_size,
        "progress": record.progress,
        "max_retry_count": record.max_retry_count,
        "owned_by_extension": record.owned_by_extension,
        "task_creation_date": record.task_creation_date,
        "error_kind": error.kind_label(),
        "error": error.to_string(),
        "session": record.session.as_ref().map(|s| serde_json::json!({
            // 令牌经 Display 截断，不进诊断日志
            "token": s.token.to_string(),
            "expires_at": s.expires_at,
            "total_chunks": s.total_chunks,
            "acked_chunks": s.acked_count(),
        })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::tests::{enqueue_record, harness};
    use crate::operation::UploadOperation;
    use crate::store::{UploadStore, DEFAULT_MAX_RETRY_COUNT};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_maintenance_suspends_without_budget_loss() {
        let h = harness(1024).await;
        let id = enqueue_record(&h).await;
        h.client
            .fail_next_start(UploadError::Remote(RemoteError::DriveMaintenance));

        let op = UploadOperation::new(id.clone(), h.deps.clone(), CancellationToken::new());
        assert!(matches!(op.run().await, OperationOutcome::Failed));

        assert_eq!(
            h.control.suspend_calls.lock().as_slice(),
            [SuspendReason::Maintenance]
        );
        let record = h.store.get(&id).unwrap().unwrap();
        // 维护是外部条件，不消耗重试预算
        assert_eq!(record.max_retry_count, DEFAULT_MAX_RETRY_COUNT);
        assert_eq!(record.error.unwrap().kind, "remote.maintenance");
    }

    #[tokio::test]
    async fn test_token_canceled_clears_session_without_error() {
        let h = harness(1024).await;
        let id = enqueue_record(&h).await;
        h.client
            .fail_chunk_once(1, UploadError::Remote(RemoteError::UploadTokenCanceled));

        let op = UploadOperation::new(id.clone(), h.deps.clone(), CancellationToken::new());
        assert!(matches!(op.run().await, OperationOutcome::Failed));

        let record = h.store.get(&id).unwrap().unwrap();
        assert!(record.session.is_none());
        assert!(record.progress.is_none());
        // 预期后果，不覆盖错误字段、不扣预算
        assert!(record.error.is_none());
        assert_eq!(record.max_retry_count, DEFAULT_MAX_RETRY_COUNT);
    }

    #[tokio::test]
    async fn test_conflict_is_fatal_without_queue_side_effects() {
        let h = harness(1024).await;
        let id = enqueue_record(&h).await;
        h.client
            .fail_next_start(UploadError::Remote(RemoteError::FileAlreadyExists));

        let op = UploadOperation::new(id.clone(), h.deps.clone(), CancellationToken::new());
        assert!(matches!(op.run().await, OperationOutcome::Failed));

        let record = h.store.get(&id).unwrap().unwrap();
        assert!(record.needs_user_attention());
        assert_eq!(record.error.unwrap().kind, "remote.conflict");
        assert!(h.control.suspend_calls.lock().is_empty());
        assert!(h.control.cancel_parent_calls.lock().is_empty());
    }

    #[test]
    fn test_error_metadata_shape() {
        let record = UploadRecord::new(
            7,
            8,
            9,
            std::path::PathBuf::from("/tmp/x.bin"),
            "x.bin".to_string(),
            42,
            100,
        );
        let error = UploadError::Remote(RemoteError::Lock);
        let payload = error_metadata(&record, &error);

        assert_eq!(payload["user_id"], 7);
        assert_eq!(payload["drive_id"], 8);
        assert_eq!(payload["file_name"], "x.bin");
        assert_eq!(payload["error_kind"], "remote.server");
        assert!(payload["session"].is_null());
    }

    #[tokio::test]
    async fn test_rescheduled_yields_without_failure() {
        let h = harness(1024).await;
        let id = enqueue_record(&h).await;
        h.client
            .fail_next_start(UploadError::Transport(TransportError::TaskRescheduled));

        let op = UploadOperation::new(id.clone(), h.deps.clone(), CancellationToken::new());
        // 让出调度不是终态失败
        assert!(matches!(op.run().await, OperationOutcome::Cancelled));

        let record = h.store.get(&id).unwrap().unwrap();
        assert_eq!(record.error.as_ref().unwrap().kind, "transport.rescheduled");
        assert_eq!(record.max_retry_count, DEFAULT_MAX_RETRY_COUNT);
        assert!(!record.needs_user_attention());
        assert!(h.control.diagnostics.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cascade_deleting_record_still_emits_diagnostic() {
        use crate::operation::{OperationDeps, QueueControl};
        use crate::store::{MemoryUploadStore, UploadStore};
        use parking_lot::Mutex;
        use std::sync::Arc;

        // 级联取消会把失败记录本身也删掉，诊断必须仍然发出
        struct CascadingControl {
            store: Arc<MemoryUploadStore>,
            diagnostics: Mutex<Vec<(String, serde_json::Value)>>,
        }

        impl QueueControl for CascadingControl {
            fn suspend_all_operations(&self, _reason: SuspendReason) {}

            fn cancel_all_operations_with_parent(&self, _parent: u64, _user: u64, _drive: u64) {
                for record in self.store.pending_records(&crate::store::PendingScope {
                    user_id: 1,
                    drive_id: 2,
                    owned_by_extension: false,
                })
                .unwrap()
                {
                    self.store.delete(&record.id).unwrap();
                }
            }

            fn notify_not_enough_space(&self, _file_name: &str) {}

            fn photo_backup_parent(&self) -> Option<u64> {
                None
            }

            fn disable_photo_backup(&self) {}

            fn is_suspended(&self) -> bool {
                false
            }

            fn emit_diagnostic(&self, record_id: &str, payload: serde_json::Value) {
                self.diagnostics
                    .lock()
                    .push((record_id.to_string(), payload));
            }
        }

        let h = harness(1024).await;
        let id = enqueue_record(&h).await;
        let control = Arc::new(CascadingControl {
            store: h.store.clone(),
            diagnostics: Mutex::new(Vec::new()),
        });
        h.client
            .fail_next_start(UploadError::Remote(RemoteError::DestinationNotFound));

        let deps = OperationDeps {
            control: control.clone(),
            ..h.deps.clone()
        };
        let op = UploadOperation::new(id.clone(), deps, CancellationToken::new());
        assert!(matches!(op.run().await, OperationOutcome::Failed));

        // 记录已被级联删除
        assert!(h.store.get(&id).unwrap().is_none());

        let diagnostics = control.diagnostics.lock();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].0, id);
        assert_eq!(diagnostics[0].1["error_kind"], "remote.destination_invalid");
    }

    #[tokio::test]
    async fn test_clean_session_cancels_remote() {
        let h = harness(1024).await;
        let id = enqueue_record(&h).await;

        // 先正常建立会话但提交失败，留下会话状态
        h.client
            .fail_next_close(UploadError::Transport(TransportError::Timeout));
        let op = UploadOperation::new(id.clone(), h.deps.clone(), CancellationToken::new());
        assert!(matches!(op.run().await, OperationOutcome::Failed));
        assert!(h.store.get(&id).unwrap().unwrap().session.is_some());

        clean_session(&h.deps, &id).await;
        assert!(h.store.get(&id).unwrap().unwrap().session.is_none());
        assert_eq!(h.client.cancel_call_count(), 1);
    }
}
