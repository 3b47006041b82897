// 上传队列
//
// 围绕持久化存储的编排层：持久化记录是唯一事实来源，
// 队列只负责准入（同一记录最多一个在途操作）、并发控制、
// 挂起/恢复与事件广播。进程重启后从存储重建，不丢队列

pub mod parallelism;

pub use parallelism::{
    recommended_parallelism, DeviceConditions, NetworkClass, DEFAULT_PARALLELISM_CEILING,
};

use crate::api::{ChunkAck, SessionClient, SessionToken};
use crate::events::{Coalescer, SuspendReason, SystemClock, UploadEvent};
use crate::operation::{OperationDeps, OperationOutcome, QueueControl, UploadOperation};
use crate::space::FreeSpaceService;
use crate::store::{PendingScope, StoreError, UploadRecord, UploadStore};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 进程挂起期间由系统后台会话完成的分片传输
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub session_token: SessionToken,
    pub ack: ChunkAck,
}

/// 后台传输清单
///
/// 由宿主在进程恢复时提供，按会话令牌归队到对应记录
pub trait BackgroundTransferInventory: Send + Sync {
    fn completed_transfers(&self) -> Vec<CompletedTransfer>;
}

/// 队列选项
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// 队列服务的记录范围
    pub scope: PendingScope,
    /// 文件级并发上限
    pub parallelism_ceiling: usize,
    /// 全队列共享的分片并发预算
    pub chunk_parallelism: usize,
    /// 单个分片的传输层重试次数
    pub chunk_retries: u32,
    /// 计数事件节流间隔
    pub count_throttle_ms: u64,
    /// 仅限 Wi-Fi 上传
    pub wifi_only: bool,
    /// 调度器兜底轮询间隔
    pub scheduler_tick_ms: u64,
}

impl QueueOptions {
    pub fn for_scope(scope: PendingScope) -> Self {
        Self {
            scope,
            parallelism_ceiling: DEFAULT_PARALLELISM_CEILING,
            chunk_parallelism: 6,
            chunk_retries: 3,
            count_throttle_ms: 1000,
            wifi_only: false,
            scheduler_tick_ms: 250,
        }
    }
}

struct OperationHandle {
    cancel: CancellationToken,
}

struct QueueShared {
    store: Arc<dyn UploadStore>,
    client: Arc<dyn SessionClient>,
    free_space: Arc<FreeSpaceService>,
    options: QueueOptions,
    /// 在途操作注册表：同一记录 id 最多一个
    operations: DashMap<String, OperationHandle>,
    chunk_semaphore: Arc<Semaphore>,
    explicitly_suspended: AtomicBool,
    network_suspended: AtomicBool,
    wifi_only: AtomicBool,
    parallelism: AtomicUsize,
    events_tx: broadcast::Sender<UploadEvent>,
    wake: Notify,
    /// 计数事件节流闸门
    count_gate: Coalescer<()>,
    dirty_parents: Mutex<HashSet<u64>>,
    photo_backup_parent: Mutex<Option<u64>>,
    shutdown: CancellationToken,
}

impl QueueShared {
    fn is_suspended(&self) -> bool {
        self.explicitly_suspended.load(Ordering::SeqCst)
            || self.network_suspended.load(Ordering::SeqCst)
    }

    fn emit(&self, event: UploadEvent) {
        // 无订阅者时发送失败，属正常情况
        let _ = self.events_tx.send(event);
    }

    fn mark_counts_dirty(&self, parent_folder_id: u64) {
        self.dirty_parents.lock().insert(parent_folder_id);
        if self.count_gate.offer(()).is_some() {
            self.emit_count_events();
        }
    }

    fn flush_pending_counts(&self) {
        if self.count_gate.poll().is_some() {
            self.emit_count_events();
        }
    }

    fn emit_count_events(&self) {
        let parents: Vec<u64> = self.dirty_parents.lock().drain().collect();
        if parents.is_empty() {
            return;
        }

        let scope = &self.options.scope;
        for parent_folder_id in parents {
            match self.store.pending_in_parent(scope, parent_folder_id) {
                Ok(records) => self.emit(UploadEvent::UploadCountInParentChanged {
                    parent_folder_id,
                    user_id: scope.user_id,
                    drive_id: scope.drive_id,
                    pending: records.len(),
                }),
                Err(e) => warn!("查询父目录待上传数失败: {}", e),
            }
        }

        match self.store.pending_records(scope) {
            Ok(records) => self.emit(UploadEvent::UploadCountInDriveChanged {
                user_id: scope.user_id,
                drive_id: scope.drive_id,
                pending: records.len(),
            }),
            Err(e) => warn!("查询云盘待上传数失败: {}", e),
        }
    }

    /// 调度一轮：按并发上限补齐在途操作
    fn schedule_pending(self: &Arc<Self>) -> Result<(), StoreError> {
        let limit = self.parallelism.load(Ordering::SeqCst).max(1);
        let pending = self.store.pending_records(&self.options.scope)?;

        for record in pending {
            if self.operations.len() >= limit {
                break;
            }
            // 预算耗尽且带错误的记录等用户处理
            if record.needs_user_attention() {
                continue;
            }
            self.spawn_operation(record);
        }
        Ok(())
    }

    fn spawn_operation(self: &Arc<Self>, record: UploadRecord) {
        use dashmap::mapref::entry::Entry;

        // 检查并注册必须是同一个原子步骤
        let token = match self.operations.entry(record.id.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(vacant) => {
                let token = CancellationToken::new();
                vacant.insert(OperationHandle {
                    cancel: token.clone(),
                });
                token
            }
        };

        debug!("调度上传操作: record={}", record.id);
        let shared = self.clone();
        tokio::spawn(async move {
            shared.run_operation(record, token).await;
        });
    }

    async fn run_operation(self: Arc<Self>, record: UploadRecord, token: CancellationToken) {
        let deps = OperationDeps {
            store: self.store.clone(),
            client: self.client.clone(),
            free_space: self.free_space.clone(),
            control: self.clone(),
            chunk_semaphore: self.chunk_semaphore.clone(),
            chunk_retries: self.options.chunk_retries,
        };

        let operation = UploadOperation::new(record.id.clone(), deps, token);
        let outcome = operation.run().await;
        self.operations.remove(&record.id);

        match outcome {
            OperationOutcome::Completed { remote_file } => {
                // 先广播完成事件，观察者消费后才删除记录
                self.emit(UploadEvent::FileUploaded {
                    record_id: record.id.clone(),
                    file_name: record.file_name.clone(),
                    parent_folder_id: record.parent_folder_id,
                    drive_id: record.drive_id,
                    remote_file: Some(remote_file),
                });
                if let Err(e) = self.store.delete(&record.id) {
                    warn!("删除已完成记录失败: record={}, {}", record.id, e);
                }
            }
            // 终态失败也发完成事件，remote_file 为空；记录保留待重试或用户处理
            OperationOutcome::Failed => {
                self.emit(UploadEvent::FileUploaded {
                    record_id: record.id.clone(),
                    file_name: record.file_name.clone(),
                    parent_folder_id: record.parent_folder_id,
                    drive_id: record.drive_id,
                    remote_file: None,
                });
            }
            OperationOutcome::Cancelled => {}
        }

        self.mark_counts_dirty(record.parent_folder_id);
        self.wake.notify_one();
    }

    fn suspend(&self, reason: SuspendReason) {
        let was_suspended = self.is_suspended();
        self.explicitly_suspended.store(true, Ordering::SeqCst);
        if !was_suspended {
            info!("队列已挂起: {:?}", reason);
            self.emit(UploadEvent::QueueSuspended { reason });
        }
    }

    /// 级联取消：取消在途操作并删除同父目录下的待上传记录
    fn cancel_records_in_parent(&self, parent_folder_id: u64, user_id: u64, drive_id: u64) {
        let scope = PendingScope {
            user_id,
            drive_id,
            owned_by_extension: self.options.scope.owned_by_extension,
        };
        let records = match self.store.pending_in_parent(&scope, parent_folder_id) {
            Ok(records) => records,
            Err(e) => {
                warn!("级联取消时查询记录失败: {}", e);
                return;
            }
        };
        if records.is_empty() {
            return;
        }

        info!(
            "级联取消父目录 {} 下 {} 条上传",
            parent_folder_id,
            records.len()
        );
        for record in records {
            if let Some((_, handle)) = self.operations.remove(&record.id) {
                handle.cancel.cancel();
            }
            if let Some(session) = &record.session {
                // 尽力释放远端会话
                let client = self.client.clone();
                let token = session.token.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.cancel_session(&token).await {
                        debug!("取消远端会话失败（忽略）: {}", e);
                    }
                });
            }
            if let Err(e) = self.store.delete(&record.id) {
                warn!("删除被级联取消的记录失败: record={}, {}", record.id, e);
            }
        }
        self.mark_counts_dirty(parent_folder_id);
    }
}

impl QueueControl for QueueShared {
    fn suspend_all_operations(&self, reason: SuspendReason) {
        self.suspend(reason);
    }

    fn cancel_all_operations_with_parent(&self, parent_folder_id: u64, user_id: u64, drive_id: u64) {
        self.cancel_records_in_parent(parent_folder_id, user_id, drive_id);
    }

    fn notify_not_enough_space(&self, file_name: &str) {
        self.emit(UploadEvent::NotEnoughSpace {
            file_name: file_name.to_string(),
        });
    }

    fn photo_backup_parent(&self) -> Option<u64> {
        *self.photo_backup_parent.lock()
    }

    fn disable_photo_backup(&self) {
        if let Some(parent_folder_id) = self.photo_backup_parent.lock().take() {
            self.emit(UploadEvent::PhotoBackupDisabled { parent_folder_id });
        }
    }

    fn is_suspended(&self) -> bool {
        self.explicitly_suspended.load(Ordering::SeqCst)
            || self.network_suspended.load(Ordering::SeqCst)
    }

    fn emit_diagnostic(&self, record_id: &str, payload: serde_json::Value) {
        self.emit(UploadEvent::OperationDiagnostic {
            record_id: record_id.to_string(),
            payload,
        });
    }
}

/// 上传队列
pub struct UploadQueue {
    shared: Arc<QueueShared>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl UploadQueue {
    pub fn new(
        store: Arc<dyn UploadStore>,
        client: Arc<dyn SessionClient>,
        free_space: Arc<FreeSpaceService>,
        options: QueueOptions,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        let shared = Arc::new(QueueShared {
            store,
            client,
            free_space,
            chunk_semaphore: Arc::new(Semaphore::new(options.chunk_parallelism.max(1))),
            parallelism: AtomicUsize::new(options.parallelism_ceiling.max(1)),
            wifi_only: AtomicBool::new(options.wifi_only),
            count_gate: Coalescer::new(options.count_throttle_ms, Arc::new(SystemClock::new())),
            options,
            operations: DashMap::new(),
            explicitly_suspended: AtomicBool::new(false),
            network_suspended: AtomicBool::new(false),
            events_tx,
            wake: Notify::new(),
            dirty_parents: Mutex::new(HashSet::new()),
            photo_backup_parent: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        Self {
            shared,
            scheduler: Mutex::new(None),
        }
    }

    /// 启动调度循环（需在 tokio 运行时内调用）
    pub fn start(&self) {
        let mut guard = self.scheduler.lock();
        if guard.is_some() {
            return;
        }

        let shared = self.shared.clone();
        *guard = Some(tokio::spawn(async move {
            let tick = Duration::from_millis(shared.options.scheduler_tick_ms.max(10));
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = shared.wake.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                }

                shared.flush_pending_counts();
                if shared.is_suspended() {
                    continue;
                }
                if let Err(e) = shared.schedule_pending() {
                    warn!("调度待上传记录失败: {}", e);
                }
            }
            debug!("队列调度循环退出");
        }));
    }

    /// 订阅队列事件
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.shared.events_tx.subscribe()
    }

    /// 入队一条上传记录
    ///
    /// 按记录 id 幂等：重复入队不会产生第二个操作
    pub fn enqueue(&self, record: UploadRecord) -> Result<String, StoreError> {
        let id = record.id.clone();
        let parent_folder_id = record.parent_folder_id;

        let inserted = self.shared.store.insert(record)?;
        if inserted {
            debug!("入队: record={}", id);
        } else {
            debug!("记录已在队列中，跳过: record={}", id);
        }

        self.shared.mark_counts_dirty(parent_folder_id);
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// 从持久化存储重建队列
    ///
    /// 崩溃或重启后调用：所有未完成记录重新进入调度，
    /// 非过期会话中已确认的分片不会重传
    pub fn rebuild_from_durable_store(&self) -> Result<usize, StoreError> {
        let pending = self.shared.store.pending_records(&self.shared.options.scope)?;
        info!("从存储重建上传队列: {} 条待上传记录", pending.len());

        for record in &pending {
            self.shared.mark_counts_dirty(record.parent_folder_id);
        }
        self.shared.wake.notify_one();
        Ok(pending.len())
    }

    /// 用户显式暂停
    pub fn suspend_all_operations(&self) {
        self.shared.suspend(SuspendReason::Explicit);
    }

    /// 解除显式暂停（网络挂起仍然生效）
    pub fn resume_all_operations(&self) {
        self.shared
            .explicitly_suspended
            .store(false, Ordering::SeqCst);
        if !self.shared.is_suspended() {
            info!("队列已恢复");
            self.shared.emit(UploadEvent::QueueResumed);
            self.shared.wake.notify_one();
        }
    }

    /// 是否处于挂起状态（显式或网络原因）
    pub fn is_suspended(&self) -> bool {
        self.shared.is_suspended()
    }

    /// 仅限 Wi-Fi 开关
    pub fn set_wifi_only(&self, wifi_only: bool) {
        self.shared.wifi_only.store(wifi_only, Ordering::SeqCst);
    }

    /// 设备状态变化：更新网络挂起与并发度
    pub fn update_device_conditions(&self, conditions: &DeviceConditions) {
        let wifi_only = self.shared.wifi_only.load(Ordering::SeqCst);
        let network_suspended = match conditions.network {
            NetworkClass::Offline => true,
            NetworkClass::Cellular => wifi_only,
            NetworkClass::Wifi => false,
        };

        let was_suspended = self.shared.is_suspended();
        self.shared
            .network_suspended
            .store(network_suspended, Ordering::SeqCst);
        let recommended = recommended_parallelism(
            self.shared.options.parallelism_ceiling,
            conditions,
        );
        self.shared
            .parallelism
            .store(recommended, Ordering::SeqCst);
        debug!(
            "设备状态更新: network={:?}, 并发度={}, 网络挂起={}",
            conditions.network, recommended, network_suspended
        );

        let now_suspended = self.shared.is_suspended();
        match (was_suspended, now_suspended) {
            (false, true) => self.shared.emit(UploadEvent::QueueSuspended {
                reason: SuspendReason::Network,
            }),
            (true, false) => {
                self.shared.emit(UploadEvent::QueueResumed);
                self.shared.wake.notify_one();
            }
            _ => {}
        }
    }

    /// 当前生效的文件级并发度
    pub fn current_parallelism(&self) -> usize {
        self.shared.parallelism.load(Ordering::SeqCst)
    }

    /// 用户取消单条上传：终止操作、释放远端会话并删除记录
    pub fn cancel_upload(&self, record_id: &str) -> Result<(), StoreError> {
        if let Some((_, handle)) = self.shared.operations.remove(record_id) {
            handle.cancel.cancel();
        }

        if let Some(record) = self.shared.store.get(record_id)? {
            if let Some(session) = &record.session {
                let client = self.shared.client.clone();
                let token = session.token.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.cancel_session(&token).await {
                        debug!("取消远端会话失败（忽略）: {}", e);
                    }
                });
            }
            self.shared.store.delete(record_id)?;
            self.shared.mark_counts_dirty(record.parent_folder_id);
        }
        Ok(())
    }

    /// 级联取消指定父目录下的全部上传
    pub fn cancel_all_operations(&self, parent_folder_id: u64, user_id: u64, drive_id: u64) {
        self.shared
            .cancel_records_in_parent(parent_folder_id, user_id, drive_id);
    }

    /// 手动重试：清除错误、恢复预算并重新调度
    pub fn retry(&self, record_id: &str) -> Result<(), StoreError> {
        let record = self
            .shared
            .store
            .with_record(record_id, &mut |r| r.reset_for_retry())?;
        self.shared.mark_counts_dirty(record.parent_folder_id);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// 指定父目录下的待上传数
    pub fn pending_count_in_parent(&self, parent_folder_id: u64) -> Result<usize, StoreError> {
        Ok(self
            .shared
            .store
            .pending_in_parent(&self.shared.options.scope, parent_folder_id)?
            .len())
    }

    /// 全队列待上传数
    pub fn pending_count(&self) -> Result<usize, StoreError> {
        Ok(self
            .shared
            .store
            .pending_records(&self.shared.options.scope)?
            .len())
    }

    /// 照片自动备份目标目录
    pub fn set_photo_backup_parent(&self, parent_folder_id: Option<u64>) {
        *self.shared.photo_backup_parent.lock() = parent_folder_id;
    }

    /// 归队进程挂起期间完成的后台分片传输
    pub fn reattach_background_transfers(
        &self,
        inventory: &dyn BackgroundTransferInventory,
    ) -> usize {
        let mut reattached = 0usize;

        for transfer in inventory.completed_transfers() {
            match self
                .shared
                .store
                .find_by_session_token(&transfer.session_token.0)
            {
                Ok(Some(record)) => {
                    let ack = transfer.ack.clone();
                    let result = self.shared.store.with_record(&record.id, &mut |r| {
                        if let Some(session) = r.session.as_mut() {
                            if session.record_ack(ack.clone()).is_ok() {
                                r.progress = Some(
                                    session.acked_count() as f64
                                        / session.total_chunks.max(1) as f64,
                                );
                            }
                        }
                    });
                    match result {
                        Ok(_) => {
                            debug!(
                                "后台分片已归队: record={}, chunk=#{}",
                                record.id, transfer.ack.chunk_number
                            );
                            reattached += 1;
                        }
                        Err(e) => warn!("归队后台分片失败: {}", e),
                    }
                }
                Ok(None) => debug!(
                    "后台传输无对应记录，忽略: token={}",
                    transfer.session_token
                ),
                Err(e) => warn!("按会话令牌查询记录失败: {}", e),
            }
        }

        if reattached > 0 {
            info!("已归队 {} 个后台分片", reattached);
            self.shared.wake.notify_one();
        }
        reattached
    }

    /// 缓存一致性巡检（前台激活或周期触发）
    pub fn audit_cache(&self) {
        match self.shared.store.uploading_source_paths() {
            Ok(paths) => self.shared.free_space.audit_cache(&paths),
            Err(e) => warn!("读取上传中的源文件列表失败: {}", e),
        }
    }

    /// 关停队列：停止调度、取消在途操作并补发积压的计数事件
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        for entry in self.shared.operations.iter() {
            entry.value().cancel.cancel();
        }
        if self.shared.count_gate.flush().is_some() {
            self.shared.emit_count_events();
        }
        if let Some(handle) = self.scheduler.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for UploadQueue {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
