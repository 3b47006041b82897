// 单文件上传操作
//
// 状态机：待处理 → 校验 → 会话协商 → 分片传输 → 提交 → 完成
// 每个状态切换点都是挂起点：重新从存储取记录、检查取消令牌，
// 操作不跨挂起点持有记录快照

pub mod error;

pub use error::error_metadata;

use crate::api::{
    validate_start_session, RemoteFile, SessionClient, StartSessionRequest, SessionToken,
};
use crate::chunk::{plan_chunks, read_file_identity, FileIdentity};
use crate::error::{
    LocalError, QueueStateError, SessionError, TransportError, UploadError,
};
use crate::events::SuspendReason;
use crate::space::{FreeSpaceService, StorageIssue};
use crate::store::{ChunkTask, UploadRecord, UploadSessionState, UploadStore};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 重试退避基准
const RETRY_BASE_DELAY_MS: u64 = 500;
/// 重试退避上限
const RETRY_MAX_DELAY_MS: u64 = 30_000;

/// 指数退避延迟：500ms 起，每次翻倍，上限 30s，±20% 抖动
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE_DELAY_MS
        .saturating_mul(1u64 << attempt.min(16))
        .min(RETRY_MAX_DELAY_MS);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((exp as f64 * jitter) as u64)
}

/// 操作对队列的回调接口
///
/// 错误处理需要触发队列级动作（挂起、级联取消、通知），
/// 通过该接口显式注入，操作不持有队列本体
pub trait QueueControl: Send + Sync {
    /// 按原因挂起整个队列
    fn suspend_all_operations(&self, reason: SuspendReason);

    /// 级联取消同父目录下的其它操作（目标目录失效时）
    fn cancel_all_operations_with_parent(&self, parent_folder_id: u64, user_id: u64, drive_id: u64);

    /// 空间不足通知
    fn notify_not_enough_space(&self, file_name: &str);

    /// 当前照片自动备份目标目录
    fn photo_backup_parent(&self) -> Option<u64>;

    /// 停用照片自动备份（目标目录失效时）
    fn disable_photo_backup(&self);

    /// 队列当前是否挂起（显式或网络原因）
    ///
    /// 兄弟操作触发的队列级挂起要能截停在途操作的后续分片调度
    fn is_suspended(&self) -> bool;

    /// 发出操作诊断事件
    fn emit_diagnostic(&self, record_id: &str, payload: serde_json::Value);
}

/// 操作依赖集合
#[derive(Clone)]
pub struct OperationDeps {
    pub store: Arc<dyn UploadStore>,
    pub client: Arc<dyn SessionClient>,
    pub free_space: Arc<FreeSpaceService>,
    pub control: Arc<dyn QueueControl>,
    /// 队列级共享的分片并发预算
    pub chunk_semaphore: Arc<Semaphore>,
    /// 单个分片的传输层重试次数
    pub chunk_retries: u32,
}

/// 操作结果
#[derive(Debug, Clone)]
pub enum OperationOutcome {
    /// 上传完成；`remote_file` 为关闭会话返回的远端文件句柄
    Completed { remote_file: RemoteFile },
    /// 终态失败，错误已记录到持久化记录
    Failed,
    /// 静默结束（取消/记录消失/已完成/让出重调度），不产生事件
    Cancelled,
}

/// 单文件上传操作
pub struct UploadOperation {
    record_id: String,
    deps: OperationDeps,
    cancel_token: CancellationToken,
}

impl UploadOperation {
    pub fn new(record_id: String, deps: OperationDeps, cancel_token: CancellationToken) -> Self {
        Self {
            record_id,
            deps,
            cancel_token,
        }
    }

    /// 执行上传，直到终态
    pub async fn run(&self) -> OperationOutcome {
        debug!("上传操作开始: {}", self.record_id);

        match self.execute().await {
            Ok(remote_file) => {
                info!(
                    "上传完成: record={}, remote_id={}",
                    self.record_id, remote_file.id
                );
                OperationOutcome::Completed { remote_file }
            }
            Err(e) => error::catching(&self.deps, &self.record_id, e).await,
        }
    }

    /// 取消检查（挂起点）
    fn checkpoint(&self) -> Result<(), UploadError> {
        if self.cancel_token.is_cancelled() {
            Err(UploadError::Queue(QueueStateError::OperationCancelled))
        } else {
            Ok(())
        }
    }

    fn fetch_record(&self) -> Result<UploadRecord, UploadError> {
        self.deps
            .store
            .get(&self.record_id)?
            .ok_or(UploadError::Queue(QueueStateError::RecordVanished))
    }

    async fn execute(&self) -> Result<RemoteFile, UploadError> {
        // 校验
        self.checkpoint()?;
        let record = self.fetch_record()?;
        if record.upload_date.is_some() {
            return Err(UploadError::Queue(QueueStateError::OperationFinished));
        }
        if record.needs_user_attention() {
            return Err(UploadError::Session(SessionError::RetryCountIsZero));
        }

        let identity = read_file_identity(&record.source_path).await?;
        if identity != record.declared_identity() {
            debug!(
                "源文件身份变化: record={}, declared={:?}, current={:?}",
                self.record_id,
                record.declared_identity(),
                identity
            );
            return Err(UploadError::Local(LocalError::FileIdentityChanged));
        }

        // 会话协商
        self.checkpoint()?;
        let session = self.ensure_session(&record, identity).await?;

        // 分片传输
        self.checkpoint()?;
        self.transfer_chunks(&session, &record.source_path).await?;

        // 提交：所有分片确认落盘后才允许关闭会话
        self.checkpoint()?;
        let record = self.fetch_record()?;
        let session = record
            .session
            .ok_or(UploadError::Session(SessionError::TaskMissing))?;
        if !session.all_chunks_acked() {
            return Err(UploadError::Session(SessionError::Invalid));
        }

        let remote_file = self.deps.client.close_session(&session.token).await?;

        let now = chrono::Utc::now().timestamp();
        self.deps.store.with_record(&self.record_id, &mut |r| {
            r.upload_date = Some(now);
            r.progress = Some(1.0);
            r.error = None;
            r.session = None;
        })?;

        Ok(remote_file)
    }

    /// 复用可续传的会话，否则废弃重建
    async fn ensure_session(
        &self,
        record: &UploadRecord,
        identity: FileIdentity,
    ) -> Result<UploadSessionState, UploadError> {
        let now = chrono::Utc::now().timestamp();

        if let Some(session) = &record.session {
            if !session.is_expired(now) && session.file_identity_matches(&identity) {
                info!(
                    "复用上传会话: record={}, token={}, 已确认 {}/{}",
                    self.record_id,
                    session.token,
                    session.acked_count(),
                    session.total_chunks
                );
                return Ok(session.clone());
            }

            // 会话失效：本地清除后尽力取消远端会话
            warn!(
                "上传会话失效（过期或源文件已变化），废弃重建: record={}, token={}",
                self.record_id, session.token
            );
            let stale_token = session.token.clone();
            self.deps
                .store
                .with_record(&self.record_id, &mut |r| r.clean_session())?;
            if let Err(e) = self.deps.client.cancel_session(&stale_token).await {
                debug!("取消失效会话失败（忽略）: {}", e);
            }
        }

        // 新会话前的空间准入
        if let Err(issue) = self
            .deps
            .free_space
            .check_enough_available_space_for_chunk_upload()
        {
            match issue {
                StorageIssue::NotEnoughSpace => {
                    return Err(UploadError::Local(LocalError::NotEnoughSpace))
                }
                // 容量无法评估时放行，不因估算问题阻塞上传
                other => warn!("可用空间评估失败，跳过准入检查: {}", other),
            }
        }

        let plan = plan_chunks(identity.size)?;
        let request = StartSessionRequest {
            drive_id: record.drive_id,
            total_size: identity.size,
            file_name: record.file_name.clone(),
            total_chunks: plan.total_chunks(),
            conflict: record.conflict,
            created_at: Some(record.created_at),
            last_modified_at: Some(record.modified_at),
            directory_id: Some(record.parent_folder_id),
            directory_path: None,
            file_id: None,
        };
        // 参数校验先于任何网络调用
        validate_start_session(&request)?;

        self.checkpoint()?;
        let data = self.deps.client.start_session(request).await?;
        info!(
            "上传会话已开启: record={}, token={}, 分片数={}",
            self.record_id,
            data.token,
            plan.total_chunks()
        );

        let chunk_tasks: Vec<ChunkTask> = plan
            .ranges
            .iter()
            .enumerate()
            .map(|(i, range)| ChunkTask {
                chunk_number: i as u64 + 1,
                range_start: *range.start(),
                range_end: *range.end(),
                ack: None,
                error: None,
            })
            .collect();
        let session = UploadSessionState {
            token: data.token,
            expires_at: data.expires_at,
            total_chunks: plan.total_chunks(),
            chunk_size: plan.chunk_size,
            file_identity: identity,
            chunk_tasks,
        };

        let session_for_store = session.clone();
        self.deps.store.with_record(&self.record_id, &mut |r| {
            r.session = Some(session_for_store.clone());
            r.progress = Some(0.0);
        })?;

        Ok(session)
    }

    /// 分片扇出传输
    ///
    /// 并发度由队列级共享信号量限制；任一分片终态失败后
    /// 停止调度新分片，等在途分片收尾，返回首个错误
    async fn transfer_chunks(
        &self,
        session: &UploadSessionState,
        source: &Path,
    ) -> Result<(), UploadError> {
        let remaining = session.remaining_chunks();
        if remaining.is_empty() {
            return Ok(());
        }
        info!(
            "分片传输开始: record={}, 剩余 {}/{}",
            self.record_id,
            remaining.len(),
            session.total_chunks
        );

        let mut join_set: JoinSet<Result<u64, UploadError>> = JoinSet::new();
        let mut first_error: Option<UploadError> = None;

        for task in remaining {
            if self.cancel_token.is_cancelled() {
                break;
            }
            // 队列被挂起时不再调度新分片，让出等重新调度；
            // 已确认的分片留在会话里，恢复后续传
            if self.deps.control.is_suspended() {
                first_error = Some(UploadError::Transport(TransportError::TaskRescheduled));
                break;
            }
            // 先消化已完成的分片结果，失败后立即停止调度
            while let Some(result) = join_set.try_join_next() {
                Self::collect_chunk_result(result, &mut first_error);
            }
            if first_error.is_some() {
                break;
            }

            let permit = match self.deps.chunk_semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                // 信号量关闭等同队列关停
                Err(_) => {
                    first_error = Some(UploadError::Transport(TransportError::Cancelled));
                    break;
                }
            };

            let worker = ChunkWorker {
                store: self.deps.store.clone(),
                client: self.deps.client.clone(),
                record_id: self.record_id.clone(),
                token: session.token.clone(),
                source: source.to_path_buf(),
                task,
                retries: self.deps.chunk_retries,
                cancel_token: self.cancel_token.clone(),
            };
            join_set.spawn(async move {
                let _permit = permit;
                worker.run().await
            });
        }

        // 等在途分片收尾
        while let Some(result) = join_set.join_next().await {
            Self::collect_chunk_result(result, &mut first_error);
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        self.checkpoint()?;
        Ok(())
    }

    fn collect_chunk_result(
        result: Result<Result<u64, UploadError>, tokio::task::JoinError>,
        first_error: &mut Option<UploadError>,
    ) {
        match result {
            Ok(Ok(chunk_number)) => {
                debug!("分片已确认: #{}", chunk_number);
            }
            Ok(Err(e)) => {
                if first_error.is_none() {
                    *first_error = Some(e);
                }
            }
            Err(join_error) => {
                if first_error.is_none() {
                    *first_error = Some(UploadError::Transport(TransportError::Network {
                        message: format!("分片任务异常退出: {}", join_error),
                    }));
                }
            }
        }
    }
}

/// 单分片传输任务
struct ChunkWorker {
    store: Arc<dyn UploadStore>,
    client: Arc<dyn SessionClient>,
    record_id: String,
    token: SessionToken,
    source: PathBuf,
    task: ChunkTask,
    retries: u32,
    cancel_token: CancellationToken,
}

impl ChunkWorker {
    async fn run(self) -> Result<u64, UploadError> {
        let result = self.transfer().await;
        if let Err(e) = &result {
            // 终态分片错误回写到任务表
            let chunk_number = self.task.chunk_number;
            let message = e.to_string();
            let _ = self.store.with_record(&self.record_id, &mut |r| {
                if let Some(session) = r.session.as_mut() {
                    if let Some(t) = session
                        .chunk_tasks
                        .iter_mut()
                        .find(|t| t.chunk_number == chunk_number)
                    {
                        t.error = Some(message.clone());
                    }
                }
            });
        }
        result
    }

    async fn transfer(&self) -> Result<u64, UploadError> {
        let bytes = read_chunk(&self.source, &self.task).await?;
        let hash = hex::encode(Sha256::digest(&bytes));

        let mut attempt = 0u32;
        loop {
            if self.cancel_token.is_cancelled() {
                return Err(UploadError::Transport(TransportError::Cancelled));
            }

            match self
                .client
                .append_chunk(&self.token, self.task.chunk_number, &hash, bytes.clone())
                .await
            {
                Ok(ack) => {
                    // 确认立即落盘，进程被杀后可从断点续传
                    let mut ack_error = None;
                    self.store.with_record(&self.record_id, &mut |r| {
                        if let Some(session) = r.session.as_mut() {
                            match session.record_ack(ack.clone()) {
                                Ok(()) => {
                                    r.progress = Some(
                                        session.acked_count() as f64
                                            / session.total_chunks.max(1) as f64,
                                    );
                                }
                                Err(e) => ack_error = Some(e),
                            }
                        } else {
                            ack_error =
                                Some(UploadError::Session(SessionError::TaskMissing));
                        }
                    })?;
                    if let Some(e) = ack_error {
                        return Err(e);
                    }
                    return Ok(self.task.chunk_number);
                }
                Err(e) if is_transient(&e) && attempt < self.retries => {
                    attempt += 1;
                    let delay = backoff_delay(attempt);
                    warn!(
                        "分片 #{} 传输失败，{}ms 后重试（第 {} 次）: {}",
                        self.task.chunk_number,
                        delay.as_millis(),
                        attempt,
                        e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel_token.cancelled() => {
                            return Err(UploadError::Transport(TransportError::Cancelled));
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_transient(error: &UploadError) -> bool {
    matches!(
        error,
        UploadError::Transport(TransportError::Timeout)
            | UploadError::Transport(TransportError::Network { .. })
    )
}

/// 读取文件的指定字节区间
async fn read_chunk(path: &Path, task: &ChunkTask) -> Result<Vec<u8>, UploadError> {
    let mut file = tokio::fs::File::open(path).await.map_err(|_| {
        UploadError::Local(LocalError::FileNotFound {
            path: path.to_path_buf(),
        })
    })?;

    file.seek(SeekFrom::Start(task.range_start))
        .await
        .map_err(|e| {
            UploadError::Transport(TransportError::Network {
                message: format!("定位分片失败: {}", e),
            })
        })?;

    let mut bytes = vec![0u8; task.size() as usize];
    file.read_exact(&mut bytes).await.map_err(|e| {
        UploadError::Transport(TransportError::Network {
            message: format!("读取分片失败: {}", e),
        })
    })?;

    Ok(bytes)
}
