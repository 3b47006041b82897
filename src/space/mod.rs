// 本地暂存空间准入控制
//
// 分片上传开始前检查暂存卷剩余空间，空间临界时触发缓存清理：
// - 最小需求 = max(4, CPU核数) * 50MiB * 1.2（20% 余量）
// - 空间不足属于致命并挂起整个队列的条件，由操作层处理
// - audit_cache 负责孤儿文件清理与临界清空，可在前台激活时周期调用

use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::Disks;
use thiserror::Error;
use tracing::{error, info, warn};

/// 单个分片占用的暂存空间上限（与最大分片大小一致）
const SCRATCH_PER_CHUNK: u64 = 50 * 1024 * 1024;

/// 存储问题
#[derive(Debug, Error)]
pub enum StorageIssue {
    /// 空间不足，无法执行指定操作
    #[error("暂存空间不足")]
    NotEnoughSpace,
    /// 平台无法报告可用容量
    #[error("无法估算可用空间")]
    UnableToEstimate,
    /// 底层 I/O 错误
    #[error("读取可用空间失败: {0}")]
    Unavailable(#[source] std::io::Error),
}

/// 存储卷容量查询
///
/// 报告指定路径所在卷的可用字节数
pub trait VolumeCapacity: Send + Sync {
    fn available_capacity(&self, path: &Path) -> Result<u64, StorageIssue>;
}

/// 基于 sysinfo 的卷容量查询
pub struct SysinfoVolume;

impl VolumeCapacity for SysinfoVolume {
    fn available_capacity(&self, path: &Path) -> Result<u64, StorageIssue> {
        let disks = Disks::new_with_refreshed_list();

        // 取挂载点为路径前缀的磁盘中最长匹配者
        let mut best: Option<(usize, u64)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if path.starts_with(mount) {
                let depth = mount.components().count();
                if best.map(|(d, _)| depth >= d).unwrap_or(true) {
                    best = Some((depth, disk.available_space()));
                }
            }
        }

        match best {
            Some((_, available)) => Ok(available),
            None => Err(StorageIssue::UnableToEstimate),
        }
    }
}

/// 固定容量查询（测试用）
pub struct FixedCapacity(pub u64);

impl VolumeCapacity for FixedCapacity {
    fn available_capacity(&self, _path: &Path) -> Result<u64, StorageIssue> {
        Ok(self.0)
    }
}

/// 暂存空间服务
#[derive(Clone)]
pub struct FreeSpaceService {
    /// 卷容量查询实现
    volume: Arc<dyn VolumeCapacity>,
    /// 暂存目录（分片临时数据）
    scratch_dir: PathBuf,
    /// 导入目录（排队文件的暂存副本）
    import_dir: PathBuf,
}

impl FreeSpaceService {
    pub fn new(volume: Arc<dyn VolumeCapacity>, scratch_dir: PathBuf, import_dir: PathBuf) -> Self {
        Self {
            volume,
            scratch_dir,
            import_dir,
        }
    }

    /// 使用系统卷查询与进程临时目录创建
    pub fn with_system_volume(import_dir: PathBuf) -> Self {
        Self::new(Arc::new(SysinfoVolume), std::env::temp_dir(), import_dir)
    }

    /// 分片上传要求的最小可用空间
    ///
    /// ≈ 并发分片数 × 50MiB，再加 20% 余量；4 核机器约 240MiB
    pub fn minimal_space_required_for_chunk_upload(&self) -> u64 {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .max(4) as u64;
        let required = parallelism * SCRATCH_PER_CHUNK;
        required + required / 5
    }

    /// 检查是否有足够空间开始分片上传
    ///
    /// 空间不足返回 `NotEnoughSpace`，由操作层按「致命并挂起队列」处理
    pub fn check_enough_available_space_for_chunk_upload(&self) -> Result<(), StorageIssue> {
        let available = self.volume.available_capacity(&self.scratch_dir)?;
        let required = self.minimal_space_required_for_chunk_upload();

        if available <= required {
            warn!(
                "暂存空间不足: 可用={}MiB, 需要={}MiB",
                available / 1024 / 1024,
                required / 1024 / 1024
            );
            return Err(StorageIssue::NotEnoughSpace);
        }

        Ok(())
    }

    /// 缓存一致性巡检
    ///
    /// 周期性或前台激活时调用：
    /// 1. 清理导入目录中不被任何待上传记录引用的孤儿文件
    /// 2. 可用空间低于最小需求 2 倍时，清空暂存目录
    ///
    /// # 参数
    /// * `uploading_sources` - 当前全部待上传记录的源文件路径
    pub fn audit_cache(&self, uploading_sources: &[PathBuf]) {
        self.clean_orphan_files(uploading_sources);
        self.clean_scratch_if_almost_full();
    }

    /// 清理导入目录中的孤儿文件
    fn clean_orphan_files(&self, uploading_sources: &[PathBuf]) {
        let entries = match std::fs::read_dir(&self.import_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("读取导入目录失败: {:?}, 错误: {}", self.import_dir, e);
                return;
            }
        };

        let mut cleaned = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let referenced = uploading_sources.iter().any(|source| *source == path);
            if referenced {
                continue;
            }

            match std::fs::remove_file(&path) {
                Ok(_) => cleaned += 1,
                Err(e) => warn!("删除孤儿文件失败: {:?}, 错误: {}", path, e),
            }
        }

        if cleaned > 0 {
            info!("已清理导入目录中 {} 个孤儿文件", cleaned);
        }
    }

    /// 可用空间临界时清空暂存目录
    fn clean_scratch_if_almost_full(&self) {
        let available = match self.volume.available_capacity(&self.scratch_dir) {
            Ok(available) => available,
            Err(e) => {
                error!("无法读取可用空间: {}", e);
                return;
            }
        };

        // 低于最小需求 2 倍才清理
        if available >= self.minimal_space_required_for_chunk_upload() * 2 {
            return;
        }

        info!("暂存空间临界，清空临时文件");
        let entries = match std::fs::read_dir(&self.scratch_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("读取暂存目录失败: {:?}, 错误: {}", self.scratch_dir, e);
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = result {
                warn!("清理暂存文件失败: {:?}, 错误: {}", path, e);
            }
        }
    }
}
