// 分片区间规划
//
// 纯函数：根据文件大小计算分片边界与推荐分片大小
//
// API 分片约束：
// - 分片大小范围 1MiB-50MiB
// - 每次会话分片数范围 [1, 10000)
// - 空文件不分片（零个分片）

use crate::error::{LocalError, SessionError, UploadError};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::Path;
use tracing::debug;

/// 最小分片大小: 1MiB
pub const CHUNK_MIN_SIZE: u64 = 1024 * 1024;

/// 最大分片大小: 50MiB
pub const CHUNK_MAX_SIZE: u64 = 50 * 1024 * 1024;

/// 理想分片数（用于计算推荐分片大小）
pub const OPTIMAL_CHUNK_COUNT: u64 = 200;

/// API 允许的最大分片数（不含）
pub const API_MAX_TOTAL_CHUNKS: u64 = 10_000;

/// API 要求的最小分片数
pub const API_MIN_TOTAL_CHUNKS: u64 = 1;

/// 字节区间（闭区间，上界为最后一个字节的偏移）
pub type ByteRange = RangeInclusive<u64>;

/// 文件身份标记
///
/// 会话建立时快照，续传前比对；任一字段变化即视为身份变化，
/// 已上传分片不可复用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdentity {
    /// 文件大小（字节）
    pub size: u64,
    /// 修改时间（Unix 秒）
    pub modified_at: i64,
}

/// 读取文件字节大小
///
/// 源文件已不存在时返回 `LocalError::FileNotFound`，
/// 由操作层按本地致命错误处理（触发级联取消）
pub async fn read_file_byte_size(path: &Path) -> Result<u64, UploadError> {
    let metadata = tokio::fs::metadata(path).await.map_err(|_| {
        UploadError::Local(LocalError::FileNotFound {
            path: path.to_path_buf(),
        })
    })?;
    Ok(metadata.len())
}

/// 读取文件身份标记（大小 + 修改时间）
pub async fn read_file_identity(path: &Path) -> Result<FileIdentity, UploadError> {
    let metadata = tokio::fs::metadata(path).await.map_err(|_| {
        UploadError::Local(LocalError::FileNotFound {
            path: path.to_path_buf(),
        })
    })?;

    let modified_at = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    Ok(FileIdentity {
        size: metadata.len(),
        modified_at,
    })
}

/// 计算推荐分片大小
///
/// # 规则
/// - 空文件返回 0
/// - 以理想分片数反推，再限制在 [1MiB, 50MiB]
/// - 永远不大于文件本身
pub fn prefered_chunk_size(file_size: u64) -> u64 {
    if file_size == 0 {
        return 0;
    }

    let potential = file_size / OPTIMAL_CHUNK_COUNT;
    let chunk_size = potential.clamp(CHUNK_MIN_SIZE, CHUNK_MAX_SIZE);
    chunk_size.min(file_size)
}

/// 构建分片区间
///
/// 产出连续、不重叠、恰好覆盖 `[0, file_size)` 的区间序列：
/// `total_chunks_count` 个 `chunk_size` 大小的完整分片，
/// 剩余字节（如有）归入最后一个补尾分片
///
/// # 参数
/// * `file_size` - 文件总大小；为 0 时返回空序列
/// * `total_chunks_count` - 完整分片数量
/// * `chunk_size` - 分片大小
pub fn build_ranges(
    file_size: u64,
    total_chunks_count: u64,
    chunk_size: u64,
) -> Result<Vec<ByteRange>, UploadError> {
    // 空文件永远不分片
    if file_size == 0 {
        return Ok(Vec::new());
    }

    if chunk_size == 0 || total_chunks_count == 0 {
        return Err(UploadError::Session(SessionError::InvalidChunkSize));
    }

    // 完整分片不允许越过文件末尾
    if total_chunks_count.saturating_mul(chunk_size) > file_size {
        return Err(UploadError::Session(SessionError::InvalidChunkSize));
    }

    let mut ranges = Vec::with_capacity(total_chunks_count as usize + 1);
    for index in 0..total_chunks_count {
        let start = index * chunk_size;
        ranges.push(start..=start + chunk_size - 1);
    }

    // 补尾分片
    let covered = total_chunks_count * chunk_size;
    if covered < file_size {
        ranges.push(covered..=file_size - 1);
    }

    Ok(ranges)
}

/// 分片计划
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    /// 分片大小
    pub chunk_size: u64,
    /// 全部分片区间（含补尾分片）
    pub ranges: Vec<ByteRange>,
}

impl ChunkPlan {
    /// 声明给服务器的分片总数
    pub fn total_chunks(&self) -> u64 {
        self.ranges.len() as u64
    }
}

/// 为指定文件大小生成完整分片计划
///
/// 分片数超出 API 上限时返回 `ChunksNumberOutOfBounds`
pub fn plan_chunks(file_size: u64) -> Result<ChunkPlan, UploadError> {
    let chunk_size = prefered_chunk_size(file_size);

    let ranges = if file_size == 0 {
        Vec::new()
    } else {
        // chunk_size <= file_size，向下取整至少得到 1 个完整分片，
        // 剩余字节由 build_ranges 归入补尾分片
        let full_chunks = file_size / chunk_size;
        build_ranges(file_size, full_chunks, chunk_size)?
    };

    let total = ranges.len() as u64;
    if file_size > 0 && !(API_MIN_TOTAL_CHUNKS..API_MAX_TOTAL_CHUNKS).contains(&total) {
        return Err(UploadError::Session(SessionError::ChunksNumberOutOfBounds {
            total_chunks: total,
        }));
    }

    debug!(
        "分片计划: file_size={}, chunk_size={}, chunks={}",
        file_size, chunk_size, total
    );

    Ok(ChunkPlan { chunk_size, ranges })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// 校验区间连续且首尾覆盖完整
    fn check_continuity(ranges: &[ByteRange], file_size: u64) {
        if file_size == 0 {
            assert!(ranges.is_empty());
            return;
        }
        assert_eq!(*ranges[0].start(), 0);
        assert_eq!(*ranges.last().unwrap().end(), file_size - 1);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end() + 1, *pair[1].start());
        }
    }

    #[test]
    fn test_build_ranges_with_tail_chunk() {
        // 4865229 字节，4 个 1MiB 完整分片 + 1 个补尾分片
        let file_size = 4_865_229u64;
        let ranges = build_ranges(file_size, 4, 1024 * 1024).unwrap();
        assert_eq!(ranges.len(), 5);
        check_continuity(&ranges, file_size);
    }

    #[test]
    fn test_build_ranges_exact_fit() {
        let file_size = 16 * 1024 * 1024;
        let ranges = build_ranges(file_size, 4, 4 * 1024 * 1024).unwrap();
        assert_eq!(ranges.len(), 4);
        check_continuity(&ranges, file_size);
    }

    #[test]
    fn test_build_ranges_empty_file() {
        // 空文件：零个分片
        let ranges = build_ranges(0, 1, 1).unwrap();
        assert!(ranges.is_empty());
    }

    #[test]
    fn test_build_ranges_invalid_chunk_size() {
        assert!(matches!(
            build_ranges(1024, 1, 0),
            Err(UploadError::Session(SessionError::InvalidChunkSize))
        ));
        // 完整分片越过文件末尾
        assert!(build_ranges(1024, 2, 1024).is_err());
    }

    #[test]
    fn test_prefered_chunk_size_zero() {
        assert_eq!(prefered_chunk_size(0), 0);
    }

    #[test]
    fn test_prefered_chunk_size_capped_at_file_size() {
        // 极小文件：分片大小等于文件大小
        assert_eq!(prefered_chunk_size(10), 10);
    }

    #[test]
    fn test_prefered_chunk_size_bounds() {
        // 中等文件：落在 [1MiB, 50MiB] 且不超过文件大小
        let size = 4_865_229u64;
        let chunk = prefered_chunk_size(size);
        assert!(chunk > 0);
        assert!(chunk <= size);
        assert!(chunk >= CHUNK_MIN_SIZE);

        // 超大文件：封顶 50MiB
        let huge = 1024u64 * 1024 * 1024 * 1024;
        assert_eq!(prefered_chunk_size(huge), CHUNK_MAX_SIZE);
    }

    #[test]
    fn test_plan_chunks_small_file() {
        let plan = plan_chunks(10).unwrap();
        assert_eq!(plan.chunk_size, 10);
        assert_eq!(plan.total_chunks(), 1);
        check_continuity(&plan.ranges, 10);
    }

    #[test]
    fn test_plan_chunks_empty_file() {
        let plan = plan_chunks(0).unwrap();
        assert_eq!(plan.total_chunks(), 0);
        assert_eq!(plan.chunk_size, 0);
    }

    proptest! {
        #[test]
        fn prop_plan_chunks_cover_exactly(file_size in 0u64..=4 * 1024 * 1024 * 1024) {
            let plan = plan_chunks(file_size).unwrap();
            check_continuity(&plan.ranges, file_size);

            // 区间总长恰好等于文件大小
            let covered: u64 = plan.ranges.iter().map(|r| r.end() - r.start() + 1).sum();
            prop_assert_eq!(covered, file_size);

            if file_size > 0 {
                prop_assert!(plan.total_chunks() < API_MAX_TOTAL_CHUNKS);
                prop_assert!(plan.chunk_size <= file_size);
            }
        }
    }

    #[tokio::test]
    async fn test_read_file_byte_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        tokio::fs::write(&path, vec![0u8; 12345]).await.unwrap();

        let size = read_file_byte_size(&path).await.unwrap();
        assert_eq!(size, 12345);
    }

    #[tokio::test]
    async fn test_read_file_byte_size_not_found() {
        let err = read_file_byte_size(Path::new("/nonexistent/sample.bin"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::Local(LocalError::FileNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_file_identity_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let first = read_file_identity(&path).await.unwrap();
        assert_eq!(first.size, 3);

        tokio::fs::write(&path, b"abcdef").await.unwrap();
        let second = read_file_identity(&path).await.unwrap();
        assert_ne!(first, second);
    }
}
