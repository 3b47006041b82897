// 配置管理模块

use crate::queue::{QueueOptions, DEFAULT_PARALLELISM_CEILING};
use crate::store::PendingScope;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// 引擎配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// API 配置
    #[serde(default)]
    pub api: ApiConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 文件级并发上限
    #[serde(default = "default_parallelism_ceiling")]
    pub parallelism_ceiling: usize,
    /// 全队列共享的分片并发预算
    #[serde(default = "default_chunk_parallelism")]
    pub chunk_parallelism: usize,
    /// 单个分片的传输层重试次数
    #[serde(default = "default_chunk_retries")]
    pub chunk_retries: u32,
    /// 仅限 Wi-Fi 上传
    #[serde(default)]
    pub wifi_only: bool,
    /// 计数事件节流间隔（毫秒）
    #[serde(default = "default_count_throttle_ms")]
    pub count_throttle_ms: u64,
    /// 导入目录（排队文件的暂存副本）
    #[serde(default = "default_import_dir")]
    pub import_dir: PathBuf,
}

fn default_parallelism_ceiling() -> usize {
    DEFAULT_PARALLELISM_CEILING
}

fn default_chunk_parallelism() -> usize {
    6
}

fn default_chunk_retries() -> u32 {
    3
}

fn default_count_throttle_ms() -> u64 {
    1000
}

fn default_import_dir() -> PathBuf {
    PathBuf::from("import")
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            parallelism_ceiling: default_parallelism_ceiling(),
            chunk_parallelism: default_chunk_parallelism(),
            chunk_retries: default_chunk_retries(),
            wifi_only: false,
            count_throttle_ms: default_count_throttle_ms(),
            import_dir: default_import_dir(),
        }
    }
}

impl UploadConfig {
    /// 按指定记录范围生成队列选项
    pub fn queue_options(&self, scope: PendingScope) -> QueueOptions {
        let mut options = QueueOptions::for_scope(scope);
        options.parallelism_ceiling = self.parallelism_ceiling.max(1);
        options.chunk_parallelism = self.chunk_parallelism.max(1);
        options.chunk_retries = self.chunk_retries;
        options.wifi_only = self.wifi_only;
        options.count_throttle_ms = self.count_throttle_ms;
        options
    }
}

/// API 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API 根地址（不含尾部斜杠）
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 请求级超时（秒，覆盖分片传输全程）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.drive.example.com/3".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// 从 TOML 文件加载配置
    ///
    /// 文件不存在时写出默认配置
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("配置文件不存在，写出默认配置: {:?}", path);
            let config = Self::default();
            config.save(path).await?;
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))?;
        Ok(config)
    }

    /// 保存配置到 TOML 文件
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建配置目录失败: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;
        Ok(())
    }
}
