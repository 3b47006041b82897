// 日志初始化
//
// 控制台层 + 按天滚动的文件层，文件名形如
// clouddrive-upload.2026-08-25，超过保留天数的旧文件按日期清理

use crate::config::LogConfig;
use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDate};
use std::path::Path;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "clouddrive-upload";

/// 时间戳格式
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 持有后台写入线程的守卫
///
/// 丢弃时冲刷并停止文件写入线程，需保持存活到进程结束
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化全局日志订阅器
///
/// RUST_LOG 优先于配置中的级别
pub fn init_logging(config: &LogConfig) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let console_layer = fmt::layer()
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_target(true);

    let mut file_guard = None;
    let file_layer = if config.enabled {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("创建日志目录失败: {:?}", config.log_dir))?;

        let appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        Some(
            fmt::layer()
                .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("初始化日志订阅器失败")?;

    if config.enabled {
        info!(
            "日志已启用: dir={:?}, 保留 {} 天",
            config.log_dir, config.retention_days
        );
        if let Err(e) = cleanup_old_logs(&config.log_dir, config.retention_days) {
            warn!("清理过期日志失败: {}", e);
        }
    }

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

/// 删除超过保留天数的日志文件
///
/// 优先按文件名中的日期判断，解析失败时退回文件修改时间
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> Result<()> {
    let cutoff = Local::now().date_naive() - Duration::days(i64::from(retention_days));
    let entries =
        std::fs::read_dir(log_dir).with_context(|| format!("读取日志目录失败: {:?}", log_dir))?;

    let mut removed = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(suffix) = name
            .strip_prefix(LOG_FILE_PREFIX)
            .map(|s| s.trim_start_matches('.'))
        else {
            continue;
        };

        let expired = match NaiveDate::parse_from_str(suffix, "%Y-%m-%d") {
            Ok(date) => date < cutoff,
            // 文件名无日期时退回修改时间
            Err(_) => match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => {
                    let age = modified.elapsed().unwrap_or_default();
                    age.as_secs() > u64::from(retention_days) * 24 * 3600
                }
                Err(_) => false,
            },
        };

        if expired {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("删除过期日志失败: {:?}, {}", path, e),
            }
        }
    }

    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }
    Ok(())
}
