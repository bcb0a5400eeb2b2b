//! 日志文件登记与保留策略
//!
//! 每个租户一个 `FileManager`，登记该租户名下的全部历史日志文件，
//! 启动时枚举磁盘上已有的文件，超出数量上限时删除最旧且未打开的
//! 文件。条目与容器共享（容器更新大小/写入时刻，管理器做保留）。

use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{info, warn};

/// 单个物理日志文件的登记信息
#[derive(Debug)]
pub struct FileInfo {
    pub path: PathBuf,
    pub creation_time: SystemTime,
    pub last_write_time: SystemTime,
    pub size: u64,
    /// 打开写入期间为 true，保留策略不会删除
    pub in_use: bool,
}

pub type SharedFileInfo = Arc<Mutex<FileInfo>>;

impl FileInfo {
    /// 新开文件的登记项
    pub fn opened(path: PathBuf) -> SharedFileInfo {
        let now = SystemTime::now();
        Arc::new(Mutex::new(Self {
            path,
            creation_time: now,
            last_write_time: now,
            size: 0,
            in_use: true,
        }))
    }

    /// 从磁盘元数据恢复（启动枚举）
    pub fn from_metadata(path: PathBuf) -> std::io::Result<SharedFileInfo> {
        let meta = std::fs::metadata(&path)?;
        let modified = meta.modified()?;
        Ok(Arc::new(Mutex::new(Self {
            path,
            creation_time: meta.created().unwrap_or(modified),
            last_write_time: modified,
            size: meta.len(),
            in_use: false,
        })))
    }
}

/// 视图层使用的文件摘要
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub path: String,
    pub creation_time: String,
    pub last_write_time: String,
    /// 字节数，写入中显示 "in use"
    pub size: String,
}

fn format_time(t: SystemTime) -> String {
    DateTime::<Local>::from(t).format("%Y/%m/%d %H:%M:%S").to_string()
}

/// 租户日志目录：`<log_dir>/<user_id:08>`
pub fn user_dir(log_dir: &Path, user_id: u32) -> PathBuf {
    log_dir.join(format!("{:08}", user_id))
}

/// 单租户文件管理器
pub struct FileManager {
    user_id: u32,
    /// 0 表示不限制
    max_count: usize,
    files: Vec<SharedFileInfo>,
}

impl FileManager {
    pub fn new(user_id: u32, max_count: usize) -> Self {
        Self {
            user_id,
            max_count,
            files: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// 枚举目录中已有的日志文件
    pub fn scan(&mut self, dir: &Path) -> std::io::Result<()> {
        if !dir.exists() {
            return Ok(());
        }

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if !matches!(ext, Some("slog") | Some("log")) {
                continue;
            }
            match FileInfo::from_metadata(path.clone()) {
                Ok(info) => self.files.push(info),
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }

        info!(
            "User {:08}: found {} existing log files",
            self.user_id,
            self.files.len()
        );
        Ok(())
    }

    /// 登记新文件并执行保留策略
    pub fn register(&mut self, info: SharedFileInfo) {
        self.files.push(info);
        self.enforce_retention();
    }

    /// 数量超限时删除最旧且未打开的文件
    /// 排序键：最后写入时刻、创建时刻、路径
    fn enforce_retention(&mut self) {
        if self.max_count == 0 {
            return;
        }

        while self.files.len() > self.max_count {
            let oldest = self
                .files
                .iter()
                .enumerate()
                .filter(|(_, f)| !f.lock().unwrap().in_use)
                .min_by_key(|(_, f)| {
                    let f = f.lock().unwrap();
                    (f.last_write_time, f.creation_time, f.path.clone())
                })
                .map(|(idx, _)| idx);

            let Some(idx) = oldest else {
                // 全部在写入中，等下一次登记再收敛
                break;
            };

            let info = self.files.remove(idx);
            let path = info.lock().unwrap().path.clone();
            match std::fs::remove_file(&path) {
                Ok(()) => info!("Evicted old log file {}", path.display()),
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }

    /// 视图层文件列表，按最后写入时刻排序
    pub fn summaries(&self) -> Vec<FileSummary> {
        let mut entries: Vec<_> = self
            .files
            .iter()
            .map(|f| {
                let f = f.lock().unwrap();
                (
                    f.last_write_time,
                    FileSummary {
                        path: f.path.display().to_string(),
                        creation_time: format_time(f.creation_time),
                        last_write_time: format_time(f.last_write_time),
                        size: if f.in_use {
                            "in use".to_string()
                        } else {
                            f.size.to_string()
                        },
                    },
                )
            })
            .collect();

        entries.sort_by_key(|(t, _)| *t);
        entries.into_iter().map(|(_, s)| s).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stub(dir: &Path, name: &str, age_secs: u64, in_use: bool) -> SharedFileInfo {
        let path = dir.join(name);
        std::fs::write(&path, b"x").unwrap();
        let t = SystemTime::now() - Duration::from_secs(age_secs);
        Arc::new(Mutex::new(FileInfo {
            path,
            creation_time: t,
            last_write_time: t,
            size: 1,
            in_use,
        }))
    }

    #[test]
    fn test_retention_bound() {
        let dir = std::env::temp_dir().join("slogsvc_test_retention");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let mut mgr = FileManager::new(1, 3);
        for n in 0..6 {
            mgr.register(stub(&dir, &format!("f{}.slog", n), 100 - n, false));
            assert!(mgr.len() <= 3);
        }

        // 最旧的 f0..f2 被删除
        assert!(!dir.join("f0.slog").exists());
        assert!(!dir.join("f2.slog").exists());
        assert!(dir.join("f5.slog").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_in_use_never_evicted() {
        let dir = std::env::temp_dir().join("slogsvc_test_in_use");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let mut mgr = FileManager::new(1, 1);
        mgr.register(stub(&dir, "active.slog", 1000, true));
        mgr.register(stub(&dir, "new.slog", 0, false));

        // 最旧的文件在写入中，改删第二旧的
        assert!(dir.join("active.slog").exists());
        assert!(!dir.join("new.slog").exists());
        assert_eq!(mgr.len(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_scan_picks_up_log_extensions() {
        let dir = std::env::temp_dir().join("slogsvc_test_scan");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.slog"), b"1").unwrap();
        std::fs::write(dir.join("b.log"), b"2").unwrap();
        std::fs::write(dir.join("c.txt"), b"3").unwrap();

        let mut mgr = FileManager::new(1, 0);
        mgr.scan(&dir).unwrap();
        assert_eq!(mgr.len(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
