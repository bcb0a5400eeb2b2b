//! 服务注册表
//!
//! 进程级的租户状态表：租户 → 文件管理器 + 活动容器。所有变更在
//! 一把粗粒度锁内完成，注册表操作的规模只与活动租户数相关，与
//! 日志流量无关。同时承担监听方扇出：文件列表变化与文本行经
//! broadcast 通道推送给查看器与控制台中继。

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::container::SharedFileContainer;
use crate::files::{user_dir, FileManager, FileSummary, SharedFileInfo};

/// 推送给监听方的事件
#[derive(Debug, Clone)]
pub enum ViewerEvent {
    /// 某租户的文件列表发生变化（新开、轮转、关闭、删除）
    FileListChanged { user_id: u32 },
    /// 一条已定稿的文本日志行
    Line { user_id: u32, line: String },
}

struct RegistryInner {
    managers: HashMap<u32, FileManager>,
    containers: HashMap<(u32, String), Arc<SharedFileContainer>>,
}

pub struct ServiceRegistry {
    log_dir: PathBuf,
    max_file_size: u64,
    max_file_count: usize,
    text_mirror: bool,
    inner: Mutex<RegistryInner>,
    events: broadcast::Sender<ViewerEvent>,
}

impl ServiceRegistry {
    pub fn new(config: &ServiceConfig) -> Self {
        let (events, _) = broadcast::channel(1000);
        Self {
            log_dir: config.log_dir.clone(),
            max_file_size: config.max_file_size,
            max_file_count: config.max_file_count,
            text_mirror: config.text_mirror,
            inner: Mutex::new(RegistryInner {
                managers: HashMap::new(),
                containers: HashMap::new(),
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewerEvent> {
        self.events.subscribe()
    }

    /// 获取（或共享）基础文件名对应的容器
    pub fn get_container(
        &self,
        user_id: u32,
        base_file_name: &str,
        pid: u32,
    ) -> io::Result<Arc<SharedFileContainer>> {
        let mut inner = self.inner.lock().unwrap();
        let key = (user_id, base_file_name.to_string());

        if let Some(container) = inner.containers.get(&key) {
            let count = container.acquire();
            info!(
                "Sharing container {} for user {:08} (refs={})",
                base_file_name, user_id, count
            );
            return Ok(container.clone());
        }

        // 首次见到该租户时先做启动扫描，再落新文件。顺序反过来
        // 扫描会把刚创建的文件当历史文件重复登记，保留策略随之
        // 可能删掉正在写入的路径
        ensure_manager(&mut inner, &self.log_dir, self.max_file_count, user_id);

        let dir = user_dir(&self.log_dir, user_id);
        let (container, infos) = SharedFileContainer::open(
            &dir,
            base_file_name,
            pid,
            self.max_file_size,
            self.text_mirror,
        )?;
        let container = Arc::new(container);

        let manager = ensure_manager(&mut inner, &self.log_dir, self.max_file_count, user_id);
        for info in infos {
            manager.register(info);
        }
        inner.containers.insert(key, container.clone());
        drop(inner);

        self.notify_file_list(user_id);
        Ok(container)
    }

    /// 释放容器，最后一个引用归还时关闭文件
    pub fn release_container(&self, user_id: u32, base_file_name: &str) {
        let mut inner = self.inner.lock().unwrap();
        let key = (user_id, base_file_name.to_string());

        let Some(container) = inner.containers.get(&key).cloned() else {
            warn!("Releasing unknown container {}", base_file_name);
            return;
        };

        if container.release() == 0 {
            container.close();
            inner.containers.remove(&key);
            drop(inner);

            info!("Closed container {} for user {:08}", base_file_name, user_id);
            self.notify_file_list(user_id);
        }
    }

    /// 登记轮转产生的新文件（保留策略在此生效）
    pub fn register_files(&self, user_id: u32, infos: Vec<SharedFileInfo>) {
        let mut inner = self.inner.lock().unwrap();
        let manager = ensure_manager(&mut inner, &self.log_dir, self.max_file_count, user_id);
        for info in infos {
            manager.register(info);
        }
        drop(inner);

        self.notify_file_list(user_id);
    }

    /// 推送一条文本行给所有监听方
    pub fn print_log(&self, user_id: u32, line: String) {
        let _ = self.events.send(ViewerEvent::Line { user_id, line });
    }

    /// 某租户当前的文件列表摘要
    pub fn file_summaries(&self, user_id: u32) -> Vec<FileSummary> {
        let mut inner = self.inner.lock().unwrap();
        ensure_manager(&mut inner, &self.log_dir, self.max_file_count, user_id).summaries()
    }

    /// 停机收尾：关闭所有残留容器
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        for container in inner.containers.values() {
            container.close();
        }
        inner.containers.clear();
    }

    fn notify_file_list(&self, user_id: u32) {
        let _ = self.events.send(ViewerEvent::FileListChanged { user_id });
    }
}

fn ensure_manager<'a>(
    inner: &'a mut RegistryInner,
    log_dir: &PathBuf,
    max_file_count: usize,
    user_id: u32,
) -> &'a mut FileManager {
    inner.managers.entry(user_id).or_insert_with(|| {
        let mut manager = FileManager::new(user_id, max_file_count);
        let dir = user_dir(log_dir, user_id);
        if let Err(e) = manager.scan(&dir) {
            warn!("Failed to scan {}: {}", dir.display(), e);
        }
        manager
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    fn test_config(dir: &Path, max_file_count: usize) -> ServiceConfig {
        ServiceConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            web_port: 0,
            log_dir: dir.to_path_buf(),
            max_file_size: 0,
            max_file_count,
            text_mirror: false,
            output_screen: false,
            poll_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_first_open_registers_single_entry() {
        let dir = std::env::temp_dir().join("slogsvc_registry_first_open");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let registry = ServiceRegistry::new(&test_config(&dir, 0));
        let _c = registry.get_container(1, "trace.slog", 9).unwrap();

        // 启动扫描不能把刚创建的文件再登记一次
        let summaries = registry.file_summaries(1);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].size, "in use");

        registry.release_container(1, "trace.slog");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_retention_never_touches_active_file() {
        let dir = std::env::temp_dir().join("slogsvc_registry_active");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let registry = ServiceRegistry::new(&test_config(&dir, 1));

        let container = registry.get_container(1, "trace.slog", 9).unwrap();
        container
            .write_item(&seqlog::LogItem::step_out(1, 2))
            .unwrap();

        let path = std::path::PathBuf::from(&registry.file_summaries(1)[0].path);
        assert!(path.exists());

        // 第二个容器令文件数超限，但两个都在写入中，谁也不能删
        let _other = registry.get_container(1, "other.slog", 9).unwrap();
        let summaries = registry.file_summaries(1);
        assert_eq!(summaries.len(), 2);
        for s in &summaries {
            assert!(std::path::Path::new(&s.path).exists());
        }
        assert!(path.exists());

        registry.release_container(1, "trace.slog");
        registry.release_container(1, "other.slog");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_container_shared_until_both_release() {
        let dir = std::env::temp_dir().join("slogsvc_registry_share");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let registry = ServiceRegistry::new(&test_config(&dir, 0));

        let a = registry.get_container(1, "trace.slog", 10).unwrap();
        let b = registry.get_container(1, "trace.slog", 11).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // 只有一个物理文件，且仍在写入中
        let summaries = registry.file_summaries(1);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].size, "in use");

        registry.release_container(1, "trace.slog");
        assert_eq!(registry.file_summaries(1)[0].size, "in use");

        registry.release_container(1, "trace.slog");
        assert_ne!(registry.file_summaries(1)[0].size, "in use");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_different_base_names_do_not_share() {
        let dir = std::env::temp_dir().join("slogsvc_registry_distinct");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let registry = ServiceRegistry::new(&test_config(&dir, 0));
        let a = registry.get_container(1, "a.slog", 10).unwrap();
        let b = registry.get_container(1, "b.slog", 10).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.file_summaries(1).len(), 2);

        registry.release_container(1, "a.slog");
        registry.release_container(1, "b.slog");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_list_event_on_open_and_close() {
        let dir = std::env::temp_dir().join("slogsvc_registry_events");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let registry = ServiceRegistry::new(&test_config(&dir, 0));
        let mut rx = registry.subscribe();

        let _c = registry.get_container(7, "t.slog", 1).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            ViewerEvent::FileListChanged { user_id: 7 }
        ));

        registry.print_log(7, "i1 line".to_string());
        assert!(matches!(rx.try_recv().unwrap(), ViewerEvent::Line { .. }));

        registry.release_container(7, "t.slog");
        assert!(matches!(
            rx.try_recv().unwrap(),
            ViewerEvent::FileListChanged { user_id: 7 }
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
