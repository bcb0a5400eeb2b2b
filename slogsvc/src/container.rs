//! 共享文件容器
//!
//! 同一租户下请求相同基础文件名的所有会话共享一个容器（一个物理
//! 文件、一把锁）。引用计数由注册表在其全局锁内维护，归零时关闭
//! 文件并刷新登记信息。
//!
//! 基础文件名扩展名为 slog 时写入二进制记录（与网络编码一致），
//! 可选同名 .log 文本镜像；其他扩展名直接写文本行。

use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{error, info};

use seqlog::{encode_item, LogItem};

use crate::files::{FileInfo, SharedFileInfo};

/// 单次写入的结果
pub enum WriteOutcome {
    Written,
    /// 触发轮转，携带新开文件的登记项，由会话交给注册表
    Rotated(Vec<SharedFileInfo>),
}

struct ContainerState {
    ref_count: usize,
    file: File,
    info: SharedFileInfo,
    mirror: Option<(File, SharedFileInfo)>,
}

pub struct SharedFileContainer {
    base_file_name: String,
    dir: PathBuf,
    pid: u32,
    /// 0 表示不限制
    max_size: u64,
    binary: bool,
    text_mirror: bool,
    state: Mutex<ContainerState>,
}

impl SharedFileContainer {
    /// 打开容器并创建首个日志文件，返回新文件的登记项
    pub fn open(
        dir: &Path,
        base_file_name: &str,
        pid: u32,
        max_size: u64,
        text_mirror: bool,
    ) -> io::Result<(Self, Vec<SharedFileInfo>)> {
        std::fs::create_dir_all(dir)?;

        let binary = Path::new(base_file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "slog")
            .unwrap_or(false);

        let (file, info, mirror) =
            open_files(dir, base_file_name, pid, binary && text_mirror)?;

        let mut infos = vec![info.clone()];
        if let Some((_, m)) = &mirror {
            infos.push(m.clone());
        }

        Ok((
            Self {
                base_file_name: base_file_name.to_string(),
                dir: dir.to_path_buf(),
                pid,
                max_size,
                binary,
                text_mirror,
                state: Mutex::new(ContainerState {
                    ref_count: 1,
                    file,
                    info,
                    mirror,
                }),
            },
            infos,
        ))
    }

    pub fn base_file_name(&self) -> &str {
        &self.base_file_name
    }

    /// 增加引用，返回新计数。由注册表在其锁内调用
    pub fn acquire(&self) -> usize {
        let mut st = self.state.lock().unwrap();
        st.ref_count += 1;
        st.ref_count
    }

    /// 减少引用，返回新计数。由注册表在其锁内调用
    pub fn release(&self) -> usize {
        let mut st = self.state.lock().unwrap();
        st.ref_count -= 1;
        st.ref_count
    }

    /// 追加一条日志
    ///
    /// 写入后超过大小上限则轮转。轮转失败只记录日志，继续用原有
    /// 句柄，下次写入再试。
    pub fn write_item(&self, item: &LogItem) -> io::Result<WriteOutcome> {
        let mut st = self.state.lock().unwrap();

        let line = item.text_line();
        let written = if self.binary {
            // 条目来自解码端，长度校验已通过，这里失败属于数据损坏
            let record = encode_item(item)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            st.file.write_all(&record)?;
            record.len() as u64
        } else {
            st.file.write_all(line.as_bytes())?;
            st.file.write_all(b"\n")?;
            line.len() as u64 + 1
        };

        let size = {
            let mut info = st.info.lock().unwrap();
            info.size += written;
            info.last_write_time = SystemTime::now();
            info.size
        };

        if let Some((mirror, minfo)) = &mut st.mirror {
            mirror.write_all(line.as_bytes())?;
            mirror.write_all(b"\n")?;
            let mut minfo = minfo.lock().unwrap();
            minfo.size += line.len() as u64 + 1;
            minfo.last_write_time = SystemTime::now();
        }

        if self.max_size != 0 && size > self.max_size {
            match self.rotate(&mut st) {
                Ok(infos) => return Ok(WriteOutcome::Rotated(infos)),
                Err(e) => error!(
                    "Rotation failed for {}: {}, keeping current file",
                    self.base_file_name, e
                ),
            }
        }

        Ok(WriteOutcome::Written)
    }

    /// 先开新文件，成功后才封存旧文件
    fn rotate(&self, st: &mut ContainerState) -> io::Result<Vec<SharedFileInfo>> {
        let (file, info, mirror) = open_files(
            &self.dir,
            &self.base_file_name,
            self.pid,
            self.binary && self.text_mirror,
        )?;

        finalize(&st.info);
        if let Some((_, m)) = &st.mirror {
            finalize(m);
        }

        info!(
            "Rotated {} -> {}",
            self.base_file_name,
            info.lock().unwrap().path.display()
        );

        let mut infos = vec![info.clone()];
        if let Some((_, m)) = &mirror {
            infos.push(m.clone());
        }

        st.file = file;
        st.info = info;
        st.mirror = mirror;
        Ok(infos)
    }

    /// 最后一个引用释放后由注册表调用：落盘并封存登记信息
    pub fn close(&self) {
        let mut st = self.state.lock().unwrap();
        let _ = st.file.flush();
        finalize(&st.info);
        if let Some((mirror, minfo)) = &mut st.mirror {
            let _ = mirror.flush();
            finalize(minfo);
        }
    }
}

fn finalize(info: &SharedFileInfo) {
    info.lock().unwrap().in_use = false;
}

/// 创建带时间戳的日志文件：`<stem>-<pid:05>-<YYYYMMDD>-<HHMMSS>-<mmm>.<ext>`
fn open_files(
    dir: &Path,
    base_file_name: &str,
    pid: u32,
    with_mirror: bool,
) -> io::Result<(File, SharedFileInfo, Option<(File, SharedFileInfo)>)> {
    let base = Path::new(base_file_name);
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(base_file_name);
    let ext = base
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("log");

    // 同一毫秒内重开会撞名，重新打时间戳再试
    for attempt in 0..5 {
        let stamp = Local::now().format("%Y%m%d-%H%M%S-%3f");
        let name = format!("{}-{:05}-{}.{}", stem, pid, stamp, ext);
        let path = dir.join(name);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => {
                let info = FileInfo::opened(path.clone());
                let mirror = if with_mirror {
                    let mpath = path.with_extension("log");
                    let mfile = OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(&mpath)?;
                    Some((mfile, FileInfo::opened(mpath)))
                } else {
                    None
                };
                return Ok((file, info, mirror));
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < 4 => {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("bounded retry loop always returns");
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqlog::decode_item;

    fn tmp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("slogsvc_container_{}", tag));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn slog_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().map(|e| e == "slog").unwrap_or(false))
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_rotation_triggers_only_above_max() {
        let dir = tmp_dir("rotate");
        let item = LogItem::step_out(1, 2);
        let record_len = encode_item(&item).unwrap().len() as u64;

        // 上限恰好等于一条记录
        let (container, _) =
            SharedFileContainer::open(&dir, "trace.slog", 7, record_len, false).unwrap();

        // 第一条写满但不超限，不轮转
        assert!(matches!(
            container.write_item(&item).unwrap(),
            WriteOutcome::Written
        ));
        assert_eq!(slog_files(&dir).len(), 1);

        // 第二条越过上限，恰好轮转一次
        assert!(matches!(
            container.write_item(&item).unwrap(),
            WriteOutcome::Rotated(_)
        ));
        assert_eq!(slog_files(&dir).len(), 2);

        // 新文件从零开始，再写一条又是恰好写满
        assert!(matches!(
            container.write_item(&item).unwrap(),
            WriteOutcome::Written
        ));
        assert_eq!(slog_files(&dir).len(), 2);

        container.close();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_binary_file_decodes_back() {
        let dir = tmp_dir("decode");
        let (container, infos) =
            SharedFileContainer::open(&dir, "trace.slog", 7, 0, false).unwrap();

        let mut item = LogItem::step_in(1, 2, "Engine", "run");
        item.timestamp_ms = 1234;
        container.write_item(&item).unwrap();
        container.close();

        let path = infos[0].lock().unwrap().path.clone();
        let data = std::fs::read(&path).unwrap();
        let mut buf = bytes::BytesMut::from(&data[..]);
        let decoded = decode_item(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, item);
        assert!(buf.is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_text_extension_writes_lines() {
        let dir = tmp_dir("text");
        let (container, infos) =
            SharedFileContainer::open(&dir, "trace.log", 7, 0, false).unwrap();

        let mut item = LogItem::message(1, 2, seqlog::Level::Info, "hello");
        item.timestamp_ms = 1_700_000_000_000;
        container.write_item(&item).unwrap();
        container.close();

        let path = infos[0].lock().unwrap().path.clone();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("i1 "));
        assert!(text.ends_with("hello\n"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_mirror_written_alongside_binary() {
        let dir = tmp_dir("mirror");
        let (container, infos) =
            SharedFileContainer::open(&dir, "trace.slog", 7, 0, true).unwrap();
        assert_eq!(infos.len(), 2);

        let item = LogItem::step_out(3, 4);
        container.write_item(&item).unwrap();
        container.close();

        let mpath = infos[1].lock().unwrap().path.clone();
        assert_eq!(mpath.extension().unwrap(), "log");
        let text = std::fs::read_to_string(&mpath).unwrap();
        assert!(text.starts_with("n3 "));

        let kinds: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(kinds.len(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
