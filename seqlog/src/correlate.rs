//! 按线程分队列的因果排序引擎
//!
//! 客户端按事件发生顺序发送，但「这次调用值不值得保留」要等到
//! STEP_OUT 到达才能判断（调用内部有没有产生消息）。因此 STEP_IN
//! 先挂起在所属线程队列中，接受时同步压入一个 STEP_OUT 占位；
//! 调用关闭时若整个调用帧没有产出任何内容，STEP_IN 与 STEP_OUT
//! 一并丢弃，避免生产级别下写出大量空调用帧。
//!
//! 引擎归会话独占，单线程按序驱动，无需加锁。

use std::collections::BTreeMap;

use crate::item::{ItemKind, LogItem};
use crate::Level;

/// 单个客户端线程的条目队列
#[derive(Default)]
struct ItemQueue {
    /// 尚未决定去留的 STEP_IN
    pending: Vec<LogItem>,
    /// 预置的 STEP_OUT 占位栈，接受 STEP_IN 时压入
    step_outs: Vec<LogItem>,
}

/// 排序引擎
///
/// `divide` 逐条驱动，`drain_output` 在每个接收周期后取走已定稿的
/// 输出序列，`flush` 在会话结束时补齐所有未闭合的调用帧。
pub struct Correlator {
    min_level: Level,
    queues: BTreeMap<u32, ItemQueue>,
    output: Vec<LogItem>,
}

impl Correlator {
    pub fn new(min_level: Level) -> Self {
        Self {
            min_level,
            queues: BTreeMap::new(),
            output: Vec::new(),
        }
    }

    pub fn min_level(&self) -> Level {
        self.min_level
    }

    /// 按条目类型分流
    pub fn divide(&mut self, item: LogItem) {
        let queue = self.queues.entry(item.thread_id).or_default();

        match item.kind {
            ItemKind::StepIn => {
                // 占位 STEP_OUT 与 STEP_IN 同序列号，真实 STEP_OUT
                // 到达前只占住时间线上的位置
                queue
                    .step_outs
                    .push(LogItem::step_out(item.seq_no, item.thread_id));
                queue.pending.push(item);
            }
            ItemKind::StepOut => {
                Self::divide_step_out(queue, &mut self.output, item);
            }
            ItemKind::Message => {
                if item.level < self.min_level {
                    return;
                }
                Self::forward(queue, &mut self.output, item);
            }
        }
    }

    fn divide_step_out(queue: &mut ItemQueue, output: &mut Vec<LogItem>, item: LogItem) {
        // 找不到对应占位的 STEP_OUT 丢弃，不能把还开着的调用帧
        // 连带清空
        if !queue.step_outs.iter().any(|p| p.seq_no == item.seq_no) {
            return;
        }

        // 弹到匹配的占位为止。栈顶先出现别的序列号说明内层调用帧
        // 没有等到自己的 STEP_OUT，用来项的接收时刻补齐后转发
        while let Some(mut placeholder) = queue.step_outs.pop() {
            if placeholder.seq_no == item.seq_no {
                break;
            }
            placeholder.timestamp_ms = item.timestamp_ms;
            Self::forward(queue, output, placeholder);
        }

        // 从尾部回收同序列号的挂起项。调用帧从打开到此刻没有
        // 任何转发，说明整帧可弃
        let mut suppressed = false;
        while queue
            .pending
            .last()
            .is_some_and(|last| last.seq_no == item.seq_no)
        {
            if let Some(removed) = queue.pending.pop() {
                if removed.kind == ItemKind::StepIn {
                    suppressed = true;
                }
            }
        }
        if suppressed {
            return;
        }

        Self::forward(queue, output, item);
    }

    /// 转发：先按到达顺序并入全部挂起项，再追加本项
    fn forward(queue: &mut ItemQueue, output: &mut Vec<LogItem>, item: LogItem) {
        output.append(&mut queue.pending);
        output.push(item);
    }

    /// 取走已定稿的输出序列
    pub fn drain_output(&mut self) -> Vec<LogItem> {
        std::mem::take(&mut self.output)
    }

    /// 会话结束时补齐：并入全部挂起项，再按后进先出弹出占位
    /// STEP_OUT 并打上当前时刻，保证每个被接受的 STEP_IN 在输出中
    /// 恰好配对一个 STEP_OUT
    pub fn flush(&mut self, now_ms: u64) {
        for queue in self.queues.values_mut() {
            self.output.append(&mut queue.pending);
            while let Some(mut placeholder) = queue.step_outs.pop() {
                placeholder.timestamp_ms = now_ms;
                self.output.push(placeholder);
            }
        }
        self.queues.clear();
    }
}
