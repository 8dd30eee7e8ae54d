use crossbeam_channel::{bounded, Receiver, Sender};
use std::time::Duration;

/// 唤醒信号（容量为 1 的有界通道）
///
/// 多次 notify() 在被消费前合并为一次；wait() 阻塞直到有信号。
/// 用于 Reader 等待数据块、DemuxWorker 背压休眠以及停止时的强制唤醒。
#[derive(Clone)]
pub struct Notify {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Notify {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    pub fn notify(&self) {
        // 已有未消费的信号时直接合并
        let _ = self.tx.try_send(());
    }

    pub fn wait(&self) {
        let _ = self.rx.recv();
    }

    /// 返回 true 表示被唤醒，false 表示超时
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    /// 丢弃尚未消费的信号
    pub fn reset(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

impl Default for Notify {
    fn default() -> Self {
        Self::new()
    }
}
