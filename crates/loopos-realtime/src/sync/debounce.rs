//! 防抖合并器
//!
//! 每个 key 在一个窗口内最多发送一次，且总是携带最新的值：
//! - 窗口内第一次 `schedule` 启动计时器
//! - 之后的 `schedule` 只替换待执行的工作，不重置计时器
//! - 计时器到期后执行最新的工作一次，并清除该 key
//!
//! 所属实例 teardown 后，未到期的工作被静默丢弃（不重试，下一次本地修改会重新调度）。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 防抖合并器
pub struct DebounceCoalescer {
    window: Duration,
    pending: Arc<Mutex<HashMap<String, BoxFuture<'static, ()>>>>,
    cancel: CancellationToken,
}

impl DebounceCoalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        }
    }

    /// 调度一次工作；工作是惰性的 future，在计时器到期前不会被 poll
    ///
    /// 必须在 tokio 运行时内调用。
    pub fn schedule<F>(&self, key: impl Into<String>, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        if self.cancel.is_cancelled() {
            debug!("debounce cancelled, dropping work for {}", key);
            return;
        }

        let first_in_window = {
            let mut pending = self.pending.lock();
            pending.insert(key.clone(), Box::pin(work)).is_none()
        };
        if !first_in_window {
            return;
        }

        let pending = self.pending.clone();
        let cancel = self.cancel.clone();
        let window = self.window;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("debounce timer for {} cancelled", key);
                    return;
                }
                _ = tokio::time::sleep(window) => {}
            }
            let work = pending.lock().remove(&key);
            if let Some(work) = work {
                work.await;
            }
        });
    }

    /// 当前等待发送的 key 数量
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// 取消所有计时器并丢弃待执行的工作；可重复调用
    pub fn cancel_all(&self) {
        self.cancel.cancel();
        let dropped = {
            let mut pending = self.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        if dropped > 0 {
            debug!("debounce teardown dropped {} pending sends", dropped);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for DebounceCoalescer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
