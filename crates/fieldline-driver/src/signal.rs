//! 线程协调工具
//!
//! 会话内各线程之间的 “session done” / “shutdown” / “clear done” 信号，
//! 以及带超时的线程 join。

use parking_lot::{Condvar, Mutex};
use std::sync::mpsc;
use std::thread::{JoinHandle, spawn};
use std::time::{Duration, Instant};

/// 手动复位事件
#[derive(Debug, Default)]
pub struct Event {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// 置位并唤醒所有等待者
    pub fn set(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *self.flag.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    /// 等待置位，超时返回 `false`
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.flag.lock();
        while !*flag {
            if self.cond.wait_until(&mut flag, deadline).timed_out() {
                return *flag;
            }
        }
        true
    }
}

/// 带超时的线程 join
///
/// 超时后线程仍在后台运行，由看门狗线程负责最终回收。
pub trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        let (tx, rx) = mpsc::channel();

        // 看门狗线程负责 join，本线程带超时等待结果
        spawn(move || {
            let _ = tx.send(self.join());
        });

        match rx.recv_timeout(timeout) {
            Ok(join_result) => join_result.map(|_| ()),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Thread join timeout",
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Box::new(std::io::Error::other(
                "Watchdog thread disconnected",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_times_out_when_unset() {
        let event = Event::new();
        let start = Instant::now();
        assert!(!event.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_set_wakes_waiter() {
        let event = Arc::new(Event::new());
        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        event.set();
        assert!(waiter.join().unwrap());
        assert!(event.is_set());

        event.clear();
        assert!(!event.is_set());
    }

    #[test]
    fn test_join_timeout_returns_when_thread_exits() {
        let handle = thread::spawn(|| thread::sleep(Duration::from_millis(10)));
        assert!(handle.join_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_join_timeout_gives_up_on_stuck_thread() {
        let release = Arc::new(Event::new());
        let handle = {
            let release = release.clone();
            thread::spawn(move || {
                release.wait_timeout(Duration::from_secs(5));
            })
        };
        let start = Instant::now();
        assert!(handle.join_timeout(Duration::from_millis(50)).is_err());
        assert!(start.elapsed() < Duration::from_secs(2));
        release.set();
    }
}
