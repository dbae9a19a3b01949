//! 采样数据环形缓冲区
//!
//! 固定容量的循环字节区，在接收线程（生产者）与帧同步线程（消费者）之间
//! 传递变长数据包，避免逐包分配堆对象。
//!
//! # 数据布局（小端）
//!
//! ```text
//! [timestamp: u32][count: i32][count × (sensor: i32, datatype: i32, value: i32)]
//! ```
//!
//! # 并发约定
//!
//! - 可用字节数是原子计数器：`put` 以一次原子操作预留空间，`get` 读完后归还
//! - 支持多个生产者：预留成功后在写游标锁内依次写入
//! - 每个完整数据包对应一次计数信号（`Mutex<usize>` + `Condvar`）
//! - `put` 空间不足时立即返回 [`QueueError::Full`]，从不阻塞、从不写入半个包
//! - `clear` 采用请求/确认握手：消费者发出请求，生产者在下一次 `put` 或
//!   [`QueueProducer::service_clear`] 时执行复位并确认

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use fieldline_protocol::{DataPacket, Sample};
use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::error::QueueError;
use crate::signal::Event;

/// 默认容量：64 MiB
pub const DEFAULT_QUEUE_CAPACITY: usize = 1 << 26;

/// `clear` 等待生产者确认的最长时间
pub const CLEAR_ACK_TIMEOUT: Duration = Duration::from_secs(2);

const PACKET_HEADER_LEN: usize = DataPacket::HEADER_LEN;

struct RingInner {
    capacity: usize,
    storage: Mutex<Box<[u8]>>,
    /// 写游标（仅生产者推进）
    write_pos: Mutex<usize>,
    /// 读游标（仅消费者推进）
    read_pos: Mutex<usize>,
    free_bytes: AtomicUsize,
    /// 计数信号：已写入但尚未读取的完整包数
    packets: Mutex<usize>,
    packets_cond: Condvar,
    producers: AtomicUsize,
    clear_requested: AtomicBool,
    clear_done: Event,
}

impl RingInner {
    /// 复位全部游标与计数
    ///
    /// 锁顺序：read_pos → write_pos → packets
    fn reset_all(&self) {
        let mut read_pos = self.read_pos.lock();
        let mut write_pos = self.write_pos.lock();
        let mut packets = self.packets.lock();
        *read_pos = 0;
        *write_pos = 0;
        *packets = 0;
        self.free_bytes.store(self.capacity, Ordering::Release);
    }

    fn acknowledge_clear(&self) -> bool {
        if self
            .clear_requested
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.reset_all();
            self.clear_done.set();
            trace!("Ring buffer cleared by producer");
            true
        } else {
            false
        }
    }
}

/// 环形缓冲区（消费者端）
///
/// 克隆得到的句柄共享同一块缓冲区。
#[derive(Clone)]
pub struct RingBufferQueue {
    inner: Arc<RingInner>,
}

impl RingBufferQueue {
    /// 使用默认容量创建
    pub fn new() -> Result<Self, QueueError> {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// 创建指定容量（字节）的缓冲区
    pub fn with_capacity(capacity: usize) -> Result<Self, QueueError> {
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| QueueError::Allocation(capacity))?;
        storage.resize(capacity, 0u8);

        Ok(Self {
            inner: Arc::new(RingInner {
                capacity,
                storage: Mutex::new(storage.into_boxed_slice()),
                write_pos: Mutex::new(0),
                read_pos: Mutex::new(0),
                free_bytes: AtomicUsize::new(capacity),
                packets: Mutex::new(0),
                packets_cond: Condvar::new(),
                producers: AtomicUsize::new(0),
                clear_requested: AtomicBool::new(false),
                clear_done: Event::new(),
            }),
        })
    }

    /// 创建生产者句柄
    pub fn producer(&self) -> QueueProducer {
        self.inner.producers.fetch_add(1, Ordering::AcqRel);
        QueueProducer {
            inner: self.inner.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// 当前可用字节数
    pub fn free_bytes(&self) -> usize {
        self.inner.free_bytes.load(Ordering::Acquire)
    }

    /// 待读取的完整包数
    pub fn len(&self) -> usize {
        *self.inner.packets.lock()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 取出一个数据包
    ///
    /// `block = false` 时不等待；否则最多等待 `timeout`。
    /// 超时或无数据时返回 `None`。
    pub fn get(&self, block: bool, timeout: Duration) -> Option<DataPacket> {
        {
            let mut packets = self.inner.packets.lock();
            if block {
                let deadline = Instant::now() + timeout;
                while *packets == 0 {
                    if self
                        .inner
                        .packets_cond
                        .wait_until(&mut packets, deadline)
                        .timed_out()
                        && *packets == 0
                    {
                        return None;
                    }
                }
            } else if *packets == 0 {
                return None;
            }
            *packets -= 1;
        }

        let mut read_pos = self.inner.read_pos.lock();
        let storage = self.inner.storage.lock();
        let capacity = self.inner.capacity;

        let mut header = [0u8; PACKET_HEADER_LEN];
        copy_out(&storage, *read_pos, &mut header);
        let timestamp = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let count = i32::from_le_bytes([header[4], header[5], header[6], header[7]]).max(0) as usize;

        let mut pos = (*read_pos + PACKET_HEADER_LEN) % capacity;
        let mut samples = Vec::with_capacity(count);
        let mut record = [0u8; Sample::ENCODED_LEN];
        for _ in 0..count {
            copy_out(&storage, pos, &mut record);
            pos = (pos + Sample::ENCODED_LEN) % capacity;
            samples.push(Sample::new(
                i32::from_le_bytes([record[0], record[1], record[2], record[3]]),
                i32::from_le_bytes([record[4], record[5], record[6], record[7]]),
                i32::from_le_bytes([record[8], record[9], record[10], record[11]]),
            ));
        }
        *read_pos = pos;
        drop(storage);
        drop(read_pos);

        let size = PACKET_HEADER_LEN + count * Sample::ENCODED_LEN;
        self.inner.free_bytes.fetch_add(size, Ordering::AcqRel);
        Some(DataPacket { timestamp, samples })
    }

    /// 清空缓冲区
    ///
    /// 有生产者时发出清空请求并等待确认（最多 [`CLEAR_ACK_TIMEOUT`]）；
    /// 没有生产者或等待超时时直接复位。
    pub fn clear(&self) {
        self.clear_with_timeout(CLEAR_ACK_TIMEOUT);
    }

    pub fn clear_with_timeout(&self, timeout: Duration) {
        let inner = &self.inner;
        inner.clear_done.clear();
        inner.clear_requested.store(true, Ordering::Release);

        if inner.producers.load(Ordering::Acquire) == 0 {
            inner.acknowledge_clear();
            return;
        }
        if !inner.clear_done.wait_timeout(timeout) {
            warn!(
                "Ring buffer clear was not acknowledged by the producer within {:?}, resetting directly",
                timeout
            );
            inner.acknowledge_clear();
        }
    }
}

/// 环形缓冲区生产者端
pub struct QueueProducer {
    inner: Arc<RingInner>,
}

impl QueueProducer {
    /// 写入一个数据包
    ///
    /// 空间不足时返回 [`QueueError::Full`]，缓冲区内容保持不变。
    pub fn put(&self, packet: &DataPacket) -> Result<(), QueueError> {
        self.inner.acknowledge_clear();

        let inner = &self.inner;
        let size = packet.encoded_len();
        // 先原子地预留空间，多个生产者不会同时通过检查
        if let Err(available) =
            inner
                .free_bytes
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |free| {
                    free.checked_sub(size)
                })
        {
            return Err(QueueError::Full {
                requested: size,
                available,
            });
        }

        let mut write_pos = inner.write_pos.lock();
        {
            let mut storage = inner.storage.lock();
            let capacity = inner.capacity;
            let mut header = [0u8; PACKET_HEADER_LEN];
            header[..4].copy_from_slice(&packet.timestamp.to_le_bytes());
            header[4..].copy_from_slice(&(packet.samples.len() as i32).to_le_bytes());
            copy_in(&mut storage, *write_pos, &header);

            let mut pos = (*write_pos + PACKET_HEADER_LEN) % capacity;
            let mut record = [0u8; Sample::ENCODED_LEN];
            for s in &packet.samples {
                record[..4].copy_from_slice(&s.sensor.to_le_bytes());
                record[4..8].copy_from_slice(&s.datatype.to_le_bytes());
                record[8..].copy_from_slice(&s.value.to_le_bytes());
                copy_in(&mut storage, pos, &record);
                pos = (pos + Sample::ENCODED_LEN) % capacity;
            }
            *write_pos = pos;
        }

        // 持有写游标时计数，包信号顺序与写入顺序一致
        let mut packets = inner.packets.lock();
        *packets += 1;
        inner.packets_cond.notify_one();
        drop(packets);
        drop(write_pos);
        Ok(())
    }

    /// 处理挂起的清空请求（接收循环每轮调用）
    pub fn service_clear(&self) -> bool {
        self.inner.acknowledge_clear()
    }

    pub fn free_bytes(&self) -> usize {
        self.inner.free_bytes.load(Ordering::Acquire)
    }
}

impl Drop for QueueProducer {
    fn drop(&mut self) {
        self.inner.producers.fetch_sub(1, Ordering::AcqRel);
    }
}

fn copy_in(storage: &mut [u8], pos: usize, data: &[u8]) {
    let first = data.len().min(storage.len() - pos);
    storage[pos..pos + first].copy_from_slice(&data[..first]);
    storage[..data.len() - first].copy_from_slice(&data[first..]);
}

fn copy_out(storage: &[u8], pos: usize, out: &mut [u8]) {
    let first = out.len().min(storage.len() - pos);
    out[..first].copy_from_slice(&storage[pos..pos + first]);
    let rest = out.len() - first;
    out[first..].copy_from_slice(&storage[..rest]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn packet(ts: u32, n: usize) -> DataPacket {
        DataPacket::new(
            ts,
            (0..n)
                .map(|i| Sample::new(i as i32 + 1, 28, ts as i32 * 100 - i as i32))
                .collect(),
        )
    }

    #[test]
    fn test_put_get_fifo() {
        let queue = RingBufferQueue::with_capacity(1024).unwrap();
        let producer = queue.producer();
        for ts in 1..=5 {
            producer.put(&packet(ts, 3)).unwrap();
        }
        assert_eq!(queue.len(), 5);
        for ts in 1..=5 {
            assert_eq!(queue.get(false, Duration::ZERO), Some(packet(ts, 3)));
        }
        assert_eq!(queue.get(false, Duration::ZERO), None);
        assert_eq!(queue.free_bytes(), 1024);
    }

    #[test]
    fn test_wraparound_preserves_packets() {
        // 8 + 2×12 = 32 字节/包；容量 100 迫使头部和采样都跨越边界
        let queue = RingBufferQueue::with_capacity(100).unwrap();
        let producer = queue.producer();
        for ts in 0..40 {
            producer.put(&packet(ts, 2)).unwrap();
            producer.put(&packet(ts + 1000, 2)).unwrap();
            assert_eq!(queue.get(false, Duration::ZERO), Some(packet(ts, 2)));
            assert_eq!(queue.get(false, Duration::ZERO), Some(packet(ts + 1000, 2)));
        }
        assert_eq!(queue.free_bytes(), 100);
    }

    #[test]
    fn test_full_never_writes_partial_packet() {
        let queue = RingBufferQueue::with_capacity(64).unwrap();
        let producer = queue.producer();
        producer.put(&packet(1, 3)).unwrap(); // 44 字节
        assert_eq!(queue.free_bytes(), 20);

        let err = producer.put(&packet(2, 2)).unwrap_err(); // 32 字节
        assert_eq!(
            err,
            QueueError::Full {
                requested: 32,
                available: 20
            }
        );
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.free_bytes(), 20);
        assert_eq!(queue.get(false, Duration::ZERO), Some(packet(1, 3)));
    }

    #[test]
    fn test_packet_larger_than_capacity_is_full() {
        let queue = RingBufferQueue::with_capacity(16).unwrap();
        let producer = queue.producer();
        assert!(matches!(
            producer.put(&packet(1, 1)),
            Err(QueueError::Full { requested: 20, .. })
        ));
    }

    #[test]
    fn test_blocking_get_times_out_when_empty() {
        let queue = RingBufferQueue::with_capacity(64).unwrap();
        let start = Instant::now();
        assert_eq!(queue.get(true, Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_blocking_get_wakes_on_put() {
        let queue = RingBufferQueue::with_capacity(256).unwrap();
        let producer = queue.producer();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.put(&packet(7, 1)).unwrap();
        });
        assert_eq!(queue.get(true, Duration::from_secs(2)), Some(packet(7, 1)));
        writer.join().unwrap();
    }

    #[test]
    fn test_clear_without_producer_resets_directly() {
        let queue = RingBufferQueue::with_capacity(128).unwrap();
        {
            let producer = queue.producer();
            producer.put(&packet(1, 2)).unwrap();
            producer.put(&packet(2, 2)).unwrap();
        }
        queue.clear();
        assert_eq!(queue.get(false, Duration::ZERO), None);
        assert_eq!(queue.free_bytes(), 128);
    }

    #[test]
    fn test_clear_handshake_with_live_producer() {
        let queue = RingBufferQueue::with_capacity(256).unwrap();
        let producer = queue.producer();
        producer.put(&packet(1, 2)).unwrap();
        producer.put(&packet(2, 2)).unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let writer = {
            let running = running.clone();
            thread::spawn(move || {
                while running.load(Ordering::Acquire) {
                    producer.service_clear();
                    thread::sleep(Duration::from_millis(1));
                }
                producer
            })
        };

        let start = Instant::now();
        queue.clear();
        assert!(start.elapsed() < CLEAR_ACK_TIMEOUT);
        assert_eq!(queue.get(false, Duration::ZERO), None);
        assert_eq!(queue.free_bytes(), 256);

        running.store(false, Ordering::Release);
        let producer = writer.join().unwrap();

        // 清空后从头写入
        producer.put(&packet(3, 1)).unwrap();
        assert_eq!(queue.get(false, Duration::ZERO), Some(packet(3, 1)));
    }

    #[test]
    fn test_clear_times_out_with_idle_producer() {
        let queue = RingBufferQueue::with_capacity(128).unwrap();
        let producer = queue.producer();
        producer.put(&packet(1, 1)).unwrap();

        queue.clear_with_timeout(Duration::from_millis(20));
        assert_eq!(queue.get(false, Duration::ZERO), None);
        assert_eq!(queue.free_bytes(), 128);
        drop(producer);
    }
}
