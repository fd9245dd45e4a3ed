use crate::types::DropPolicy;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// キャプチャキューを生成
///
/// オーディオドライバのコールバックとアキュムレータループの間の
/// 有界ハンドオフ。プロデューサ側 (コールバック) は決してブロックせず、
/// 満杯時はドロップポリシーに従ってブロックを破棄する。
///
/// # Arguments
///
/// * `capacity` - キューの最大ブロック数 (0不可)
/// * `policy` - 満杯時のドロップポリシー
pub fn capture_queue(capacity: usize, policy: DropPolicy) -> (CaptureProducer, CaptureConsumer) {
    let (tx, rx) = bounded(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    let producer = CaptureProducer {
        tx,
        rx: rx.clone(),
        policy,
        dropped: Arc::clone(&dropped),
    };
    let consumer = CaptureConsumer { rx, dropped };
    (producer, consumer)
}

/// キャプチャキューのプロデューサ側
///
/// cpal のコールバックスレッドから呼ばれるため、`push` は
/// いかなる場合もブロックしない。
pub struct CaptureProducer {
    tx: Sender<Vec<f32>>,
    rx: Receiver<Vec<f32>>,
    policy: DropPolicy,
    dropped: Arc<AtomicU64>,
}

impl CaptureProducer {
    /// サンプルブロックを投入 (非ブロッキング)
    ///
    /// キューが満杯の場合はドロップポリシーに従う:
    ///
    /// - `DropOldest`: 最古のブロックを1つ取り出してから再投入する
    /// - `DropNewest`: 投入しようとしたブロックを破棄する
    pub fn push(&self, block: Vec<f32>) {
        match self.tx.try_send(block) {
            Ok(()) => {}
            Err(TrySendError::Full(block)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                match self.policy {
                    DropPolicy::DropOldest => {
                        // 最古のブロックを捨てて空きを作る。コンシューマと
                        // 競合して再び満杯の場合は諦めて破棄する
                        let _ = self.rx.try_recv();
                        if self.tx.try_send(block).is_err() {
                            log::warn!("キャプチャキューが満杯のためブロックを破棄しました");
                        }
                    }
                    DropPolicy::DropNewest => {
                        drop(block);
                    }
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                // コンシューマ終了後のコールバックは無視する
            }
        }
    }

    /// これまでに破棄されたブロック数
    pub fn dropped_blocks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// キャプチャキューのコンシューマ側
pub struct CaptureConsumer {
    rx: Receiver<Vec<f32>>,
    dropped: Arc<AtomicU64>,
}

impl CaptureConsumer {
    /// タイムアウト付きでブロックを取り出す
    ///
    /// タイムアウトまたはプロデューサ切断時は None を返す。
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Vec<f32>> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// ブロッキングせずに取り出しを試みる
    pub fn try_pop(&self) -> Option<Vec<f32>> {
        match self.rx.try_recv() {
            Ok(block) => Some(block),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// これまでに破棄されたブロック数
    pub fn dropped_blocks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_in_order() {
        let (producer, consumer) = capture_queue(4, DropPolicy::DropOldest);
        producer.push(vec![1.0]);
        producer.push(vec![2.0]);
        assert_eq!(consumer.try_pop(), Some(vec![1.0]));
        assert_eq!(consumer.try_pop(), Some(vec![2.0]));
        assert_eq!(consumer.try_pop(), None);
    }

    #[test]
    fn test_drop_oldest_keeps_newest() {
        let (producer, consumer) = capture_queue(2, DropPolicy::DropOldest);
        producer.push(vec![1.0]);
        producer.push(vec![2.0]);
        // 満杯。最古 (1.0) が破棄され 3.0 が入る
        producer.push(vec![3.0]);

        assert_eq!(producer.dropped_blocks(), 1);
        assert_eq!(consumer.try_pop(), Some(vec![2.0]));
        assert_eq!(consumer.try_pop(), Some(vec![3.0]));
        assert_eq!(consumer.try_pop(), None);
    }

    #[test]
    fn test_drop_newest_keeps_oldest() {
        let (producer, consumer) = capture_queue(2, DropPolicy::DropNewest);
        producer.push(vec![1.0]);
        producer.push(vec![2.0]);
        // 満杯。投入しようとした 3.0 が破棄される
        producer.push(vec![3.0]);

        assert_eq!(producer.dropped_blocks(), 1);
        assert_eq!(consumer.try_pop(), Some(vec![1.0]));
        assert_eq!(consumer.try_pop(), Some(vec![2.0]));
        assert_eq!(consumer.try_pop(), None);
    }

    #[test]
    fn test_pop_timeout_returns_none_when_empty() {
        let (_producer, consumer) = capture_queue(2, DropPolicy::DropOldest);
        let start = std::time::Instant::now();
        assert_eq!(consumer.pop_timeout(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_push_never_blocks_when_full() {
        let (producer, _consumer) = capture_queue(1, DropPolicy::DropOldest);
        // コンシューマが一切取り出さなくても push は即座に返る
        for i in 0..100 {
            producer.push(vec![i as f32]);
        }
        assert_eq!(producer.dropped_blocks(), 99);
    }
}
