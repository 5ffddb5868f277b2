//! Notification channel - idle worker を起こすための共有シグナル
//!
//! `WakeSignal` は世代カウンタ（`watch<u64>`）。worker は fetch の直前に
//! `mark_seen()` し、空振りしたら `wait(timeout)` する。mark 以降に
//! `notify()` が一度でもあれば即座に返るので、fetch と wait の隙間で
//! 起きた通知を取りこぼさない。余計な起床は無害（再 fetch するだけ）。
//!
//! 通知の経路（transport）が使えなくても timeout polling で正しさは変わらない。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

const ANY_QUEUE: &str = "spindle_any_queue";
const QUEUE_PREFIX: &str = "spindle_queue#";

/// A notification channel a worker pool listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    AnyQueue,
    Queue(String),
}

impl Channel {
    /// Channels to watch for a queue filter (`None` = every queue).
    pub fn for_queues(queues: Option<&[String]>) -> Vec<Channel> {
        match queues {
            None => vec![Channel::AnyQueue],
            Some(queues) => queues.iter().cloned().map(Channel::Queue).collect(),
        }
    }

    /// Transport-level name (`spindle_any_queue`, `spindle_queue#<name>`).
    pub fn name(&self) -> String {
        match self {
            Channel::AnyQueue => ANY_QUEUE.to_string(),
            Channel::Queue(queue) => format!("{QUEUE_PREFIX}{queue}"),
        }
    }

    pub fn matches_queue(&self, queue: &str) -> bool {
        match self {
            Channel::AnyQueue => true,
            Channel::Queue(name) => name == queue,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WakeSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl WakeSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Wake every listener currently waiting, and any that waits later
    /// without having marked this generation as seen.
    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub fn subscribe(&self) -> WakeListener {
        WakeListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-loop view of a `WakeSignal`.
#[derive(Debug)]
pub struct WakeListener {
    rx: watch::Receiver<u64>,
}

impl WakeListener {
    pub fn mark_seen(&mut self) {
        self.rx.borrow_and_update();
    }

    /// Wait for a notification newer than the last `mark_seen`.
    /// Returns `false` on timeout.
    pub async fn wait(&mut self, timeout: Duration) -> bool {
        matches!(tokio::time::timeout(timeout, self.rx.changed()).await, Ok(Ok(())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn channel_names() {
        assert_eq!(Channel::AnyQueue.name(), "spindle_any_queue");
        assert_eq!(Channel::Queue("mail".into()).name(), "spindle_queue#mail");
    }

    #[rstest]
    #[case::any(Channel::AnyQueue, "mail", true)]
    #[case::same(Channel::Queue("mail".into()), "mail", true)]
    #[case::other(Channel::Queue("mail".into()), "sms", false)]
    fn channel_matching(#[case] channel: Channel, #[case] queue: &str, #[case] matches: bool) {
        assert_eq!(channel.matches_queue(queue), matches);
    }

    #[test]
    fn channels_for_queue_filter() {
        assert_eq!(Channel::for_queues(None), vec![Channel::AnyQueue]);
        let queues = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            Channel::for_queues(Some(&queues)),
            vec![Channel::Queue("a".into()), Channel::Queue("b".into())]
        );
    }

    #[tokio::test]
    async fn notify_between_mark_and_wait_is_not_lost() {
        let signal = WakeSignal::new();
        let mut listener = signal.subscribe();

        listener.mark_seen();
        signal.notify();
        assert!(listener.wait(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn wait_times_out_without_notification() {
        let signal = WakeSignal::new();
        let mut listener = signal.subscribe();
        listener.mark_seen();
        assert!(!listener.wait(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn one_notify_wakes_every_waiting_listener() {
        let signal = WakeSignal::new();
        let mut a = signal.subscribe();
        let mut b = signal.subscribe();
        a.mark_seen();
        b.mark_seen();

        let wait_a = tokio::spawn(async move { a.wait(Duration::from_secs(5)).await });
        let wait_b = tokio::spawn(async move { b.wait(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        signal.notify();

        assert!(wait_a.await.unwrap());
        assert!(wait_b.await.unwrap());
    }
}
