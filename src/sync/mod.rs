//! Concurrency primitives for cooperative agent loops.
//!
//! Each running engine owns one [`EngineControls`] bundle shared with the
//! lifecycle registry:
//!
//! - [`StopFlag`]: one-shot stop request, checked at two points per iteration.
//! - [`PauseGate`]: binary gate the loop blocks on while paused.
//! - [`TickWake`]: resettable wake signal so a resume or interrupt takes
//!   effect immediately instead of on the next timer tick.
//! - [`InterruptChannel`]: FIFO queue of opaque guidance payloads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, mpsc, watch};

/// One-shot stop request. Once set it is never cleared.
#[derive(Debug)]
pub struct StopFlag {
    flag: AtomicBool,
}

impl StopFlag {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    /// Request a stop. Idempotent.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Binary pause gate. Starts open (not paused).
///
/// Resuming while the owning loop is stopping still releases the gate so
/// the loop can observe the stop flag and exit.
#[derive(Debug)]
pub struct PauseGate {
    // true = paused (gate closed)
    paused: watch::Sender<bool>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self { paused }
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Block until the gate is open. Returns immediately when not paused.
    pub async fn wait_open(&self) {
        let mut rx = self.paused.subscribe();
        while *rx.borrow_and_update() {
            // The sender lives as long as self; a closed channel can only
            // happen in shutdown races, where an open gate is the safe read.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Resettable wake signal for the loop's idle wait.
///
/// Setting while already set is idempotent (a single stored permit), and the
/// permit is consumed on wake so timer-driven wakeups do not busy-spin.
#[derive(Debug)]
pub struct TickWake {
    notify: Notify,
}

impl TickWake {
    pub fn new() -> Self {
        Self {
            notify: Notify::new(),
        }
    }

    /// Wake a waiting loop, or store a single permit for the next wait.
    pub fn set(&self) {
        self.notify.notify_one();
    }

    /// Wait until the signal is set or the timeout elapses, whichever is
    /// first. Consumes the stored permit on a signal wake.
    pub async fn wait_for(&self, timeout: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }
}

impl Default for TickWake {
    fn default() -> Self {
        Self::new()
    }
}

/// Unbounded FIFO queue of guidance payloads.
///
/// Guidance is opaque to the channel: a string, a structured map, or null.
#[derive(Debug)]
pub struct InterruptChannel {
    tx: mpsc::UnboundedSender<Value>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
}

impl InterruptChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn push(&self, guidance: Value) {
        // The receiver is owned by self, so the channel can't close under us.
        let _ = self.tx.send(guidance);
    }

    /// Drain everything currently queued, in FIFO order.
    pub async fn drain(&self) -> Vec<Value> {
        let mut rx = self.rx.lock().await;
        let mut out = Vec::new();
        while let Ok(g) = rx.try_recv() {
            out.push(g);
        }
        out
    }
}

impl Default for InterruptChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// The control surface shared between a running engine and the registry.
#[derive(Debug, Default)]
pub struct EngineControls {
    pub stop: StopFlag,
    pub pause: PauseGate,
    pub wake: TickWake,
    pub interrupts: InterruptChannel,
}

impl EngineControls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue guidance and wake the loop immediately.
    pub fn interrupt(&self, guidance: Value) {
        self.interrupts.push(guidance);
        self.wake.set();
    }

    /// Open the pause gate and wake the loop so it does not wait out the
    /// remainder of a timer interval.
    pub fn resume(&self) {
        self.pause.resume();
        self.wake.set();
    }

    pub fn pause(&self) {
        self.pause.pause();
    }

    /// Request a cooperative stop and wake the loop so shutdown latency is
    /// bounded by the destroy grace period, not the loop interval.
    pub fn request_stop(&self) {
        self.stop.set();
        self.wake.set();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stop_flag_is_one_shot() {
        let flag = StopFlag::new();
        assert!(!flag.is_set());
        flag.set();
        flag.set();
        assert!(flag.is_set());
    }

    #[tokio::test]
    async fn pause_gate_starts_open() {
        let gate = PauseGate::new();
        assert!(!gate.is_paused());
        // Must not block.
        gate.wait_open().await;
    }

    #[tokio::test]
    async fn pause_gate_blocks_until_resumed() {
        let gate = std::sync::Arc::new(PauseGate::new());
        gate.pause();
        assert!(gate.is_paused());

        let g = gate.clone();
        let waiter = tokio::spawn(async move { g.wait_open().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should release after resume")
            .unwrap();
    }

    #[tokio::test]
    async fn tick_wake_stores_a_permit() {
        let wake = TickWake::new();
        wake.set();
        wake.set();
        // First wait returns immediately off the stored permit.
        tokio::time::timeout(
            Duration::from_millis(50),
            wake.wait_for(Duration::from_secs(60)),
        )
        .await
        .expect("stored permit should wake immediately");
    }

    #[tokio::test]
    async fn tick_wake_times_out_without_signal() {
        let wake = TickWake::new();
        let start = std::time::Instant::now();
        wake.wait_for(Duration::from_millis(30)).await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn interrupt_channel_preserves_fifo_order() {
        let ch = InterruptChannel::new();
        ch.push(json!({"n": 1}));
        ch.push(json!("two"));
        ch.push(Value::Null);

        let drained = ch.drain().await;
        assert_eq!(drained, vec![json!({"n": 1}), json!("two"), Value::Null]);
        assert!(ch.drain().await.is_empty());
    }

    #[tokio::test]
    async fn controls_interrupt_wakes_waiter() {
        let ctl = std::sync::Arc::new(EngineControls::new());
        let c = ctl.clone();
        let waiter = tokio::spawn(async move {
            c.wake.wait_for(Duration::from_secs(60)).await;
            c.interrupts.drain().await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctl.interrupt(json!({"subject": "cats"}));

        let drained = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("interrupt should wake the waiter")
            .unwrap();
        assert_eq!(drained.len(), 1);
    }
}
