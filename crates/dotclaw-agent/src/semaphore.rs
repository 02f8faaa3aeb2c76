//! Lane-aware admission control for agent runs.
//!
//! All agent executions pass through one [`LaneSemaphore`]. Release order is
//! not FIFO: waiters are picked by lane priority, with two fairness guards —
//! a starvation override for non-interactive waiters that have sat too long,
//! and a cap on consecutive interactive dispatches.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use dotclaw_core::port::Lane;

use crate::error::AgentError;

#[derive(Debug, Clone)]
pub struct SemaphoreConfig {
    /// Maximum concurrently held permits.
    pub limit: usize,
    /// Zero queues indefinitely; otherwise acquire rejects after this long.
    pub queue_timeout: Duration,
    /// A non-interactive waiter older than this preempts lane priority.
    pub lane_starvation: Duration,
    /// After this many interactive dispatches in a row, a queued
    /// non-interactive waiter goes first.
    pub max_consecutive_interactive: u32,
}

impl SemaphoreConfig {
    pub fn from_concurrency(cfg: &dotclaw_core::config::ConcurrencyConfig) -> Self {
        Self {
            limit: cfg.max_agents.max(1),
            queue_timeout: Duration::from_millis(cfg.queue_timeout_ms),
            lane_starvation: Duration::from_millis(cfg.lane_starvation_ms),
            max_consecutive_interactive: cfg.max_consecutive_interactive,
        }
    }
}

struct Waiter {
    lane: Lane,
    seq: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<Permit>,
}

struct State {
    available: usize,
    queue: Vec<Waiter>,
    next_seq: u64,
    consecutive_interactive: u32,
}

struct Inner {
    state: Mutex<State>,
    cfg: SemaphoreConfig,
}

/// Priority semaphore bounding concurrent agent runs across lanes.
pub struct LaneSemaphore {
    inner: Arc<Inner>,
}

/// A held execution slot. Dropping it releases exactly once and hands the
/// slot to the next waiter per the pick rules.
pub struct Permit {
    inner: Arc<Inner>,
    released: bool,
}

impl LaneSemaphore {
    pub fn new(cfg: SemaphoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    available: cfg.limit,
                    queue: Vec::new(),
                    next_seq: 0,
                    consecutive_interactive: 0,
                }),
                cfg,
            }),
        }
    }

    /// Acquire a slot on `lane`. The fast path only applies when capacity is
    /// free *and* nobody is queued, so a queued waiter can never be
    /// overtaken by a fresh arrival.
    pub async fn acquire(&self, lane: Lane) -> Result<Permit, AgentError> {
        let queued = {
            let mut st = self.inner.state.lock().unwrap();
            if st.available > 0 && st.queue.is_empty() {
                st.available -= 1;
                note_dispatch(&mut st, lane);
                return Ok(Permit {
                    inner: Arc::clone(&self.inner),
                    released: false,
                });
            }
            let (tx, rx) = oneshot::channel();
            let seq = st.next_seq;
            st.next_seq += 1;
            st.queue.push(Waiter {
                lane,
                seq,
                enqueued_at: Instant::now(),
                tx,
            });
            debug!(%lane, seq, queued = st.queue.len(), "agent run queued");
            (seq, rx)
        };
        let (seq, rx) = queued;

        let timeout = self.inner.cfg.queue_timeout;
        if timeout.is_zero() {
            return rx.await.map_err(|_| AgentError::AdmissionClosed);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(AgentError::AdmissionClosed),
            Err(_) => {
                // Remove our entry if it is still queued. If it is gone, a
                // permit was dispatched concurrently; dropping the dead `rx`
                // drops that permit, whose Drop re-releases the slot.
                let mut st = self.inner.state.lock().unwrap();
                st.queue.retain(|w| w.seq != seq);
                Err(AgentError::QueueTimeout {
                    ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Number of permits currently held (for metrics/tests).
    pub fn in_use(&self) -> usize {
        let st = self.inner.state.lock().unwrap();
        self.inner.cfg.limit - st.available
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }
}

impl Permit {
    /// Neutralize the permit without releasing (used when a hand-off target
    /// disappeared and the slot is being re-handed in the same pass).
    fn defuse(mut self) {
        self.released = true;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            release(&self.inner);
        }
    }
}

fn release(inner: &Arc<Inner>) {
    loop {
        let waiter = {
            let mut st = inner.state.lock().unwrap();
            match pick_next(&st, &inner.cfg) {
                Some(idx) => {
                    let w = st.queue.remove(idx);
                    note_dispatch(&mut st, w.lane);
                    Some(w)
                }
                None => {
                    st.available += 1;
                    None
                }
            }
        };
        let Some(waiter) = waiter else { return };
        let permit = Permit {
            inner: Arc::clone(inner),
            released: false,
        };
        match waiter.tx.send(permit) {
            Ok(()) => return,
            // Receiver timed out between pick and send: keep the slot and
            // hand it to the next waiter instead of recursing through Drop.
            Err(permit) => permit.defuse(),
        }
    }
}

fn note_dispatch(st: &mut State, lane: Lane) {
    if lane == Lane::Interactive {
        st.consecutive_interactive += 1;
    } else {
        st.consecutive_interactive = 0;
    }
}

/// Pick the next waiter index:
/// 1. starvation override — oldest-starved non-interactive lanes, highest
///    priority then earliest seq;
/// 2. interactive-burst cap — best non-interactive when the cap is hit;
/// 3. otherwise min `(-priority, seq)`.
fn pick_next(st: &State, cfg: &SemaphoreConfig) -> Option<usize> {
    if st.queue.is_empty() {
        return None;
    }
    let now = Instant::now();

    let best_non_interactive = st
        .queue
        .iter()
        .enumerate()
        .filter(|(_, w)| w.lane != Lane::Interactive)
        .min_by_key(|(_, w)| (std::cmp::Reverse(w.lane.priority()), w.seq))
        .map(|(i, _)| i);

    let starved = st
        .queue
        .iter()
        .enumerate()
        .filter(|(_, w)| {
            w.lane != Lane::Interactive
                && now.duration_since(w.enqueued_at) >= cfg.lane_starvation
        })
        .min_by_key(|(_, w)| (std::cmp::Reverse(w.lane.priority()), w.seq))
        .map(|(i, _)| i);
    if let Some(idx) = starved {
        return Some(idx);
    }

    if st.consecutive_interactive >= cfg.max_consecutive_interactive {
        if let Some(idx) = best_non_interactive {
            return Some(idx);
        }
    }

    st.queue
        .iter()
        .enumerate()
        .min_by_key(|(_, w)| (std::cmp::Reverse(w.lane.priority()), w.seq))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sem(limit: usize) -> Arc<LaneSemaphore> {
        Arc::new(LaneSemaphore::new(SemaphoreConfig {
            limit,
            queue_timeout: Duration::ZERO,
            lane_starvation: Duration::from_millis(500),
            max_consecutive_interactive: 5,
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn bound_is_never_exceeded() {
        let s = sem(3);
        let held = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let s = s.clone();
            let held = held.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = s.acquire(Lane::Interactive).await.unwrap();
                let n = held.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(n, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                held.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(s.in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn starved_scheduled_preempts_newer_interactive() {
        let s = sem(1);
        let holder = s.acquire(Lane::Interactive).await.unwrap();

        // T=0: a scheduled run queues up.
        let s2 = s.clone();
        let scheduled = tokio::spawn(async move {
            let _p = s2.acquire(Lane::Scheduled).await.unwrap();
            tokio::time::Instant::now()
        });
        tokio::task::yield_now().await;
        assert_eq!(s.queue_depth(), 1);

        // T=600 (past the 500ms starvation bound): an interactive run queues.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let s3 = s.clone();
        let interactive = tokio::spawn(async move {
            let _p = s3.acquire(Lane::Interactive).await.unwrap();
            tokio::time::Instant::now()
        });
        tokio::task::yield_now().await;
        assert_eq!(s.queue_depth(), 2);

        // Release: the starved scheduled entry wins despite lower priority.
        drop(holder);
        let scheduled_at = scheduled.await.unwrap();
        let interactive_at = interactive.await.unwrap();
        assert!(scheduled_at <= interactive_at);
    }

    #[tokio::test(start_paused = true)]
    async fn interactive_burst_cap_yields_to_scheduled() {
        let s = Arc::new(LaneSemaphore::new(SemaphoreConfig {
            limit: 1,
            queue_timeout: Duration::ZERO,
            lane_starvation: Duration::from_secs(3600), // never starves in test
            max_consecutive_interactive: 2,
        }));
        let order = Arc::new(Mutex::new(Vec::new()));

        // Dispatch #1 (fast path) — consecutive = 1.
        let holder = s.acquire(Lane::Interactive).await.unwrap();

        let mut spawn = |lane: Lane, tag: &'static str| {
            let s = s.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let _p = s.acquire(lane).await.unwrap();
                order.lock().unwrap().push(tag);
                tokio::time::sleep(Duration::from_millis(5)).await;
            })
        };
        let h1 = spawn(Lane::Interactive, "i2");
        tokio::task::yield_now().await;
        let h2 = spawn(Lane::Scheduled, "s1");
        tokio::task::yield_now().await;
        let h3 = spawn(Lane::Interactive, "i3");
        tokio::task::yield_now().await;

        drop(holder);
        for h in [h1, h2, h3] {
            h.await.unwrap();
        }
        // i2 dispatches (consecutive = 2), then the cap forces s1 before i3.
        assert_eq!(*order.lock().unwrap(), ["i2", "s1", "i3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_timeout_rejects_instead_of_waiting() {
        let s = Arc::new(LaneSemaphore::new(SemaphoreConfig {
            limit: 1,
            queue_timeout: Duration::from_millis(100),
            lane_starvation: Duration::from_millis(500),
            max_consecutive_interactive: 5,
        }));
        let holder = s.acquire(Lane::Interactive).await.unwrap();

        let err = s.acquire(Lane::Scheduled).await.unwrap_err();
        assert!(matches!(err, AgentError::QueueTimeout { ms: 100 }));
        assert_eq!(s.queue_depth(), 0);

        // The held slot is unaffected and still releases cleanly.
        drop(holder);
        assert_eq!(s.in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_path_skipped_while_queue_nonempty() {
        let s = sem(2);
        let p1 = s.acquire(Lane::Interactive).await.unwrap();
        let p2 = s.acquire(Lane::Interactive).await.unwrap();

        // Queue a maintenance run while full.
        let s2 = s.clone();
        let queued = tokio::spawn(async move { s2.acquire(Lane::Maintenance).await.unwrap() });
        tokio::task::yield_now().await;

        drop(p1);
        let _maintenance = queued.await.unwrap();
        // The freed slot went to the queued waiter, not back to capacity.
        assert_eq!(s.in_use(), 2);
        drop(p2);
    }
}
