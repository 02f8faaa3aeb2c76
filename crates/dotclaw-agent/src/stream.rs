//! Streaming delivery from the sandboxed agent to the chat.
//!
//! The container writes sequential `chunk_NNNNNN.txt` files plus a `done` or
//! `error` sentinel into a per-run directory. [`ChunkWatcher`] consumes them
//! in order (filesystem-notify wake-ups with a polling fallback) and
//! performs a bounded grace drain after the sentinel to catch chunks that
//! raced it. [`StreamDelivery`] turns the chunks into one chat message that
//! is edited in place at a bounded rate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::Watcher;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use dotclaw_core::port::{ChatPort, MessageRef};

use crate::error::{AgentError, Result};

/// Polling floor — intervals below this just burn CPU.
const POLL_FLOOR_MS: u64 = 25;
/// Post-sentinel grace drain: this many consecutive empty polls end the
/// stream.
const GRACE_DRAIN_MISSES: u32 = 3;

/// One observation from the stream directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEvent {
    Text(String),
    Done,
    Error(String),
}

/// Ordered consumer of a container's chunk directory.
pub struct ChunkWatcher {
    dir: PathBuf,
    poll: Duration,
    next_index: u64,
    /// Keeps the notify watcher alive; events only wake the poll loop early.
    _watcher: Option<notify::RecommendedWatcher>,
    wake_rx: mpsc::Receiver<()>,
}

impl ChunkWatcher {
    /// Watch `dir` with the given poll interval (floored to 25 ms). The
    /// notify backend is best-effort — when it cannot be set up the watcher
    /// degrades to pure polling.
    pub fn new(dir: PathBuf, poll_interval: Duration) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(8);
        let watcher = match notify::recommended_watcher(move |res| {
            if res.is_ok() {
                let _ = wake_tx.try_send(());
            }
        }) {
            Ok(mut w) => match w.watch(&dir, notify::RecursiveMode::NonRecursive) {
                Ok(()) => Some(w),
                Err(e) => {
                    debug!(dir = %dir.display(), "fs notify unavailable, polling only: {e}");
                    None
                }
            },
            Err(e) => {
                debug!("fs notify unavailable, polling only: {e}");
                None
            }
        };
        Self {
            dir,
            poll: poll_interval.max(Duration::from_millis(POLL_FLOOR_MS)),
            next_index: 1,
            _watcher: watcher,
            wake_rx,
        }
    }

    fn chunk_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("chunk_{index:06}.txt"))
    }

    /// Consume the next in-order chunk, if present on disk.
    fn try_take_chunk(&mut self) -> Result<Option<String>> {
        let path = self.chunk_path(self.next_index);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        // Consumed chunks are removed; orphans are maintenance's problem.
        let _ = std::fs::remove_file(&path);
        self.next_index += 1;
        Ok(Some(text))
    }

    /// Next event from the stream. Chunks always win over a sentinel so
    /// nothing written before termination is lost; after a sentinel the
    /// grace drain re-checks a few times for chunks that raced it.
    pub async fn next_event(&mut self) -> Result<ChunkEvent> {
        loop {
            if let Some(text) = self.try_take_chunk()? {
                return Ok(ChunkEvent::Text(text));
            }

            let error_path = self.dir.join("error");
            if error_path.exists() {
                if let Some(text) = self.grace_drain().await? {
                    return Ok(ChunkEvent::Text(text));
                }
                let message = std::fs::read_to_string(&error_path)
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                return Ok(ChunkEvent::Error(if message.is_empty() {
                    "agent terminated with an error".to_string()
                } else {
                    message
                }));
            }
            if self.dir.join("done").exists() {
                if let Some(text) = self.grace_drain().await? {
                    return Ok(ChunkEvent::Text(text));
                }
                return Ok(ChunkEvent::Done);
            }

            tokio::select! {
                _ = self.wake_rx.recv() => {}
                _ = tokio::time::sleep(self.poll) => {}
            }
        }
    }

    /// After a sentinel: retry up to [`GRACE_DRAIN_MISSES`] times, each a
    /// poll interval apart, for a chunk the filesystem scheduled late.
    async fn grace_drain(&mut self) -> Result<Option<String>> {
        let mut misses = 0;
        loop {
            if let Some(text) = self.try_take_chunk()? {
                return Ok(Some(text));
            }
            misses += 1;
            if misses >= GRACE_DRAIN_MISSES {
                return Ok(None);
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    /// Drain the whole stream to a single string (non-streaming callers).
    pub async fn collect_to_end(&mut self) -> Result<String> {
        let mut out = String::new();
        loop {
            match self.next_event().await? {
                ChunkEvent::Text(t) => out.push_str(&t),
                ChunkEvent::Done => return Ok(out),
                ChunkEvent::Error(e) => return Err(AgentError::Stream(e)),
            }
        }
    }
}

/// Rate-limited delivery of accumulating text into one chat message.
pub struct StreamDelivery {
    chat: Arc<dyn ChatPort>,
    chat_id: String,
    edit_interval: Duration,
    max_edit_len: usize,
    acc: String,
    message: Option<MessageRef>,
    last_flush: Option<tokio::time::Instant>,
    /// Length of `acc` at the last flush, to skip no-op edits.
    flushed_len: usize,
}

impl StreamDelivery {
    pub fn new(
        chat: Arc<dyn ChatPort>,
        chat_id: &str,
        edit_interval: Duration,
        max_edit_len: usize,
    ) -> Self {
        Self {
            chat,
            chat_id: chat_id.to_string(),
            edit_interval,
            max_edit_len: max_edit_len.max(1),
            acc: String::new(),
            message: None,
            last_flush: None,
            flushed_len: 0,
        }
    }

    /// Append streamed text; flushes when the edit interval has elapsed.
    pub async fn push(&mut self, text: &str) {
        self.acc.push_str(text);
        let due = match self.last_flush {
            Some(at) => at.elapsed() >= self.edit_interval,
            None => true,
        };
        if due {
            self.flush().await;
        }
    }

    /// First flush sends a fresh message; later flushes edit in place. Text
    /// over the edit cap is truncated while streaming — the overflow is
    /// resolved at finalization. Delivery failures are logged, not fatal.
    async fn flush(&mut self) {
        if self.acc.len() == self.flushed_len {
            return;
        }
        let visible = truncate_to_boundary(&self.acc, self.max_edit_len);
        if visible.is_empty() {
            return;
        }
        match &self.message {
            None => match self.chat.send_message(&self.chat_id, visible).await {
                Ok(msg_ref) => {
                    self.message = Some(msg_ref);
                    self.flushed_len = self.acc.len();
                }
                Err(e) => warn!(chat_id = %self.chat_id, "stream send failed: {e}"),
            },
            Some(msg_ref) => {
                match self.chat.edit_message(&self.chat_id, msg_ref, visible).await {
                    Ok(()) => self.flushed_len = self.acc.len(),
                    Err(e) => warn!(chat_id = %self.chat_id, "stream edit failed: {e}"),
                }
            }
        }
        self.last_flush = Some(tokio::time::Instant::now());
    }

    /// Final flush. Overflow past the edit cap is sent as a follow-up
    /// message instead of being cut. Returns the full accumulated text.
    pub async fn finalize(mut self) -> String {
        if self.acc.is_empty() {
            return self.acc;
        }
        let head = truncate_to_boundary(&self.acc, self.max_edit_len).to_string();
        match &self.message {
            None => {
                if let Err(e) = self.chat.send_message(&self.chat_id, &head).await {
                    warn!(chat_id = %self.chat_id, "final stream send failed: {e}");
                }
            }
            Some(msg_ref) => {
                if let Err(e) = self.chat.edit_message(&self.chat_id, msg_ref, &head).await {
                    warn!(chat_id = %self.chat_id, "final stream edit failed: {e}");
                }
            }
        }
        if self.acc.len() > head.len() {
            let remainder = &self.acc[head.len()..];
            if let Err(e) = self.chat.send_message(&self.chat_id, remainder).await {
                warn!(chat_id = %self.chat_id, "stream overflow send failed: {e}");
            }
        }
        self.acc
    }

    /// Abort path: delete the partial message best-effort.
    pub async fn cleanup(self) {
        if let Some(msg_ref) = &self.message {
            if let Err(e) = self.chat.delete_message(&self.chat_id, msg_ref).await {
                debug!(chat_id = %self.chat_id, "partial message cleanup failed: {e}");
            }
        }
    }
}

fn truncate_to_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dotclaw_core::port::PortError;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum ChatCall {
        Send(String),
        Edit(String, String),
        Delete(String),
    }

    struct FakeChat {
        calls: Mutex<Vec<ChatCall>>,
    }

    impl FakeChat {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }
        fn calls(&self) -> Vec<ChatCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatPort for FakeChat {
        async fn send_message(
            &self,
            _chat_id: &str,
            text: &str,
        ) -> std::result::Result<MessageRef, PortError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(ChatCall::Send(text.to_string()));
            Ok(MessageRef(format!("m{}", calls.len())))
        }
        async fn edit_message(
            &self,
            _chat_id: &str,
            message: &MessageRef,
            text: &str,
        ) -> std::result::Result<(), PortError> {
            self.calls
                .lock()
                .unwrap()
                .push(ChatCall::Edit(message.0.clone(), text.to_string()));
            Ok(())
        }
        async fn delete_message(
            &self,
            _chat_id: &str,
            message: &MessageRef,
        ) -> std::result::Result<(), PortError> {
            self.calls
                .lock()
                .unwrap()
                .push(ChatCall::Delete(message.0.clone()));
            Ok(())
        }
        async fn send_file(
            &self,
            _chat_id: &str,
            _path: &std::path::Path,
            _caption: Option<&str>,
        ) -> std::result::Result<(), PortError> {
            Ok(())
        }
    }

    fn write_chunk(dir: &std::path::Path, index: u64, text: &str) {
        std::fs::write(dir.join(format!("chunk_{index:06}.txt")), text).unwrap();
    }

    #[tokio::test]
    async fn chunks_consumed_in_order_then_done() {
        let dir = tempfile::tempdir().unwrap();
        // Written out of order — consumption is by index.
        write_chunk(dir.path(), 2, "world");
        write_chunk(dir.path(), 1, "hello ");
        std::fs::write(dir.path().join("done"), "").unwrap();

        let mut w = ChunkWatcher::new(dir.path().to_path_buf(), Duration::from_millis(25));
        assert_eq!(w.next_event().await.unwrap(), ChunkEvent::Text("hello ".into()));
        assert_eq!(w.next_event().await.unwrap(), ChunkEvent::Text("world".into()));
        assert_eq!(w.next_event().await.unwrap(), ChunkEvent::Done);
    }

    #[tokio::test]
    async fn error_sentinel_carries_message() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("error"), "container exploded\n").unwrap();
        let mut w = ChunkWatcher::new(dir.path().to_path_buf(), Duration::from_millis(25));
        assert_eq!(
            w.next_event().await.unwrap(),
            ChunkEvent::Error("container exploded".into())
        );
    }

    #[tokio::test]
    async fn grace_drain_catches_chunk_racing_the_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("done"), "").unwrap();

        let path = dir.path().to_path_buf();
        // Land a chunk shortly after the sentinel is observed.
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            write_chunk(&path, 1, "late chunk");
        });

        let mut w = ChunkWatcher::new(dir.path().to_path_buf(), Duration::from_millis(25));
        let collected = w.collect_to_end().await.unwrap();
        writer.await.unwrap();
        assert_eq!(collected, "late chunk");
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_sends_then_edits_in_place() {
        let chat = FakeChat::new();
        let mut d = StreamDelivery::new(chat.clone(), "c1", Duration::from_millis(500), 1000);

        d.push("Hello").await; // first flush sends
        tokio::time::sleep(Duration::from_millis(100)).await;
        d.push(" wor").await; // inside interval — accumulate only
        tokio::time::sleep(Duration::from_millis(500)).await;
        d.push("ld").await; // interval elapsed — edit
        let full = d.finalize().await;

        assert_eq!(full, "Hello world");
        let calls = chat.calls();
        assert_eq!(calls[0], ChatCall::Send("Hello".into()));
        assert_eq!(calls[1], ChatCall::Edit("m1".into(), "Hello world".into()));
        // Finalize with no new text is a no-op edit of identical content.
        assert_eq!(calls.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_spills_to_a_second_message() {
        let chat = FakeChat::new();
        let mut d = StreamDelivery::new(chat.clone(), "c1", Duration::from_millis(10), 10);
        d.push("0123456789ABCDEF").await;
        let _ = d.finalize().await;

        let calls = chat.calls();
        // Streaming flush truncates at the cap; finalize keeps the head in
        // place and ships the remainder as a fresh message.
        assert_eq!(calls[0], ChatCall::Send("0123456789".into()));
        assert!(calls.contains(&ChatCall::Send("ABCDEF".into())));
    }

    #[tokio::test]
    async fn cleanup_deletes_partial_message() {
        let chat = FakeChat::new();
        let mut d = StreamDelivery::new(chat.clone(), "c1", Duration::from_millis(10), 1000);
        d.push("partial").await;
        d.cleanup().await;

        let calls = chat.calls();
        assert_eq!(calls[0], ChatCall::Send("partial".into()));
        assert_eq!(calls[1], ChatCall::Delete("m1".into()));
    }
}
