use tokio::sync::mpsc;

use crate::cache::Collection;
use crate::jobs::types::JobStatus;

/// Progress notifications emitted by the coordinators
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  /// Collection was stale and is being refetched
  SyncStarted { collection: Collection },
  /// Collection now matches the remote set
  Reconciled {
    collection: Collection,
    pruned: usize,
    upserted: usize,
  },
  /// Remote unreachable, cached data served instead
  ServedOffline {
    collection: Collection,
    reason: String,
  },
  /// Governed query refused until the cooldown passes
  QueryDeferred { scope: String, wait_minutes: i64 },
  WriteQueued { order_number: i64 },
  WriteDelivered { order_number: i64 },
  /// Delivery attempt failed; `attempts` counts every failure so far
  WriteFailed {
    order_number: i64,
    attempts: u32,
    error: String,
  },
  /// Item exhausted its retries and was moved behind the rest of the queue
  WriteDeferred { from: i64, to: i64 },
  JobUpdated {
    parameter_key: String,
    status: JobStatus,
    elapsed_secs: u64,
  },
}

/// Optional sender side of the event channel. Sending never blocks or fails.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
  tx: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl EventSink {
  /// A sink that drops every event
  pub fn disabled() -> Self {
    Self { tx: None }
  }

  /// Create a connected sink and its receiving stream
  pub fn channel() -> (Self, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx: Some(tx) }, EventStream { rx })
  }

  pub fn emit(&self, event: SyncEvent) {
    if let Some(tx) = &self.tx {
      // Receiver may have been dropped
      let _ = tx.send(event);
    }
  }
}

/// Receiving side of the event channel
pub struct EventStream {
  rx: mpsc::UnboundedReceiver<SyncEvent>,
}

impl EventStream {
  /// Receive the next event
  pub async fn next(&mut self) -> Option<SyncEvent> {
    self.rx.recv().await
  }

  /// Drain whatever is buffered without waiting
  pub fn drain(&mut self) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = self.rx.try_recv() {
      events.push(event);
    }
    events
  }
}
