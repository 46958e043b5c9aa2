// Copyright 2025-2026 Aurora Radar Group

//! Per-sequence work streams and timing events.
//!
//! A `Stream` is the host-side image of a device stream: a dedicated worker
//! draining a FIFO of enqueued operations, so one sequence's copies,
//! kernels and callbacks run in order while different sequences overlap
//! freely. An `Event` is a timestamp recorded in stream order.
//!
//! Callbacks enqueued on a stream must not block on device work; anything
//! beyond trivial messaging belongs on a short-lived worker thread spawned
//! from the callback.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{unbounded, Sender};

use crate::GpuError;

enum Op {
    Exec(Box<dyn FnOnce() + Send + 'static>),
    Shutdown,
}

/// An in-order work queue owned by exactly one sequence.
pub struct Stream {
    tx: Sender<Op>,
    handle: Option<JoinHandle<()>>,
}

impl Stream {
    pub fn new(label: &str) -> Result<Self, GpuError> {
        let (tx, rx) = unbounded::<Op>();
        let handle = thread::Builder::new()
            .name(format!("stream-{}", label))
            .spawn(move || {
                for op in rx.iter() {
                    match op {
                        Op::Exec(f) => f(),
                        Op::Shutdown => break,
                    }
                }
            })
            .map_err(|e| GpuError::Device(format!("failed to spawn stream thread: {}", e)))?;
        Ok(Stream {
            tx,
            handle: Some(handle),
        })
    }

    /// Enqueue an operation. Ordering is FIFO with everything previously
    /// enqueued on this stream. After destruction this is a no-op.
    pub fn exec<F: FnOnce() + Send + 'static>(&self, f: F) {
        let _ = self.tx.send(Op::Exec(Box::new(f)));
    }

    /// Enqueue an event record; the stamp lands when every prior operation
    /// on the stream has finished.
    pub fn record(&self, event: &Event) {
        let ev = event.clone();
        self.exec(move || ev.record());
    }

    /// Flush the queue and join the worker. Called from the finalisation
    /// worker; if ever invoked from an op on this very stream it degrades
    /// to a detach so the worker cannot join itself.
    pub fn destroy(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.tx.send(Op::Shutdown);
        if let Some(handle) = self.handle.take() {
            if thread::current().id() == handle.thread().id() {
                return;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A one-shot timestamp, recorded at most once, observable from any thread.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

struct EventInner {
    stamp: Mutex<Option<Instant>>,
    recorded: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Event {
            inner: Arc::new(EventInner {
                stamp: Mutex::new(None),
                recorded: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        match self.inner.stamp.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stamp the event with the current time. The first record wins.
    pub fn record(&self) {
        let mut stamp = self.lock();
        if stamp.is_none() {
            *stamp = Some(Instant::now());
        }
        drop(stamp);
        self.inner.recorded.notify_all();
    }

    /// The stamp, if the event has fired.
    pub fn query(&self) -> Option<Instant> {
        *self.lock()
    }

    /// Block until the event fires. The only blocking call the pipeline
    /// makes outside channel sends, bounded by kernel latency.
    pub fn synchronize(&self) -> Instant {
        let mut stamp = self.lock();
        loop {
            if let Some(t) = *stamp {
                return t;
            }
            stamp = match self.inner.recorded.wait(stamp) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Milliseconds from this event to a later one; `None` until both have
    /// fired.
    pub fn elapsed_ms_until(&self, later: &Event) -> Option<f32> {
        let start = self.query()?;
        let stop = later.query()?;
        Some(stop.duration_since(start).as_secs_f64() as f32 * 1000.0)
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
