//! Memory-pressure monitor and subscriptions

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::Result;

use super::probe::{classify, MemoryProbe};

/// Memory pressure as seen by a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum PressureLevel {
    #[default]
    None = 0,
    Soft = 1,
    Hard = 2,
}

impl PressureLevel {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PressureLevel::None,
            1 => PressureLevel::Soft,
            _ => PressureLevel::Hard,
        }
    }
}

struct Watchdog {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

struct MonitorInner {
    subscribers: Mutex<HashMap<u64, Arc<AtomicU8>>>,
    next_id: AtomicU64,
    watchdog: Mutex<Option<Watchdog>>,
}

impl MonitorInner {
    fn signal(&self, level: PressureLevel) {
        if level == PressureLevel::None {
            return;
        }
        for flag in self.subscribers.lock().values() {
            flag.fetch_max(level as u8, Ordering::SeqCst);
        }
    }
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        // The watchdog may hold the last strong reference, so never join here
        if let Some(watchdog) = self.watchdog.get_mut().take() {
            let _ = watchdog.shutdown.send(());
        }
    }
}

/// Process-wide memory-pressure broadcaster
///
/// Cloning is cheap; every clone refers to the same subscriber set.
#[derive(Clone)]
pub struct MemoryMonitor {
    inner: Arc<MonitorInner>,
}

impl MemoryMonitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                watchdog: Mutex::new(None),
            }),
        }
    }

    /// Raise `level` on every subscriber
    ///
    /// A pending level is only ever raised, never lowered, until the
    /// subscriber takes it.
    pub fn signal(&self, level: PressureLevel) {
        tracing::debug!("Memory pressure signal: {:?}", level);
        self.inner.signal(level);
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> PressureSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let flag = Arc::new(AtomicU8::new(PressureLevel::None as u8));
        self.inner.subscribers.lock().insert(id, Arc::clone(&flag));

        PressureSubscription {
            id,
            flag,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Start sampling memory every `interval` on a background thread
    ///
    /// Replaces a watchdog that is already running.
    pub fn start_watchdog(
        &self,
        mut probe: Box<dyn MemoryProbe>,
        interval: Duration,
        soft_pct: f64,
        hard_pct: f64,
    ) -> Result<()> {
        self.stop_watchdog();

        let (shutdown, ticks) = channel::bounded::<()>(1);
        let monitor = Arc::downgrade(&self.inner);

        let handle = thread::Builder::new()
            .name("atlasdoc-watchdog".to_string())
            .spawn(move || loop {
                match ticks.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }

                let Some(inner) = monitor.upgrade() else {
                    break;
                };

                match probe.sample() {
                    Ok(sample) => {
                        let level = classify(&sample, soft_pct, hard_pct);
                        if level != PressureLevel::None {
                            tracing::warn!(
                                "Low memory: {:.1}% available, signalling {:?} pressure",
                                sample.available_pct(),
                                level
                            );
                            inner.signal(level);
                        }
                    }
                    Err(e) => tracing::warn!("Memory probe failed: {}", e),
                }
            })?;

        tracing::info!(
            "Memory watchdog started (interval {:?}, soft {}%, hard {}%)",
            interval,
            soft_pct,
            hard_pct
        );

        *self.inner.watchdog.lock() = Some(Watchdog { shutdown, handle });
        Ok(())
    }

    /// Stop the watchdog thread, waiting for it to exit
    pub fn stop_watchdog(&self) {
        let watchdog = self.inner.watchdog.lock().take();
        if let Some(watchdog) = watchdog {
            let _ = watchdog.shutdown.send(());
            if watchdog.handle.join().is_err() {
                tracing::error!("Memory watchdog thread panicked");
            }
            tracing::info!("Memory watchdog stopped");
        }
    }

    pub fn watchdog_running(&self) -> bool {
        self.inner.watchdog.lock().is_some()
    }
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's view of the pressure signal
///
/// Holds only a weak reference to the monitor and unregisters itself when
/// dropped.
pub struct PressureSubscription {
    id: u64,
    flag: Arc<AtomicU8>,
    monitor: Weak<MonitorInner>,
}

impl PressureSubscription {
    /// Level waiting to be handled, without consuming it
    pub fn pending(&self) -> PressureLevel {
        PressureLevel::from_u8(self.flag.load(Ordering::SeqCst))
    }

    /// Consume the pending level, resetting it to `None`
    pub fn take(&self) -> PressureLevel {
        PressureLevel::from_u8(self.flag.swap(PressureLevel::None as u8, Ordering::SeqCst))
    }

    /// Unregister from the monitor
    pub fn close(self) {}
}

impl Drop for PressureSubscription {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.subscribers.lock().remove(&self.id);
        }
    }
}
