//! Control connection keep-alive
//!
//! One background task for the whole process writes a NUL byte to every
//! registered control connection at a fixed interval, so idle sessions are
//! not dropped by firewalls. Targets that are closed, or whose write fails,
//! are evicted without disturbing the others.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// A connection the service can probe.
#[async_trait]
pub trait KeepAliveTarget: Send + Sync {
    fn is_open(&self) -> bool;

    /// Writes the keep-alive byte.
    async fn send_keepalive(&self) -> io::Result<()>;
}

type Registry = Arc<Mutex<HashMap<u64, Arc<dyn KeepAliveTarget>>>>;

pub struct KeepAliveService {
    interval: Duration,
    targets: Registry,
    next_id: AtomicU64,
    running: Mutex<Option<(mpsc::Sender<()>, JoinHandle<()>)>>,
}

impl Default for KeepAliveService {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

impl KeepAliveService {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            targets: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            running: Mutex::new(None),
        }
    }

    /// Starts the background loop. Calling it again while running is a
    /// no-op. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            debug!("Keep-alive service already running");
            return;
        }

        let (quit_sender, mut quit_receiver) = mpsc::channel::<()>(1);
        let targets = Arc::clone(&self.targets);
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // will tick immediately
            loop {
                tokio::select! {
                    _ = quit_receiver.recv() => break,
                    _ = interval.tick() => probe_all(&targets).await,
                }
            }
            debug!("Keep-alive loop stopped");
        });

        info!("Keep-alive service started ({:?} interval)", period);
        *running = Some((quit_sender, handle));
    }

    /// Stops the background loop and waits for it to finish.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((quit_sender, handle)) = running {
            let _ = quit_sender.send(()).await;
            if let Err(e) = handle.await {
                warn!("Keep-alive loop ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Adds a target and returns the id to unregister it with.
    pub fn register(&self, target: Arc<dyn KeepAliveTarget>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        targets.insert(id, target);
        debug!("Keep-alive registry size (+): {}", targets.len());
        id
    }

    pub fn unregister(&self, id: u64) -> bool {
        let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = targets.remove(&id).is_some();
        debug!("Keep-alive registry size (-): {}", targets.len());
        removed
    }

    pub fn len(&self) -> usize {
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs one probe round immediately.
    pub async fn probe_now(&self) {
        probe_all(&self.targets).await;
    }
}

/// Probes a snapshot of the registry, so targets can come and go while
/// the round is in progress.
async fn probe_all(targets: &Registry) {
    let snapshot: Vec<(u64, Arc<dyn KeepAliveTarget>)> = targets
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(id, target)| (*id, Arc::clone(target)))
        .collect();

    let mut evicted = Vec::new();
    for (id, target) in snapshot {
        if !target.is_open() {
            evicted.push(id);
            continue;
        }
        if let Err(e) = target.send_keepalive().await {
            warn!("Keep-alive write failed, dropping target {}: {}", id, e);
            evicted.push(id);
        }
    }

    if !evicted.is_empty() {
        let mut targets = targets.lock().unwrap_or_else(PoisonError::into_inner);
        for id in evicted {
            targets.remove(&id);
        }
        debug!("Keep-alive registry size (-): {}", targets.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct Probe {
        closed: AtomicBool,
        failing: AtomicBool,
        sent: AtomicUsize,
    }

    #[async_trait]
    impl KeepAliveTarget for Probe {
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        async fn send_keepalive(&self) -> io::Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn closed_and_failing_targets_are_evicted() {
        let service = KeepAliveService::new(Duration::from_secs(3600));
        let healthy = Arc::new(Probe::default());
        let closed = Arc::new(Probe::default());
        let failing = Arc::new(Probe::default());
        closed.closed.store(true, Ordering::SeqCst);
        failing.failing.store(true, Ordering::SeqCst);

        service.register(healthy.clone());
        service.register(closed.clone());
        service.register(failing.clone());
        assert_eq!(service.len(), 3);

        service.probe_now().await;
        assert_eq!(service.len(), 1);
        assert_eq!(healthy.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn background_loop_probes_and_stops() {
        let service = KeepAliveService::new(Duration::from_millis(20));
        let target = Arc::new(Probe::default());
        let id = service.register(target.clone());

        service.start();
        service.start();
        tokio::time::sleep(Duration::from_millis(120)).await;
        service.stop().await;
        assert!(!service.is_running());

        let sent = target.sent.load(Ordering::SeqCst);
        assert!(sent >= 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(target.sent.load(Ordering::SeqCst), sent);

        assert!(service.unregister(id));
        assert!(service.is_empty());
    }
}
