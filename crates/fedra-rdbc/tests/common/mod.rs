//! Shared test doubles: a controllable in-memory connection factory and a
//! recording transaction manager.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use fedra_rdbc::prelude::*;

/// Raw connection whose liveness is flipped from the test via the shared
/// factory switch.
pub struct MockConnection {
    pub id: usize,
    valid: Arc<AtomicBool>,
    probes: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    xa_handle: Option<MockXaHandle>,
}

pub struct MockXaHandle;

impl XaResource for MockXaHandle {}

#[async_trait]
impl RawConnection for MockConnection {
    async fn is_valid(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.valid.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn xa_resource(&self) -> Option<&dyn XaResource> {
        self.xa_handle.as_ref().map(|h| h as &dyn XaResource)
    }
}

/// Factory with per-test knobs: XA support, scripted open failures, slow
/// opens, a global liveness switch, and open/close/probe accounting.
pub struct MockFactory {
    xa: bool,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
    probes: Arc<AtomicUsize>,
    valid: Arc<AtomicBool>,
    fail_opens: AtomicUsize,
    open_delay: Mutex<Duration>,
}

impl MockFactory {
    fn build(xa: bool) -> Arc<Self> {
        Arc::new(Self {
            xa,
            opened: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            probes: Arc::new(AtomicUsize::new(0)),
            valid: Arc::new(AtomicBool::new(true)),
            fail_opens: AtomicUsize::new(0),
            open_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    pub fn xa() -> Arc<Self> {
        Self::build(true)
    }

    /// Fail the next `n` open attempts.
    pub fn fail_next_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Delay every open by `delay`.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    /// Flip liveness of every connection from this factory.
    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn open(&self, _identity: &Identity) -> Result<Box<dyn RawConnection>> {
        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted_failure = self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(Error::connection("scripted open failure"));
        }

        let id = self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            id,
            valid: self.valid.clone(),
            probes: self.probes.clone(),
            closed: self.closed.clone(),
            xa_handle: self.xa.then_some(MockXaHandle),
        }))
    }

    fn supports_xa(&self) -> bool {
        self.xa
    }

    fn source_name(&self) -> &str {
        "mock"
    }
}

/// Transaction manager double that records every registered completion.
#[derive(Default)]
pub struct MockTxnManager {
    completions: Mutex<Vec<TransactionCompletion>>,
}

impl MockTxnManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of completions registered so far.
    pub fn registered(&self) -> usize {
        self.completions.lock().len()
    }

    /// The most recently registered completion.
    pub fn latest(&self) -> Option<TransactionCompletion> {
        self.completions.lock().last().cloned()
    }
}

impl TransactionManager for MockTxnManager {
    fn register_completion(&self, _txn: &TxnId, completion: TransactionCompletion) {
        self.completions.lock().push(completion);
    }
}
