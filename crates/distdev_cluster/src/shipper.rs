//! Installing callables on every worker, at most once per identity.

use crate::remote::{CallOptions, ShippedUnit};
use crate::task::Callable;
use async_trait::async_trait;
use distdev_core::ClusterResult;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Sends one install call to every worker
#[async_trait]
pub trait UnitInstaller: Send + Sync {
    /// Number of install calls one [`install`](Self::install) issues
    fn workers(&self) -> usize;

    /// Install `unit` on every worker, failing with the lowest failing rank's error
    async fn install(&self, unit: &ShippedUnit, options: &CallOptions) -> ClusterResult<()>;
}

/// Memo of callables already installed cluster-wide
#[derive(Debug, Default)]
pub struct CodeShipper {
    shipped: Mutex<HashSet<Uuid>>,
    installs_sent: AtomicUsize,
}

impl CodeShipper {
    /// Create an empty memo
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `callable` available on every worker.
    ///
    /// A callable whose identity was shipped before is not sent again. The
    /// identity is remembered only when every worker installed it.
    ///
    /// # Errors
    ///
    /// Returns the installer's error; the callable stays unshipped
    pub async fn ship(
        &self,
        callable: &Callable,
        installer: &dyn UnitInstaller,
        options: &CallOptions,
    ) -> ClusterResult<()> {
        let mut shipped = self.shipped.lock().await;
        if shipped.contains(&callable.id()) {
            tracing::trace!(name = callable.name(), "callable already shipped");
            return Ok(());
        }

        self.installs_sent
            .fetch_add(installer.workers(), Ordering::Relaxed);
        installer.install(&callable.unit(), options).await?;

        shipped.insert(callable.id());
        tracing::debug!(name = callable.name(), "callable shipped to all workers");
        Ok(())
    }

    /// Whether `callable` has been shipped
    pub async fn is_shipped(&self, callable: &Callable) -> bool {
        self.shipped.lock().await.contains(&callable.id())
    }

    /// Total install calls issued so far
    #[must_use]
    pub fn installs_sent(&self) -> usize {
        self.installs_sent.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distdev_core::{ClusterError, Rank, RemoteError, RemoteErrorKind};
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct FakeInstaller {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl UnitInstaller for FakeInstaller {
        fn workers(&self) -> usize {
            3
        }

        async fn install(&self, unit: &ShippedUnit, _options: &CallOptions) -> ClusterResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ClusterError::Remote {
                    rank: Rank::new(1),
                    error: RemoteError::new(RemoteErrorKind::Install, unit.name.clone()),
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_second_ship_is_noop() {
        let shipper = CodeShipper::new();
        let installer = FakeInstaller::default();
        let f = Callable::registered("square");

        shipper.ship(&f, &installer, &CallOptions::new()).await.unwrap();
        shipper.ship(&f.clone(), &installer, &CallOptions::new()).await.unwrap();

        assert_eq!(installer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(shipper.installs_sent(), 3);
        assert!(shipper.is_shipped(&f).await);
    }

    #[tokio::test]
    async fn test_distinct_identities_ship_separately() {
        let shipper = CodeShipper::new();
        let installer = FakeInstaller::default();

        shipper
            .ship(&Callable::script("f", "1"), &installer, &CallOptions::new())
            .await
            .unwrap();
        shipper
            .ship(&Callable::script("f", "1"), &installer, &CallOptions::new())
            .await
            .unwrap();

        assert_eq!(shipper.installs_sent(), 6);
    }

    #[tokio::test]
    async fn test_failed_ship_is_not_memoized() {
        let shipper = CodeShipper::new();
        let installer = FakeInstaller::default();
        installer.fail.store(true, Ordering::SeqCst);
        let f = Callable::registered("broken");

        let err = shipper.ship(&f, &installer, &CallOptions::new()).await.unwrap_err();
        assert_eq!(err.remote().map(|(rank, _)| rank), Some(Rank::new(1)));
        assert!(!shipper.is_shipped(&f).await);

        installer.fail.store(false, Ordering::SeqCst);
        shipper.ship(&f, &installer, &CallOptions::new()).await.unwrap();
        assert_eq!(installer.calls.load(Ordering::SeqCst), 2);
        assert!(shipper.is_shipped(&f).await);
    }
}
