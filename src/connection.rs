use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared count of in-flight client connections for one front-end
#[derive(Debug, Default, Clone)]
pub struct ActiveConnections {
    count: Arc<AtomicUsize>,
}

impl ActiveConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; the slot is released when the guard drops.
    pub fn acquire(&self) -> ConnectionGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            count: Arc::clone(&self.count),
            decremented: false,
        }
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

/// RAII guard to ensure connection count is properly decremented
#[derive(Debug)]
pub struct ConnectionGuard {
    count: Arc<AtomicUsize>,
    decremented: bool,
}

impl ConnectionGuard {
    /// Manually decrement the connection counter
    pub fn decrement(&mut self) {
        if !self.decremented {
            self.count.fetch_sub(1, Ordering::AcqRel);
            self.decremented = true;
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.decrement();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_guard() {
        let active = ActiveConnections::new();
        {
            let _guard = active.acquire();
            assert_eq!(active.get(), 1);
            let _second = active.acquire();
            assert_eq!(active.get(), 2);
        }

        // Guards should automatically decrement on drop
        assert_eq!(active.get(), 0);
    }

    #[test]
    fn test_connection_guard_manual_decrement() {
        let active = ActiveConnections::new();
        {
            let mut guard = active.acquire();
            guard.decrement();
            assert_eq!(active.get(), 0);

            // Second decrement should be no-op
            guard.decrement();
            assert_eq!(active.get(), 0);
        }

        // Drop should not decrement again
        assert_eq!(active.get(), 0);
    }

    #[test]
    fn clones_share_the_count() {
        let active = ActiveConnections::new();
        let view = active.clone();
        let _guard = active.acquire();
        assert_eq!(view.get(), 1);
    }
}
