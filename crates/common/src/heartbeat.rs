//! Heartbeat counter reconciliation

/// Server-side counter update for a reported client counter.
///
/// Equal counters advance by one. A lagging client is answered with the
/// unchanged server counter; a client ahead of the server wins.
pub fn reconcile(server: u64, client: u64) -> u64 {
    if client == server {
        server.saturating_add(1)
    } else {
        server.max(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_counters_advance() {
        assert_eq!(reconcile(0, 0), 1);
        assert_eq!(reconcile(7, 7), 8);
    }

    #[test]
    fn test_lagging_client_keeps_server() {
        assert_eq!(reconcile(5, 2), 5);
    }

    #[test]
    fn test_leading_client_is_adopted() {
        assert_eq!(reconcile(3, 9), 9);
    }

    #[test]
    fn test_saturates() {
        assert_eq!(reconcile(u64::MAX, u64::MAX), u64::MAX);
    }
}
