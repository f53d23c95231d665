use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::connector::RouteConnector;
use crate::routes::store::RouteStore;

/// Refreshes every route's remaining balance from its provider.
///
/// Never changes Enabled/Disabled status; whether a zero balance takes a
/// route out of rotation is the routing collaborator's policy. One route's
/// query failure never blocks the others; the stale balance is kept until
/// the next successful probe.
pub struct BalanceProber {
    store: RouteStore,
    connector: Arc<dyn RouteConnector>,
    timeout: Duration,
}

impl BalanceProber {
    pub fn new(store: RouteStore, connector: Arc<dyn RouteConnector>, timeout: Duration) -> Self {
        Self {
            store,
            connector,
            timeout,
        }
    }

    /// Refresh every route once. Returns the number of balances updated.
    pub async fn refresh_all(&self) -> usize {
        let routes = match self.store.list_all() {
            Ok(routes) => routes,
            Err(e) => {
                error!(error = %e, "Balance sweep could not list routes");
                return 0;
            }
        };

        let results = futures::future::join_all(routes.iter().map(|route| async {
            self.connector.balance(route, self.timeout).await
        }))
        .await;

        let mut updated = 0;
        for (route, result) in routes.iter().zip(results) {
            match result {
                Ok(balance) => match self.store.update_balance(&route.id, balance) {
                    Ok(()) => {
                        debug!(route = %route.name, balance, "Balance refreshed");
                        updated += 1;
                    }
                    Err(e) => {
                        warn!(route = %route.name, error = %e, "Balance write failed")
                    }
                },
                Err(e) => {
                    warn!(route = %route.name, error = %e, "Balance query failed, keeping stale value");
                }
            }
        }
        updated
    }

    /// Periodic refresh loop.
    pub async fn run(self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let updated = self.refresh_all().await;
            debug!(updated, "Balance sweep complete");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
