//! Same-host consolidation over the persisted store
//!
//! Scrapes often yield many ports on one IP. When such a group is mostly unverified or
//! dead, its ports are swept and provably dead duplicates are dropped.

use crate::config::EngineConfig;
use crate::database::ProxyStore;
use crate::proxy::liveness::PortProbe;
use crate::proxy::models::{ProxyRecord, ProxyStatus};
use crate::Result;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Change applied identically to every backing store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Delete(String),
    SetStatus(String, ProxyStatus),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationSummary {
    pub groups: usize,
    pub deleted: usize,
    pub marked_open: usize,
    pub marked_dead: usize,
}

/// Members worth sweeping: never touch rows a checker has already validated
fn needs_sweep(record: &ProxyRecord) -> bool {
    matches!(
        record.status,
        None | Some(ProxyStatus::Dead) | Some(ProxyStatus::PortClosed) | Some(ProxyStatus::Untested)
    )
}

/// Decide what happens to a swept group given `(address, port_open)` per member
pub fn plan(results: &[(String, bool)]) -> Vec<Mutation> {
    let any_open = results.iter().any(|(_, open)| *open);

    if !any_open {
        return results
            .iter()
            .enumerate()
            .map(|(i, (address, _))| {
                if i == 0 {
                    Mutation::SetStatus(address.clone(), ProxyStatus::Dead)
                } else {
                    Mutation::Delete(address.clone())
                }
            })
            .collect();
    }

    results
        .iter()
        .map(|(address, open)| {
            if *open {
                Mutation::SetStatus(address.clone(), ProxyStatus::PortOpen)
            } else {
                Mutation::Delete(address.clone())
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct HostConsolidator {
    port_probe: Arc<dyn PortProbe>,
    timeout: Duration,
    min_group: usize,
}

impl HostConsolidator {
    pub fn new(port_probe: Arc<dyn PortProbe>, config: &EngineConfig) -> Self {
        Self {
            port_probe,
            timeout: config.short_liveness_timeout,
            min_group: config.consolidation_min_group,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sweep groups found in the first store and mirror every change to all stores
    pub async fn run(&self, stores: &[&ProxyStore]) -> Result<ConsolidationSummary> {
        let mut summary = ConsolidationSummary::default();
        let Some(primary) = stores.first() else {
            return Ok(summary);
        };

        for group in primary.same_host_groups().await? {
            let members: Vec<&ProxyRecord> = group.iter().filter(|r| needs_sweep(r)).collect();
            if members.len() < self.min_group {
                continue;
            }
            summary.groups += 1;

            let probes = members.iter().map(|record| async move {
                let open = self.port_probe.is_open(&record.proxy, self.timeout).await;
                (record.proxy.clone(), open)
            });
            let results = join_all(probes).await;

            for mutation in plan(&results) {
                match &mutation {
                    Mutation::Delete(_) => summary.deleted += 1,
                    Mutation::SetStatus(_, ProxyStatus::PortOpen) => summary.marked_open += 1,
                    Mutation::SetStatus(_, _) => summary.marked_dead += 1,
                }
                for store in stores {
                    if let Err(e) = apply(store, &mutation).await {
                        warn!(?mutation, error = %e, "consolidation write failed");
                    }
                }
            }
        }

        info!(
            groups = summary.groups,
            deleted = summary.deleted,
            marked_open = summary.marked_open,
            marked_dead = summary.marked_dead,
            "host consolidation finished"
        );
        Ok(summary)
    }
}

async fn apply(store: &ProxyStore, mutation: &Mutation) -> Result<()> {
    match mutation {
        Mutation::Delete(address) => {
            store.delete(address).await?;
        }
        Mutation::SetStatus(address, status) => store.update_status(address, *status).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubPortProbe;

    async fn seeded(rows: &str) -> ProxyStore {
        let store = ProxyStore::open("sqlite::memory:").await.unwrap();
        store
            .execute(&format!("INSERT INTO proxies(proxy, status) VALUES {rows}"))
            .await
            .unwrap();
        store
    }

    fn consolidator(probe: StubPortProbe) -> HostConsolidator {
        HostConsolidator::new(Arc::new(probe), &EngineConfig::default())
    }

    #[test]
    fn test_plan_all_closed() {
        let results = vec![
            ("1.1.1.1:80".to_string(), false),
            ("1.1.1.1:81".to_string(), false),
        ];
        assert_eq!(
            plan(&results),
            vec![
                Mutation::SetStatus("1.1.1.1:80".to_string(), ProxyStatus::Dead),
                Mutation::Delete("1.1.1.1:81".to_string()),
            ]
        );
    }

    #[test]
    fn test_plan_all_open() {
        let results = vec![("1.1.1.1:80".to_string(), true), ("1.1.1.1:81".to_string(), true)];
        assert!(plan(&results)
            .iter()
            .all(|m| matches!(m, Mutation::SetStatus(_, ProxyStatus::PortOpen))));
    }

    #[tokio::test]
    async fn test_all_closed_keeps_one_dead() {
        let store = seeded("('9.9.9.9:80', 'untested'), ('9.9.9.9:81', 'dead'), ('9.9.9.9:82', NULL)").await;
        let summary = consolidator(StubPortProbe::fixed(false))
            .run(&[&store])
            .await
            .unwrap();

        let rows = store.all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, Some(ProxyStatus::Dead));
        assert_eq!(summary.deleted, 2);
        assert_eq!(summary.marked_dead, 1);
    }

    #[tokio::test]
    async fn test_mixed_group() {
        let store = seeded("('9.9.9.9:80', 'untested'), ('9.9.9.9:81', 'dead'), ('9.9.9.9:82', 'port-closed')").await;
        consolidator(StubPortProbe::open_only(&["9.9.9.9:81"]))
            .run(&[&store])
            .await
            .unwrap();

        let rows = store.all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].proxy, "9.9.9.9:81");
        assert_eq!(rows[0].status, Some(ProxyStatus::PortOpen));
    }

    #[tokio::test]
    async fn test_all_open_marks_port_open() {
        let store = seeded("('9.9.9.9:80', 'untested'), ('9.9.9.9:81', 'untested'), ('9.9.9.9:82', 'untested')").await;
        consolidator(StubPortProbe::fixed(true))
            .run(&[&store])
            .await
            .unwrap();

        let rows = store.all().await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.status == Some(ProxyStatus::PortOpen)));
    }

    #[tokio::test]
    async fn test_small_groups_and_active_rows_untouched() {
        let store = seeded(
            "('8.8.8.8:80', 'dead'), ('8.8.8.8:81', 'dead'),
             ('7.7.7.7:80', 'active'), ('7.7.7.7:81', 'active'), ('7.7.7.7:82', 'dead')",
        )
        .await;
        let probe = Arc::new(StubPortProbe::fixed(false));
        let summary = HostConsolidator::new(probe.clone(), &EngineConfig::default())
            .run(&[&store])
            .await
            .unwrap();

        assert_eq!(summary, ConsolidationSummary::default());
        assert_eq!(probe.calls(), 0);
        assert_eq!(store.count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_mirrors_receive_same_mutations() {
        let rows = "('9.9.9.9:80', 'dead'), ('9.9.9.9:81', 'dead'), ('9.9.9.9:82', 'dead')";
        let primary = seeded(rows).await;
        let mirror = seeded(rows).await;

        consolidator(StubPortProbe::fixed(false))
            .run(&[&primary, &mirror])
            .await
            .unwrap();

        assert_eq!(primary.all().await.unwrap(), mirror.all().await.unwrap());
        assert_eq!(mirror.count().await.unwrap(), 1);
    }
}
