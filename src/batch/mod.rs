//! Batch fan-out engine (spec §4.7).
//!
//! Splits a heterogeneous row list into per-server, per-region sub-requests,
//! dispatches them in parallel (inline if only one region is involved, to
//! avoid a pool hop), gathers partial results, and retries unsatisfied items
//! across rounds using the shared backoff schedule.

use crate::cache::LocationCache;
use crate::error::{ClusterError, Result};
use crate::identifiers::{RegionLocation, RegionName, RowKey};
use crate::locator::Locator;
use crate::retry::backoff_delay;
use crate::rpc::{Action, ActionResult, IndexedAction, RpcProxyRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// One row's worth of work still outstanding, carried across rounds.
struct WorkItem {
    original_index: usize,
    row: RowKey,
    action: Action,
}

/// Drives `batch_gets`/`batch_mutations` against a table.
pub struct BatchEngine {
    locator: Arc<Locator>,
    rpc_registry: Arc<RpcProxyRegistry>,
    cache: LocationCache,
    retries_number: u32,
    pause_ms: u64,
}

impl BatchEngine {
    pub fn new(
        locator: Arc<Locator>,
        rpc_registry: Arc<RpcProxyRegistry>,
        cache: LocationCache,
        retries_number: u32,
        pause_ms: u64,
    ) -> Self {
        Self {
            locator,
            rpc_registry,
            cache,
            retries_number,
            pause_ms,
        }
    }

    /// Fetches `rows` from `table`. The returned vector has the same
    /// length as `rows`; a slot is `None` if that row was permanently
    /// classified do-not-retry (e.g. the table doesn't exist).
    pub async fn batch_gets(&self, table: &str, rows: &[RowKey]) -> Result<Vec<Option<Vec<(String, Vec<u8>)>>>> {
        let mut results: Vec<Option<Vec<(String, Vec<u8>)>>> = vec![None; rows.len()];
        let working: Vec<WorkItem> = rows
            .iter()
            .enumerate()
            .map(|(i, row)| WorkItem {
                original_index: i,
                row: row.clone(),
                action: Action::Get { row: row.clone() },
            })
            .collect();

        self.run_rounds(table, working, |idx, outcome, results| match outcome {
            ActionResult::Success(value) => {
                results[idx] = value;
                true
            }
            ActionResult::Failure(_) => false,
        }, &mut results)
        .await?;

        Ok(results)
    }

    /// Applies `mutations` (each a `(row, Action::Put|Delete)` pair) to
    /// `table`. The returned vector lists items that were permanently
    /// rejected as do-not-retry; everything else either succeeded or
    /// was retried to success.
    pub async fn batch_mutations(
        &self,
        table: &str,
        mutations: &[(RowKey, Action)],
    ) -> Result<Vec<(usize, ClusterError)>> {
        let mut failures: Vec<(usize, ClusterError)> = Vec::new();
        let working: Vec<WorkItem> = mutations
            .iter()
            .enumerate()
            .map(|(i, (row, action))| WorkItem {
                original_index: i,
                row: row.clone(),
                action: action.clone(),
            })
            .collect();

        self.run_rounds(
            table,
            working,
            |idx, outcome, failures: &mut Vec<(usize, ClusterError)>| match outcome {
                ActionResult::Success(_) => true,
                ActionResult::Failure(e) if e.is_do_not_retry() => {
                    failures.push((idx, e));
                    true
                }
                ActionResult::Failure(_) => false,
            },
            &mut failures,
        )
        .await?;

        Ok(failures)
    }

    /// Common round-driving loop: split by region, dispatch, gather, and
    /// retry the unsatisfied subset. `record` decides, per original
    /// index, whether an outcome finally resolves that slot (`true`) or
    /// leaves it for the next round (`false`), writing into `out`.
    async fn run_rounds<T>(
        &self,
        table: &str,
        mut working: Vec<WorkItem>,
        record: impl Fn(usize, ActionResult, &mut T) -> bool + Copy,
        out: &mut T,
    ) -> Result<()> {
        for round in 0..self.retries_number {
            if working.is_empty() {
                return Ok(());
            }

            if round > 0 {
                tokio::time::sleep(backoff_delay(round - 1, self.pause_ms)).await;
            }

            let (groups, unresolved) = self.split_by_region(table, working).await?;
            working = self.dispatch_and_gather(groups, unresolved, record, out).await?;

            debug!(round, table, remaining = working.len(), "batch round complete");
        }

        if working.is_empty() {
            Ok(())
        } else {
            Err(ClusterError::RetriesExhausted {
                attempts: self.retries_number,
                causes: working.iter().map(|w| format!("row {} unresolved", w.row)).collect(),
            })
        }
    }

    /// Forces a fresh resolve (bypassing the cache) for each row's
    /// region, then groups items by region name. Rows whose region
    /// could not be resolved this round fall through to `unresolved`.
    async fn split_by_region(
        &self,
        table: &str,
        working: Vec<WorkItem>,
    ) -> Result<(HashMap<RegionName, (RegionLocation, Vec<WorkItem>)>, Vec<WorkItem>)> {
        let mut groups: HashMap<RegionName, (RegionLocation, Vec<WorkItem>)> = HashMap::new();
        let mut unresolved = Vec::new();

        for item in working {
            match self.locator.locate_region(table, &item.row, false).await {
                Ok(loc) => {
                    groups
                        .entry(loc.region_info.region_name.clone())
                        .or_insert_with(|| (loc, Vec::new()))
                        .1
                        .push(item);
                }
                Err(e) if e.is_do_not_retry() => return Err(e),
                Err(e) => {
                    warn!(error = %e, row = %item.row, "region resolution failed during batch split");
                    unresolved.push(item);
                }
            }
        }

        Ok((groups, unresolved))
    }

    /// Dispatches one task per region group — inline if there is only
    /// one group, otherwise via `JoinSet` — and folds results back
    /// through `record`.
    async fn dispatch_and_gather<T>(
        &self,
        groups: HashMap<RegionName, (RegionLocation, Vec<WorkItem>)>,
        unresolved: Vec<WorkItem>,
        record: impl Fn(usize, ActionResult, &mut T) -> bool + Copy,
        out: &mut T,
    ) -> Result<Vec<WorkItem>> {
        let mut next_round = unresolved;

        if groups.len() <= 1 {
            for (region_name, (loc, items)) in groups {
                let (items, outcomes) = dispatch_region(Arc::clone(&self.rpc_registry), self.cache.clone(), region_name, loc, items).await;
                next_round.extend(fold_outcomes(items, outcomes, record, out));
            }
            return Ok(next_round);
        }

        let mut join_set = JoinSet::new();
        for (region_name, (loc, items)) in groups {
            let rpc_registry = Arc::clone(&self.rpc_registry);
            let cache = self.cache.clone();
            join_set.spawn(async move { dispatch_region(rpc_registry, cache, region_name, loc, items).await });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((items, outcomes)) => {
                    next_round.extend(fold_outcomes(items, outcomes, record, out));
                }
                Err(e) => {
                    warn!(error = %e, "batch dispatch task panicked");
                }
            }
        }

        Ok(next_round)
    }
}

/// Issues one `multi_action` call for every item addressed at `(region_name,
/// server)`, returning the original items alongside either their
/// per-item outcomes or a single server-wide failure.
async fn dispatch_region(
    rpc_registry: Arc<RpcProxyRegistry>,
    cache: LocationCache,
    region_name: RegionName,
    loc: RegionLocation,
    items: Vec<WorkItem>,
) -> (Vec<WorkItem>, DispatchOutcome) {
    let actions: Vec<IndexedAction> = items
        .iter()
        .map(|item| IndexedAction {
            original_index: item.original_index,
            action: item.action.clone(),
        })
        .collect();

    let stub = match rpc_registry.get_shard_server(&loc.server_address).await {
        Ok(stub) => stub,
        Err(e) => return (items, DispatchOutcome::ServerFailed(e)),
    };

    match stub.multi_action(&region_name, &actions).await {
        Ok(results) => {
            if results.iter().any(|(_, outcome)| matches!(outcome, ActionResult::Failure(_))) {
                cache.invalidate(&loc.region_info.table_name, &loc.region_info.start_key, Some(&loc.server_address));
            }
            (items, DispatchOutcome::PerItem(results))
        }
        Err(e) => {
            if e.is_transient_network() {
                cache.drop_server(&loc.server_address);
            }
            (items, DispatchOutcome::ServerFailed(e))
        }
    }
}

enum DispatchOutcome {
    PerItem(Vec<(usize, ActionResult)>),
    ServerFailed(ClusterError),
}

fn fold_outcomes<T>(
    items: Vec<WorkItem>,
    outcome: DispatchOutcome,
    record: impl Fn(usize, ActionResult, &mut T) -> bool,
    out: &mut T,
) -> Vec<WorkItem> {
    match outcome {
        DispatchOutcome::ServerFailed(e) => {
            if e.is_do_not_retry() {
                // Do-not-retry at the server level still means every item
                // in this group is permanently resolved as a failure.
                items
                    .into_iter()
                    .filter(|item| !record(item.original_index, ActionResult::Failure(e.clone()), out))
                    .collect()
            } else {
                items
            }
        }
        DispatchOutcome::PerItem(results) => {
            let mut by_index: HashMap<usize, ActionResult> = results.into_iter().collect();
            items
                .into_iter()
                .filter(|item| {
                    let Some(outcome) = by_index.remove(&item.original_index) else {
                        return true;
                    };
                    !record(item.original_index, outcome, out)
                })
                .collect()
        }
    }
}
