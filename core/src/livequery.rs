use std::collections::BTreeSet;

use tokio::sync::{mpsc, watch};

use crate::backend::{Query, QueryResult};
use crate::db::{Db, RunningState};
use crate::error::DbError;
use crate::notify::{listen_changes, ChannelHub, ListenerGuard};
use crate::{action_debug, action_warn};

/// The latest results of a live query. `run` counts completed runs, starting at 1.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub run: u64,
    pub results: Vec<QueryResult>,
}

/// Queries that re-run whenever a change to one of the tables they read is published.
///
/// Re-runs stop when the live query is dropped or the database starts stopping.
pub struct LiveQuery {
    rx: watch::Receiver<Snapshot>,
    tables: BTreeSet<String>,
    _guard: ListenerGuard,
}

impl LiveQuery {
    pub async fn start(db: &Db, hub: &ChannelHub, queries: Vec<Query>) -> Result<Self, DbError> {
        let tables: BTreeSet<String> = queries.iter().flat_map(|query| query.read_tables()).collect();
        let results = db.run_queries(queries.clone()).await?;
        let (tx, rx) = watch::channel(Snapshot { run: 1, results });

        let (rerun_tx, rerun_rx) = mpsc::unbounded_channel();
        let watched = tables.clone();
        let guard = listen_changes(hub, db.name(), move |message| {
            if message.intersects(&watched) {
                let _ = rerun_tx.send(());
            }
        });

        crate::task::spawn("live query", rerun(db.clone(), queries, tx, rerun_rx));
        Ok(Self { rx, tables, _guard: guard })
    }

    pub fn tables(&self) -> &BTreeSet<String> { &self.tables }

    pub fn snapshot(&self) -> Snapshot { self.rx.borrow().clone() }

    /// Wait for the next run. Returns false once no more runs will happen.
    pub async fn changed(&mut self) -> bool { self.rx.changed().await.is_ok() }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> { self.rx.clone() }
}

async fn rerun(db: Db, queries: Vec<Query>, tx: watch::Sender<Snapshot>, mut reruns: mpsc::UnboundedReceiver<()>) {
    let mut state = db.watch_state();
    loop {
        tokio::select! {
            trigger = reruns.recv() => {
                if trigger.is_none() {
                    break;
                }
                // one run covers every change published so far
                while reruns.try_recv().is_ok() {}
                match db.run_queries(queries.clone()).await {
                    Ok(results) => {
                        tx.send_modify(|snapshot| {
                            snapshot.run += 1;
                            snapshot.results = results;
                        });
                    }
                    Err(DbError::NotRunning { .. }) => break,
                    Err(err) => action_warn!(db.name(), "live query failed", "{}", err),
                }
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() != RunningState::Running {
                    break;
                }
            }
            _ = tx.closed() => break,
        }
    }
    action_debug!(db.name(), "live query stopped");
}
