//! Publishes the tables each completed write touched, so live queries in every context sharing the
//! database can re-run.

mod channel;

pub use channel::{Channel, ChannelHub, ListenerGuard};

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::backend::QueryBatch;
use crate::db::{Db, DbObserver, Transaction};
use crate::{action_debug, action_error, action_warn};

/// The message published on a database's change channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMessage {
    #[serde(rename = "changesInTables")]
    pub changes_in_tables: Vec<String>,
}

impl ChangeMessage {
    pub fn new(tables: impl IntoIterator<Item = String>) -> Self { Self { changes_in_tables: tables.into_iter().collect() } }

    pub fn intersects(&self, tables: &BTreeSet<String>) -> bool { self.changes_in_tables.iter().any(|table| tables.contains(table)) }
}

pub fn channel_name(db_name: &str) -> String { format!("{db_name}-changes") }

/// Listen to the changes published for `db_name`. Messages that don't parse are logged and skipped.
pub fn listen_changes<F>(hub: &ChannelHub, db_name: &str, listener: F) -> ListenerGuard
where F: Fn(ChangeMessage) + Send + Sync + 'static {
    let name = channel_name(db_name);
    hub.channel(&name).listen(move |raw| match serde_json::from_str::<ChangeMessage>(raw) {
        Ok(message) => listener(message),
        Err(err) => action_warn!(name, "ignored malformed change message", "{}: {}", raw, err),
    })
}

enum Command {
    Publish(ChangeMessage),
    Flush(oneshot::Sender<()>),
}

/// Observes a [`Db`] and publishes on `"{db_name}-changes"`. Writes outside a transaction publish once
/// they complete; writes inside one are collected and published at commit, or dropped on rollback.
///
/// Messages go out from a background task in the order they were produced, so publishing never
/// blocks the query that caused it.
pub struct ChangeNotifier {
    tx: mpsc::UnboundedSender<Command>,
}

impl ChangeNotifier {
    /// Must be called from within a tokio runtime.
    pub fn new(hub: &ChannelHub, db_name: &str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = hub.channel(&channel_name(db_name));
        crate::task::spawn("change notifier", async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Publish(message) => match serde_json::to_string(&message) {
                        Ok(raw) => {
                            action_debug!(channel.name(), "publish", "{}", raw);
                            channel.send(&raw);
                        }
                        Err(err) => action_error!(channel.name(), "failed to serialize change message", "{}", err),
                    },
                    Command::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    /// Create a notifier for `db` and register it as an observer.
    pub fn attach(db: &Db, hub: &ChannelHub) -> Arc<Self> {
        let notifier = Arc::new(Self::new(hub, db.name()));
        db.observe(notifier.clone());
        notifier
    }

    pub fn publish(&self, tables: BTreeSet<String>) {
        if tables.is_empty() {
            return;
        }
        // the pump only stops when the notifier is dropped
        let _ = self.tx.send(Command::Publish(ChangeMessage::new(tables)));
    }

    /// Resolves once everything published so far has been delivered.
    pub async fn flushed(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

#[async_trait]
impl DbObserver for ChangeNotifier {
    async fn transaction_committed(&self, _db: &Db, tx: &Transaction) -> anyhow::Result<()> {
        self.publish(tx.write_touched_tables());
        Ok(())
    }

    async fn queries_ran(&self, db: &Db, batch: &QueryBatch) -> anyhow::Result<()> {
        if !db.is_in_transaction() {
            self.publish(batch.queries().into_iter().flat_map(|query| query.write_tables()).collect());
        }
        Ok(())
    }
}
