use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::watch;
use ulid::Ulid;

use crate::backend::{DbBackend, Query, QueryBatch, QueryResult, TransactionOpts, Value};
use crate::config::DbConfig;
use crate::error::DbError;
use crate::{action_debug, action_info, action_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningState {
    Running,
    Stopping,
    Stopped,
}

/// How BEGIN takes its locks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionKind {
    #[default]
    Deferred,
    Immediate,
    Exclusive,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Deferred => write!(f, "DEFERRED"),
            TransactionKind::Immediate => write!(f, "IMMEDIATE"),
            TransactionKind::Exclusive => write!(f, "EXCLUSIVE"),
        }
    }
}

type Hook = Box<dyn FnOnce(&Transaction) + Send>;

#[derive(Default)]
struct Hooks {
    after_commit: Vec<Hook>,
    after_rollback: Vec<Hook>,
}

/// A transaction in progress. Clones refer to the same transaction.
#[derive(Clone)]
pub struct Transaction {
    id: String,
    atomic: bool,
    touched: Arc<Mutex<BTreeSet<String>>>,
    hooks: Arc<Mutex<Hooks>>,
}

impl Transaction {
    fn new(atomic: bool) -> Self {
        Self { id: Ulid::new().to_string(), atomic, touched: Default::default(), hooks: Default::default() }
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn is_atomic(&self) -> bool { self.atomic }

    /// Tables written so far, including tables derived from them.
    pub fn write_touched_tables(&self) -> BTreeSet<String> { self.touched.lock().expect("Failed to lock touched tables").clone() }

    fn touch(&self, tables: impl IntoIterator<Item = String>) { self.touched.lock().expect("Failed to lock touched tables").extend(tables); }

    fn run_hooks(&self, committed: bool) {
        let hooks = {
            let mut hooks = self.hooks.lock().expect("Failed to lock transaction hooks");
            let hooks = std::mem::take(&mut *hooks);
            if committed {
                hooks.after_commit
            } else {
                hooks.after_rollback
            }
        };
        for hook in hooks {
            hook(self);
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.debug_struct("Transaction").field("id", &self.id).field("atomic", &self.atomic).finish() }
}

/// Hooks into the lifecycle of a [`Db`]. Every observer is awaited, in registration order, before the
/// call that triggered the event continues.
#[async_trait]
pub trait DbObserver: Send + Sync + 'static {
    async fn initialized(&self, _db: &Db) -> anyhow::Result<()> { Ok(()) }
    async fn transaction_will_start(&self, _db: &Db, _tx: &Transaction) -> anyhow::Result<()> { Ok(()) }
    async fn transaction_started(&self, _db: &Db, _tx: &Transaction) -> anyhow::Result<()> { Ok(()) }
    async fn transaction_will_commit(&self, _db: &Db, _tx: &Transaction) -> anyhow::Result<()> { Ok(()) }
    async fn transaction_committed(&self, _db: &Db, _tx: &Transaction) -> anyhow::Result<()> { Ok(()) }
    async fn transaction_will_rollback(&self, _db: &Db, _tx: &Transaction) -> anyhow::Result<()> { Ok(()) }
    async fn transaction_rolled_back(&self, _db: &Db, _tx: &Transaction) -> anyhow::Result<()> { Ok(()) }
    /// A batch completed. `db` carries the transaction it ran in, if any.
    async fn queries_ran(&self, _db: &Db, _batch: &QueryBatch) -> anyhow::Result<()> { Ok(()) }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    WillStart,
    Started,
    WillCommit,
    Committed,
    WillRollback,
    RolledBack,
}

struct Shared {
    config: DbConfig,
    backend: Arc<dyn DbBackend>,
    state: watch::Sender<RunningState>,
    observers: RwLock<Vec<Arc<dyn DbObserver>>>,
}

/// Client handle of one logical database. Clones share the connection; a clone handed to a
/// transaction body also carries that transaction.
#[derive(Clone)]
pub struct Db {
    shared: Arc<Shared>,
    transaction: Option<Transaction>,
}

impl Db {
    /// A stopped client. Call [`Db::initialize`] once observers are registered.
    pub fn new(config: DbConfig, backend: Arc<dyn DbBackend>) -> Self {
        let shared = Shared { config, backend, state: watch::Sender::new(RunningState::Stopped), observers: RwLock::new(Vec::new()) };
        Self { shared: Arc::new(shared), transaction: None }
    }

    pub fn observe(&self, observer: Arc<dyn DbObserver>) { self.shared.observers.write().expect("Failed to lock observers").push(observer); }

    pub async fn initialize(&self) -> Result<(), DbError> {
        self.shared.backend.initialize().await?;
        self.shared.state.send_replace(RunningState::Running);
        for observer in self.observers() {
            observer.initialized(self).await.map_err(DbError::Observer)?;
        }
        action_info!(self.name(), "initialized");
        Ok(())
    }

    /// Wait for queued work, then stop the backend.
    pub async fn stop(&self) -> Result<(), DbError> {
        self.shared.state.send_replace(RunningState::Stopping);
        self.shared.backend.stop().await?;
        self.shared.state.send_replace(RunningState::Stopped);
        action_info!(self.name(), "stopped");
        Ok(())
    }

    pub fn name(&self) -> &str { &self.shared.config.name }
    pub fn config(&self) -> &DbConfig { &self.shared.config }
    pub fn running_state(&self) -> RunningState { *self.shared.state.borrow() }
    pub fn watch_state(&self) -> watch::Receiver<RunningState> { self.shared.state.subscribe() }
    pub fn transaction(&self) -> Option<&Transaction> { self.transaction.as_ref() }
    pub fn is_in_transaction(&self) -> bool { self.transaction.is_some() }

    pub async fn run_queries(&self, queries: Vec<Query>) -> Result<Vec<QueryResult>, DbError> { self.exec(QueryBatch::Usual(queries), None).await }

    pub async fn run_query(&self, query: Query) -> Result<QueryResult, DbError> {
        Ok(self.run_queries(vec![query]).await?.into_iter().next().unwrap_or_default())
    }

    /// Run `query` once per value set. The query itself must not bind values.
    pub async fn run_prepared(&self, query: Query, values: Vec<Vec<Value>>) -> Result<Vec<QueryResult>, DbError> {
        if !query.values.is_empty() {
            return Err(DbError::PreparedWithValues);
        }
        self.exec(QueryBatch::Prepared { query, values }, None).await
    }

    /// Run a batch with explicit transaction opts. The opts must name the current transaction.
    pub async fn run_with_opts(&self, queries: Vec<Query>, opts: TransactionOpts) -> Result<Vec<QueryResult>, DbError> {
        self.exec(QueryBatch::Usual(queries), Some(opts)).await
    }

    /// Run `f` inside a transaction and commit, or roll back if it fails. Called from inside a
    /// transaction, `f` just runs as part of it.
    pub async fn run_in_transaction<T, E, F, Fut>(&self, kind: TransactionKind, f: F) -> Result<T, E>
    where
        F: FnOnce(Db) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        if self.transaction.is_some() {
            return f(self.clone()).await;
        }
        self.assure_running(|| "transaction".into())?;

        let db = self.with_transaction(Transaction::new(false));
        let started = Instant::now();
        let result = db.transaction_body(kind, f).await;
        db.log_finished(started);
        result
    }

    async fn transaction_body<T, E, F, Fut>(&self, kind: TransactionKind, f: F) -> Result<T, E>
    where
        F: FnOnce(Db) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        let Some(tx) = self.transaction.clone() else { return Err(DbError::NotInTransaction.into()) };
        self.emit(Event::WillStart, &tx).await?;
        let begin = TransactionOpts { contains_start: true, ..TransactionOpts::new(&tx.id) };
        self.exec(QueryBatch::Usual(vec![Query::new(format!("BEGIN {} TRANSACTION", kind))]), Some(begin)).await?;

        let body = async {
            self.emit(Event::Started, &tx).await?;
            let value = f(self.clone()).await?;
            self.emit(Event::WillCommit, &tx).await?;
            let commit = TransactionOpts { contains_finish: true, ..TransactionOpts::new(&tx.id) };
            self.exec(QueryBatch::Usual(vec![Query::new("COMMIT")]), Some(commit)).await?;
            Ok::<T, E>(value)
        };
        match body.await {
            // the job is released once COMMIT runs, so nothing past this point may roll back
            Ok(value) => {
                self.emit_quietly(Event::Committed, &tx).await;
                tx.run_hooks(true);
                Ok(value)
            }
            Err(err) => {
                action_warn!(self.name(), "rolling back", "{}", tx.id);
                self.emit_quietly(Event::WillRollback, &tx).await;
                let rollback = TransactionOpts { contains_rollback: true, ..TransactionOpts::new(&tx.id) };
                if let Err(rollback_err) = self.exec(QueryBatch::Usual(vec![Query::new("ROLLBACK")]), Some(rollback)).await {
                    action_warn!(self.name(), "rollback failed", "{}: {}", tx.id, rollback_err);
                }
                self.emit_quietly(Event::RolledBack, &tx).await;
                tx.run_hooks(false);
                Err(err)
            }
        }
    }

    /// Run `queries` as one backend call wrapped in BEGIN and COMMIT, rolled back by the backend if any
    /// of them fails. Returns the results of `queries` alone.
    pub async fn run_atomic_transaction(&self, kind: TransactionKind, queries: Vec<Query>) -> Result<Vec<QueryResult>, DbError> {
        if self.transaction.is_some() {
            return Err(DbError::NestedAtomic);
        }
        self.assure_running(|| "atomic transaction".into())?;

        let tx = Transaction::new(true);
        let db = self.with_transaction(tx.clone());
        let started = Instant::now();
        db.emit(Event::WillStart, &tx).await?;
        db.emit(Event::Started, &tx).await?;

        let count = queries.len();
        let mut batch = Vec::with_capacity(count + 2);
        batch.push(Query::new(format!("BEGIN {} TRANSACTION", kind)));
        batch.extend(queries);
        batch.push(Query::new("COMMIT"));
        let opts = TransactionOpts { contains_start: true, contains_finish: true, rollback_on_fail: true, is_atomic: true, ..TransactionOpts::new(&tx.id) };

        let result = match db.exec(QueryBatch::Usual(batch), Some(opts)).await {
            Ok(results) => {
                db.emit_quietly(Event::WillCommit, &tx).await;
                db.emit_quietly(Event::Committed, &tx).await;
                tx.run_hooks(true);
                Ok(results.into_iter().skip(1).take(count).collect())
            }
            Err(err) => {
                action_warn!(self.name(), "atomic transaction rolled back", "{}", tx.id);
                db.emit_quietly(Event::WillRollback, &tx).await;
                db.emit_quietly(Event::RolledBack, &tx).await;
                tx.run_hooks(false);
                Err(err)
            }
        };
        db.log_finished(started);
        result
    }

    /// Call `f` once the current transaction commits.
    pub fn run_after_commit(&self, f: impl FnOnce(&Transaction) + Send + 'static) -> Result<(), DbError> {
        let tx = self.transaction.as_ref().ok_or(DbError::NotInTransaction)?;
        tx.hooks.lock().expect("Failed to lock transaction hooks").after_commit.push(Box::new(f));
        Ok(())
    }

    /// Call `f` once the current transaction rolls back.
    pub fn run_after_rollback(&self, f: impl FnOnce(&Transaction) + Send + 'static) -> Result<(), DbError> {
        let tx = self.transaction.as_ref().ok_or(DbError::NotInTransaction)?;
        tx.hooks.lock().expect("Failed to lock transaction hooks").after_rollback.push(Box::new(f));
        Ok(())
    }

    fn with_transaction(&self, tx: Transaction) -> Db { Db { shared: self.shared.clone(), transaction: Some(tx) } }

    fn observers(&self) -> Vec<Arc<dyn DbObserver>> { self.shared.observers.read().expect("Failed to lock observers").clone() }

    fn assure_running(&self, what: impl FnOnce() -> String) -> Result<(), DbError> {
        if self.running_state() != RunningState::Running {
            return Err(DbError::NotRunning { db_name: self.name().to_owned(), what: what() });
        }
        Ok(())
    }

    async fn exec(&self, batch: QueryBatch, opts: Option<TransactionOpts>) -> Result<Vec<QueryResult>, DbError> {
        // work inside a transaction is already accounted for by the stop sequence
        if self.transaction.is_none() {
            self.assure_running(|| batch.texts().join("; "))?;
        }
        if let Some(opts) = &opts {
            let current = self.transaction.as_ref().map(|tx| tx.id.clone());
            if current.as_deref() != Some(opts.transaction_id.as_str()) {
                return Err(DbError::ForeignTransaction { requested: opts.transaction_id.clone(), current });
            }
        }
        let opts = opts.or_else(|| self.transaction.as_ref().map(|tx| TransactionOpts::new(&tx.id)));

        let started = Instant::now();
        let results = self
            .shared
            .backend
            .exec_queries(&batch, opts.as_ref())
            .await
            .map_err(|source| DbError::QueryRun { db_name: self.name().to_owned(), queries: batch.texts(), source })?;

        if !self.shared.config.suppress_log {
            let tx = self.transaction.as_ref().map(|tx| format!("[tx={}] ", &tx.id[tx.id.len() - 6..])).unwrap_or_default();
            for (text, result) in batch.texts().iter().zip(&results) {
                action_debug!(self.name(), "query", "{}{} execTime={:?}", tx, truncated(text), result.elapsed);
            }
            action_debug!(self.name(), "queries", "{}totalTime={:?}", tx, started.elapsed());
        }

        if let Some(tx) = &self.transaction {
            tx.touch(batch.queries().into_iter().flat_map(|q| q.write_tables()));
        }
        for observer in self.observers() {
            observer.queries_ran(self, &batch).await.map_err(DbError::Observer)?;
        }
        Ok(results)
    }

    async fn emit(&self, event: Event, tx: &Transaction) -> Result<(), DbError> {
        for observer in self.observers() {
            self.notify(observer.as_ref(), event, tx).await.map_err(DbError::Observer)?;
        }
        Ok(())
    }

    /// Emit once the outcome is settled: every observer hears the event and failures are only logged.
    async fn emit_quietly(&self, event: Event, tx: &Transaction) {
        for observer in self.observers() {
            if let Err(err) = self.notify(observer.as_ref(), event, tx).await {
                action_warn!(self.name(), "observer failed", "{:?} {}: {}", event, tx.id, err);
            }
        }
    }

    async fn notify(&self, observer: &dyn DbObserver, event: Event, tx: &Transaction) -> anyhow::Result<()> {
        match event {
            Event::WillStart => observer.transaction_will_start(self, tx).await,
            Event::Started => observer.transaction_started(self, tx).await,
            Event::WillCommit => observer.transaction_will_commit(self, tx).await,
            Event::Committed => observer.transaction_committed(self, tx).await,
            Event::WillRollback => observer.transaction_will_rollback(self, tx).await,
            Event::RolledBack => observer.transaction_rolled_back(self, tx).await,
        }
    }

    fn log_finished(&self, started: Instant) {
        if let (Some(tx), false) = (&self.transaction, self.shared.config.suppress_log) {
            action_debug!(self.name(), "transaction finished", "{} totalTime={:?}", tx.id, started.elapsed());
        }
    }
}

fn truncated(text: &str) -> &str {
    match text.char_indices().nth(1000) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
