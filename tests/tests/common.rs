use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use strata::backend::Row;
use strata::config::{DbConfig, PurgeMode, VfsOptions};
use strata::storage::MemoryStorageEngine;
use strata::vfs::{FileControl, FileHandle, LockState, Vfs, VfsHost};
use strata::{ChangeNotifier, ChannelHub, Db, Query, QueryExecutor, QueryRunner, Value};
use tracing::Level;

// Initialize tracing for tests
#[ctor::ctor]
fn init_tracing() {
    // if LOG_LEVEL env var is set, use it
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        tracing_subscriber::fmt().with_max_level(Level::from_str(&level).unwrap()).with_test_writer().init();
    } else {
        tracing_subscriber::fmt().with_max_level(Level::INFO).with_test_writer().init();
    }
}

/// Records statements in order. Statements mentioning `FAIL` fail.
#[derive(Default)]
pub struct ScriptedExecutor {
    log: Mutex<Vec<String>>,
}

#[allow(unused)]
impl ScriptedExecutor {
    pub fn statements(&self) -> Vec<String> { self.log.lock().unwrap().clone() }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn open(&self) -> anyhow::Result<()> { Ok(()) }

    async fn exec(&self, query: &Query) -> anyhow::Result<Vec<Row>> {
        self.log.lock().unwrap().push(query.text.clone());
        tokio::task::yield_now().await;
        if query.text.contains("FAIL") {
            anyhow::bail!("no such table: FAIL");
        }
        let mut row = Row::new();
        row.insert("text".into(), Value::Text(query.text.clone()));
        Ok(vec![row])
    }
}

#[allow(unused)]
pub async fn setup_db(name: &str, hub: &ChannelHub) -> anyhow::Result<(Db, Arc<QueryRunner<ScriptedExecutor>>, Arc<ChangeNotifier>)> {
    let runner = Arc::new(QueryRunner::new(ScriptedExecutor::default(), Default::default()));
    let db = Db::new(DbConfig::named(name), runner.clone());
    let notifier = ChangeNotifier::attach(&db, hub);
    db.initialize().await?;
    Ok((db, runner, notifier))
}

#[allow(unused)]
pub fn manual_purge() -> VfsOptions { VfsOptions { purge: PurgeMode::Manual, ..Default::default() } }

#[allow(unused)]
pub fn vfs(name: &str, engine: &MemoryStorageEngine, host: &Arc<VfsHost>) -> Vfs {
    Vfs::with_host(name, Arc::new(engine.clone()), manual_purge(), host.clone())
}

/// Write `pages` as one atomic batch.
#[allow(unused)]
pub async fn commit_batch(vfs: &Vfs, file: FileHandle, pages: &[(u64, Vec<u8>)]) -> anyhow::Result<()> {
    vfs.lock(file, LockState::Exclusive).await?;
    vfs.file_control(file, FileControl::BeginAtomicWrite).await?;
    for (offset, data) in pages {
        vfs.write(file, data, *offset).await?;
    }
    let committed = vfs.file_control(file, FileControl::CommitAtomicWrite).await;
    vfs.unlock(file, LockState::None).await?;
    Ok(committed?)
}

#[allow(unused)]
pub async fn read_at(vfs: &Vfs, file: FileHandle, offset: u64, len: usize) -> anyhow::Result<Vec<u8>> {
    let mut buf = vec![0; len];
    vfs.lock(file, LockState::Shared).await?;
    vfs.read(file, &mut buf, offset).await?;
    vfs.unlock(file, LockState::None).await?;
    Ok(buf)
}
