mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{commit_batch, read_at, vfs};
use strata::config::{PurgeMode, VfsOptions};
use strata::storage::MemoryStorageEngine;
use strata::vfs::{OpenFlags, PageStore, PurgeOutcome, Vfs, VfsHost};
use ulid::Ulid;

const PAGE: u64 = 64;

#[tokio::test]
async fn versions_a_reader_may_need_survive_purge() -> anyhow::Result<()> {
    let engine = MemoryStorageEngine::new();
    let host = VfsHost::local();
    let writer = vfs("writer", &engine, &host);
    let (file, _) = writer.open("main.db", OpenFlags::CREATE | OpenFlags::READWRITE).await?;
    commit_batch(&writer, file, &[(0, vec![1; 64]), (PAGE, vec![1; 64])]).await?;

    // a context that started reading at version 1 and hasn't finished
    let reader = Ulid::new();
    host.snapshots().register("main.db", reader, 1);

    commit_batch(&writer, file, &[(PAGE, vec![2; 64])]).await?;
    commit_batch(&writer, file, &[(PAGE, vec![3; 64])]).await?;

    let outcome = writer.purge("main.db").await?;
    assert_eq!(outcome, PurgeOutcome { deleted: 0, deferred: 1 });
    let store = PageStore::new(Arc::clone(writer.context()), "main.db")?;
    let old = store.read_page(PAGE, 1).await?.filter(|page| page.offset == PAGE);
    assert_eq!(old.map(|page| page.data), Some(vec![1; 64]));

    host.snapshots().release("main.db", reader);
    let outcome = writer.purge("main.db").await?;
    assert_eq!(outcome, PurgeOutcome { deleted: 2, deferred: 0 });
    assert_eq!(store.all_pages().await?.len(), 1);
    assert_eq!(read_at(&writer, file, PAGE, 64).await?, vec![3; 64]);

    // nothing left to do
    assert_eq!(writer.purge("main.db").await?, PurgeOutcome::default());
    Ok(())
}

#[tokio::test]
async fn deferred_purge_runs_once_enough_versions_pile_up() -> anyhow::Result<()> {
    let engine = MemoryStorageEngine::new();
    let options = VfsOptions { purge: PurgeMode::Deferred, purge_at_least: 4, ..Default::default() };
    let writer = Vfs::with_host("writer", Arc::new(engine.clone()), options, VfsHost::local());
    let (file, _) = writer.open("main.db", OpenFlags::CREATE | OpenFlags::READWRITE).await?;
    let store = PageStore::new(Arc::clone(writer.context()), "main.db")?;

    commit_batch(&writer, file, &[(0, vec![0; 64]), (PAGE, vec![0; 64])]).await?;
    for fill in 1..=3 {
        commit_batch(&writer, file, &[(PAGE, vec![fill; 64])]).await?;
    }
    // below the threshold nothing is scheduled
    tokio::task::yield_now().await;
    assert_eq!(store.read_purge_record().await?.map(|record| record.count), Some(3));
    assert_eq!(store.all_pages().await?.len(), 4);

    commit_batch(&writer, file, &[(PAGE, vec![4; 64])]).await?;
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.read_purge_record().await?.is_some() {
            tokio::task::yield_now().await;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await??;

    let pages = store.all_pages().await?;
    assert_eq!(pages.len(), 1);
    assert_eq!((pages[0].offset, pages[0].version), (PAGE, 5));
    assert_eq!(read_at(&writer, file, PAGE, 64).await?, vec![4; 64]);
    Ok(())
}

