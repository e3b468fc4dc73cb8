mod common;

use std::sync::Arc;

use strata_core::config::{PurgeMode, VfsOptions};
use strata_core::error::StorageError;
use strata_core::storage::{KeyRange, StorageEngine, TransactionMode};
use strata_core::vfs::{FileControl, LockState, OpenFlags, ReadOutcome, Vfs, VfsHost};
use strata_storage_sled::SledStorageEngine;

#[tokio::test]
async fn writes_apply_atomically_at_commit() -> anyhow::Result<()> {
    let engine = SledStorageEngine::new_test()?;
    let writer = engine.begin(TransactionMode::ReadWrite).await?;
    writer.put(b"a", b"1").await?;
    writer.put(b"b", b"2").await?;
    writer.delete(b"a").await?;
    assert_eq!(writer.scan(&KeyRange::prefix(b""), None).await?, vec![(b"b".to_vec(), b"2".to_vec())]);

    let reader = engine.begin(TransactionMode::ReadOnly).await?;
    assert_eq!(reader.get(b"b").await?, None);
    assert!(matches!(reader.put(b"c", b"3").await, Err(StorageError::ReadOnly)));

    writer.commit().await?;
    assert!(matches!(writer.get(b"b").await, Err(StorageError::TransactionInactive)));
    assert_eq!(reader.get(b"b").await?, Some(b"2".to_vec()));
    Ok(())
}

#[tokio::test]
async fn scan_limit_skips_pending_deletions() -> anyhow::Result<()> {
    let engine = SledStorageEngine::new_test()?;
    let setup = engine.begin(TransactionMode::ReadWrite).await?;
    for key in [b"k1", b"k2", b"k3", b"k4"] {
        setup.put(key, b"v").await?;
    }
    setup.commit().await?;

    let tx = engine.begin(TransactionMode::ReadWrite).await?;
    tx.delete(b"k1").await?;
    tx.delete(b"k2").await?;
    let first = tx.first(&KeyRange::prefix(b"k")).await?;
    assert_eq!(first.map(|(key, _)| key), Some(b"k3".to_vec()));
    tx.abort();
    Ok(())
}

#[tokio::test]
async fn committed_data_survives_reopen() -> anyhow::Result<()> {
    let dir = std::env::temp_dir().join(format!("strata-sled-{}", std::process::id()));
    {
        let engine = SledStorageEngine::with_path(dir.clone())?;
        let tx = engine.begin(TransactionMode::ReadWrite).await?;
        tx.put(b"page", b"data").await?;
        tx.commit().await?;
        engine.flush().await?;
    }
    {
        let engine = SledStorageEngine::with_path(dir.clone())?;
        let tx = engine.begin(TransactionMode::ReadOnly).await?;
        assert_eq!(tx.get(b"page").await?, Some(b"data".to_vec()));
    }
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[tokio::test]
async fn vfs_batches_land_in_sled() -> anyhow::Result<()> {
    let engine: Arc<dyn StorageEngine> = Arc::new(SledStorageEngine::new_test()?);
    let host = VfsHost::local();
    let options = VfsOptions { purge: PurgeMode::Manual, ..Default::default() };
    let writer = Vfs::with_host("writer", engine.clone(), options.clone(), host.clone());
    let reader = Vfs::with_host("reader", engine, options, host);

    let (file, _) = writer.open("main.db", OpenFlags::CREATE | OpenFlags::READWRITE).await?;
    writer.lock(file, LockState::Exclusive).await?;
    writer.file_control(file, FileControl::BeginAtomicWrite).await?;
    writer.write(file, &[7; 16], 0).await?;
    writer.write(file, &[8; 16], 16).await?;
    writer.file_control(file, FileControl::CommitAtomicWrite).await?;
    writer.unlock(file, LockState::None).await?;
    writer.close(file).await?;

    let (file, _) = reader.open("main.db", OpenFlags::READONLY).await?;
    reader.lock(file, LockState::Shared).await?;
    assert_eq!(reader.file_size(file).await?, 32);
    let mut buf = [0; 16];
    assert_eq!(reader.read(file, &mut buf, 16).await?, ReadOutcome::Complete);
    assert_eq!(buf, [8; 16]);
    reader.unlock(file, LockState::None).await?;
    reader.close(file).await?;
    Ok(())
}
