mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::vfs;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strata::error::VfsError;
use strata::storage::MemoryStorageEngine;
use strata::vfs::{FileControl, LockState, OpenFlags, Vfs, VfsHost};

const COUNTER: u64 = 64;

async fn increment(vfs: &Vfs, file: strata::vfs::FileHandle, holders: &AtomicUsize) -> anyhow::Result<bool> {
    vfs.lock(file, LockState::Shared).await?;
    match vfs.lock(file, LockState::Exclusive).await {
        Ok(()) => {}
        Err(VfsError::Busy) => {
            // another context is already on its way to EXCLUSIVE, let it finish
            vfs.unlock(file, LockState::None).await?;
            return Ok(false);
        }
        Err(err) => return Err(err.into()),
    }
    assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0, "two contexts in EXCLUSIVE");

    let mut buf = [0u8; 8];
    vfs.read(file, &mut buf, COUNTER).await?;
    tokio::task::yield_now().await;
    vfs.file_control(file, FileControl::BeginAtomicWrite).await?;
    vfs.write(file, &(u64::from_le_bytes(buf) + 1).to_le_bytes(), COUNTER).await?;
    vfs.file_control(file, FileControl::CommitAtomicWrite).await?;

    holders.fetch_sub(1, Ordering::SeqCst);
    vfs.unlock(file, LockState::None).await?;
    Ok(true)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exclusive_is_never_shared() -> anyhow::Result<()> {
    const CONTEXTS: u64 = 4;
    const INCREMENTS: u64 = 10;

    let engine = MemoryStorageEngine::new();
    let host = VfsHost::local();
    let holders = Arc::new(AtomicUsize::new(0));
    {
        let setup = vfs("setup", &engine, &host);
        let (file, _) = setup.open("main.db", OpenFlags::CREATE | OpenFlags::READWRITE).await?;
        setup.close(file).await?;
    }

    let mut tasks = Vec::new();
    for i in 0..CONTEXTS {
        let (engine, host, holders) = (engine.clone(), host.clone(), holders.clone());
        tasks.push(tokio::spawn(async move {
            let vfs = vfs(&format!("ctx-{i}"), &engine, &host);
            let (file, _) = vfs.open("main.db", OpenFlags::READWRITE).await?;
            let mut rng = StdRng::seed_from_u64(i);
            let mut done = 0;
            while done < INCREMENTS {
                if increment(&vfs, file, &holders).await? {
                    done += 1;
                }
                if rng.gen_bool(0.5) {
                    tokio::task::yield_now().await;
                }
            }
            vfs.close(file).await?;
            Ok::<_, anyhow::Error>(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    let check = vfs("check", &engine, &host);
    let (file, _) = check.open("main.db", OpenFlags::READONLY).await?;
    check.lock(file, LockState::Shared).await?;
    let mut buf = [0u8; 8];
    check.read(file, &mut buf, COUNTER).await?;
    assert_eq!(u64::from_le_bytes(buf), CONTEXTS * INCREMENTS);
    Ok(())
}

#[tokio::test]
async fn second_writer_gets_busy_and_can_retry() -> anyhow::Result<()> {
    let engine = MemoryStorageEngine::new();
    let host = VfsHost::local();
    let a = vfs("a", &engine, &host);
    let b = vfs("b", &engine, &host);
    let (fa, _) = a.open("main.db", OpenFlags::CREATE | OpenFlags::READWRITE).await?;
    let (fb, _) = b.open("main.db", OpenFlags::READWRITE).await?;

    a.lock(fa, LockState::Shared).await?;
    b.lock(fb, LockState::Shared).await?;
    a.lock(fa, LockState::Reserved).await?;
    assert!(b.check_reserved_lock(fb).await?);

    let err = b.lock(fb, LockState::Reserved).await.unwrap_err();
    assert!(matches!(err, VfsError::Busy));
    assert!(err.is_transient());

    b.unlock(fb, LockState::None).await?;
    a.lock(fa, LockState::Exclusive).await?;
    a.unlock(fa, LockState::None).await?;

    b.lock(fb, LockState::Exclusive).await?;
    b.unlock(fb, LockState::None).await?;
    Ok(())
}
