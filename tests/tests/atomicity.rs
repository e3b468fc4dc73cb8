mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{commit_batch, read_at, vfs};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strata::storage::MemoryStorageEngine;
use strata::vfs::{FileControl, FileHandle, LockState, OpenFlags, PageStore, SyncFlags, Vfs, VfsHost};

const PAGE: usize = 64;
const PAGES: u64 = 8;

fn page(fill: u8) -> Vec<u8> { vec![fill; PAGE] }

#[tokio::test]
async fn readers_see_whole_batches_or_nothing() -> anyhow::Result<()> {
    let engine = MemoryStorageEngine::new();
    let host = VfsHost::local();
    let writer = vfs("writer", &engine, &host);
    let reader = vfs("reader", &engine, &host);
    let (w, _) = writer.open("main.db", OpenFlags::CREATE | OpenFlags::READWRITE | OpenFlags::MAIN_DB).await?;
    let (r, _) = reader.open("main.db", OpenFlags::READWRITE | OpenFlags::MAIN_DB).await?;

    let mut model: Vec<u8> = vec![0; PAGES as usize];
    commit_batch(&writer, w, &(0..PAGES).map(|i| (i * PAGE as u64, page(0))).collect::<Vec<_>>()).await?;

    let mut rng = StdRng::seed_from_u64(0x5eed);
    for round in 1..=60u8 {
        let touched: Vec<u64> = (0..PAGES).filter(|_| rng.gen_bool(0.5)).collect();
        let batch: Vec<(u64, Vec<u8>)> = touched.iter().map(|&i| (i * PAGE as u64, page(round))).collect();

        match rng.gen_range(0..4) {
            // a commit the store rejects
            0 => {
                engine.fail_next_commits(1);
                assert!(commit_batch(&writer, w, &batch).await.is_err());
            }
            // the engine gives up on the statement
            1 => {
                writer.lock(w, LockState::Exclusive).await?;
                writer.file_control(w, FileControl::BeginAtomicWrite).await?;
                for (offset, data) in &batch {
                    writer.write(w, data, *offset).await?;
                }
                writer.file_control(w, FileControl::RollbackAtomicWrite).await?;
                writer.unlock(w, LockState::None).await?;
            }
            _ => {
                commit_batch(&writer, w, &batch).await?;
                for &i in &touched {
                    model[i as usize] = round;
                }
            }
        }

        let seen = read_at(&reader, r, 0, PAGE * PAGES as usize).await?;
        let pages: Vec<u8> = seen.chunks(PAGE).map(|chunk| chunk[0]).collect();
        assert_eq!(pages, model, "round {round}");
        for chunk in seen.chunks(PAGE) {
            assert!(chunk.iter().all(|&b| b == chunk[0]), "torn page in round {round}");
        }
    }
    Ok(())
}

#[tokio::test]
async fn unfinished_batch_is_invisible_after_reopen() -> anyhow::Result<()> {
    let engine = MemoryStorageEngine::new();
    {
        let vfs = vfs("before", &engine, &VfsHost::local());
        let (file, _) = vfs.open("main.db", OpenFlags::CREATE | OpenFlags::READWRITE).await?;
        commit_batch(&vfs, file, &[(0, page(1)), (PAGE as u64, page(1))]).await?;
        vfs.close(file).await?;
    }

    // the context dies between writing pages and publishing the superblock
    {
        let vfs = vfs("crashing", &engine, &VfsHost::local());
        let (file, _) = vfs.open("main.db", OpenFlags::READWRITE).await?;
        vfs.lock(file, LockState::Exclusive).await?;
        vfs.file_control(file, FileControl::BeginAtomicWrite).await?;
        vfs.write(file, &page(2), 0).await?;
        vfs.write(file, &page(2), PAGE as u64).await?;
        vfs.write(file, &page(2), 2 * PAGE as u64).await?;
    }

    let host = VfsHost::local();
    let reopened = vfs("after", &engine, &host);
    let (file, _) = reopened.open("main.db", OpenFlags::READWRITE).await?;
    assert_eq!(reopened.file_size(file).await?, 2 * PAGE as u64);
    assert_eq!(read_at(&reopened, file, 0, 2 * PAGE).await?, [page(1), page(1)].concat());

    commit_batch(&reopened, file, &[(0, page(3)), (PAGE as u64, page(3))]).await?;
    reopened.close(file).await?;

    let check = vfs("check", &engine, &host);
    let (file, _) = check.open("main.db", OpenFlags::READONLY).await?;
    assert_eq!(read_at(&check, file, 0, 2 * PAGE).await?, [page(3), page(3)].concat());
    let superblock = PageStore::new(Arc::clone(check.context()), "main.db")?.read_superblock().await?;
    assert_eq!(superblock.map(|sb| sb.version), Some(2));
    Ok(())
}

#[tokio::test]
async fn page_round_trip_at_any_offset() -> anyhow::Result<()> {
    let engine = MemoryStorageEngine::new();
    let vfs = vfs("roundtrip", &engine, &VfsHost::local());
    let (file, _) = vfs.open("journal", OpenFlags::CREATE | OpenFlags::READWRITE).await?;

    let mut written = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..20 {
        let offset = rng.gen_range(1..64u64) * 512;
        let data: Vec<u8> = (0..rng.gen_range(1..=512)).map(|_| rng.gen()).collect();
        vfs.write(file, &data, offset).await?;
        assert_eq!(read_at(&vfs, file, offset, data.len()).await?, data);
        written.insert(offset, data);
    }
    vfs.sync(file, SyncFlags::NORMAL).await?;

    let other = common::vfs("other", &engine, &VfsHost::local());
    let (file, _) = other.open("journal", OpenFlags::READWRITE).await?;
    for (offset, data) in written {
        assert_eq!(read_at(&other, file, offset, data.len()).await?, data);
    }
    Ok(())
}

/// A first page carrying a database header that records `page_size` and `page_count`.
fn header_page(len: usize, page_size: u16, page_count: u32) -> Vec<u8> {
    let mut data = vec![1; len];
    data[16..18].copy_from_slice(&page_size.to_be_bytes());
    data[28..32].copy_from_slice(&page_count.to_be_bytes());
    data
}

async fn overwrite_and_sync(writer: &Vfs, file: FileHandle) -> anyhow::Result<()> {
    writer.lock(file, LockState::Exclusive).await?;
    writer.file_control(file, FileControl::Overwrite).await?;
    writer.sync(file, SyncFlags::NORMAL).await?;
    writer.file_control(file, FileControl::CommitPhaseTwo).await?;
    writer.unlock(file, LockState::None).await?;
    Ok(())
}

#[tokio::test]
async fn growing_the_page_size_combines_pages() -> anyhow::Result<()> {
    let engine = MemoryStorageEngine::new();
    let host = VfsHost::local();
    let writer = vfs("writer", &engine, &host);
    let (file, _) = writer.open("main.db", OpenFlags::CREATE | OpenFlags::READWRITE).await?;
    let first = header_page(512, 1024, 2);
    commit_batch(&writer, file, &[(0, first.clone()), (512, vec![2; 512]), (1024, vec![3; 512]), (1536, vec![4; 512])]).await?;

    overwrite_and_sync(&writer, file).await?;

    let store = PageStore::new(Arc::clone(writer.context()), "main.db")?;
    let pages = store.all_pages().await?;
    assert_eq!(pages.iter().map(|page| (page.offset, page.data.len())).collect::<Vec<_>>(), vec![(1024, 1024)]);
    let superblock = store.read_superblock().await?.unwrap();
    assert_eq!((superblock.data.len(), superblock.file_size), (1024, 2048));

    let expected = [first, vec![2; 512], vec![3; 512], vec![4; 512]].concat();
    let reader = vfs("reader", &engine, &host);
    let (other, _) = reader.open("main.db", OpenFlags::READWRITE).await?;
    assert_eq!(read_at(&reader, other, 0, 2048).await?, expected);
    Ok(())
}

#[tokio::test]
async fn shrinking_the_page_size_splits_pages() -> anyhow::Result<()> {
    let engine = MemoryStorageEngine::new();
    let host = VfsHost::local();
    let writer = vfs("writer", &engine, &host);
    let (file, _) = writer.open("main.db", OpenFlags::CREATE | OpenFlags::READWRITE).await?;
    let first = header_page(1024, 512, 4);
    let second: Vec<u8> = (0..1024).map(|i| (i / 512) as u8 + 2).collect();
    commit_batch(&writer, file, &[(0, first.clone()), (1024, second.clone())]).await?;

    overwrite_and_sync(&writer, file).await?;

    let store = PageStore::new(Arc::clone(writer.context()), "main.db")?;
    let pages = store.all_pages().await?;
    assert_eq!(pages.iter().map(|page| (page.offset, page.data.len())).collect::<Vec<_>>(), vec![(512, 512), (1024, 512), (1536, 512)]);
    assert_eq!(pages[2].data, vec![3; 512]);
    let superblock = store.read_superblock().await?.unwrap();
    assert_eq!((superblock.data.len(), superblock.file_size), (512, 2048));

    let reader = vfs("reader", &engine, &host);
    let (other, _) = reader.open("main.db", OpenFlags::READWRITE).await?;
    assert_eq!(read_at(&reader, other, 0, 2048).await?, [first, second].concat());
    Ok(())
}

