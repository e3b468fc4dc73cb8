mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::setup_db;
use strata::error::{DbError, SchedulerError};
use strata::scheduler::{Job, JobKind};
use strata::{ChannelHub, JobScheduler, Query, TransactionKind};

#[tokio::test]
async fn concurrent_transactions_never_interleave() -> anyhow::Result<()> {
    let hub = ChannelHub::new();
    let (db, runner, _notifier) = setup_db("interleave", &hub).await?;

    let mut tasks = Vec::new();
    for i in 0..4 {
        let db = db.clone();
        tasks.push(tokio::spawn(async move {
            db.run_in_transaction(TransactionKind::Immediate, |tx| async move {
                for step in 0..3 {
                    tx.run_query(Query::new(format!("INSERT INTO t{i} VALUES ({step})"))).await?;
                    tokio::task::yield_now().await;
                }
                Ok::<_, DbError>(())
            })
            .await
        }));
    }
    for i in 0..4 {
        let db = db.clone();
        tasks.push(tokio::spawn(async move { db.run_query(Query::new(format!("SELECT {i}"))).await.map(|_| ()) }));
    }
    for task in tasks {
        task.await??;
    }

    // every BEGIN is followed by its own statements and COMMIT before anything else
    let statements = runner.executor().statements();
    let mut open: Option<String> = None;
    for statement in &statements {
        match (open.clone(), statement.as_str()) {
            (None, s) if s.starts_with("BEGIN") => open = Some(String::new()),
            (Some(_), "COMMIT") => open = None,
            (Some(table), s) if s.starts_with("INSERT INTO") => {
                let this = s.split_whitespace().nth(2).unwrap_or_default().to_owned();
                if table.is_empty() {
                    open = Some(this);
                } else {
                    assert_eq!(table, this, "statements interleaved: {statements:?}");
                }
            }
            (None, s) => assert!(s.starts_with("SELECT"), "unexpected {s}"),
            (Some(_), s) => panic!("{s} ran inside another transaction: {statements:?}"),
        }
    }
    assert_eq!(statements.len(), 4 * 5 + 4);
    assert!(runner.scheduler().is_idle());
    Ok(())
}

#[tokio::test]
async fn jobs_are_granted_in_submission_order() -> anyhow::Result<()> {
    let scheduler = JobScheduler::default();
    let order = Arc::new(Mutex::new(Vec::new()));
    let blocker = Job::new(JobKind::Init);
    scheduler.acquire(blocker.clone()).await?;

    let mut tasks = Vec::new();
    for (i, work) in [30u64, 10, 0].into_iter().enumerate() {
        let (sched, order) = (scheduler.clone(), order.clone());
        tasks.push(tokio::spawn(async move {
            let job = Job::new(JobKind::RunQueries);
            sched.acquire(job.clone()).await?;
            order.lock().unwrap().push(i);
            // later jobs finish their own work faster, but only start after the earlier ones
            tokio::time::sleep(Duration::from_millis(work)).await;
            sched.release(&job)?;
            Ok::<_, SchedulerError>(())
        }));
        while scheduler.dump().queue.len() < i + 1 {
            tokio::task::yield_now().await;
        }
    }

    scheduler.release(&blocker)?;
    for task in tasks {
        task.await??;
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    Ok(())
}

#[tokio::test]
async fn failed_statement_keeps_the_connection_usable() -> anyhow::Result<()> {
    let hub = ChannelHub::new();
    let (db, runner, _notifier) = setup_db("recover", &hub).await?;

    let err = db.run_query(Query::new("SELECT * FROM FAIL")).await.unwrap_err();
    assert!(err.to_string().contains("SELECT * FROM FAIL"));
    assert!(!err.is_fatal());

    let err = db.run_atomic_transaction(TransactionKind::Deferred, vec![Query::new("INSERT INTO a VALUES (1)"), Query::new("INSERT INTO FAIL VALUES (1)")]).await.unwrap_err();
    assert!(matches!(err, DbError::QueryRun { .. }));

    db.run_query(Query::new("SELECT 1")).await?;
    assert!(runner.scheduler().is_idle());
    assert_eq!(runner.executor().statements().last().map(String::as_str), Some("SELECT 1"));
    Ok(())
}
