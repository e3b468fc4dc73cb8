mod common;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::setup_db;
use strata::error::DbError;
use strata::notify::channel_name;
use strata::{ChangeMessage, ChannelHub, LiveQuery, Query, TableRef, TransactionKind};

#[tokio::test]
async fn notes_write_reruns_only_notes_watchers() -> anyhow::Result<()> {
    let hub = ChannelHub::new();
    let (db, _runner, notifier) = setup_db("app", &hub).await?;

    let raw = Arc::new(Mutex::new(Vec::new()));
    let sink = raw.clone();
    let _guard = hub.channel(&channel_name("app")).listen(move |message| sink.lock().unwrap().push(message.to_owned()));

    let mut notes = LiveQuery::start(&db, &hub, vec![Query::new("SELECT * FROM notes").reads("notes")]).await?;
    let mut comments = LiveQuery::start(&db, &hub, vec![Query::new("SELECT * FROM comments").reads("comments")]).await?;

    db.run_query(Query::new("INSERT INTO notes (title) VALUES (?)").bind("hello").writes("notes")).await?;
    notifier.flushed().await;

    assert_eq!(*raw.lock().unwrap(), vec![r#"{"changesInTables":["notes"]}"#.to_owned()]);
    let message: ChangeMessage = serde_json::from_str(&raw.lock().unwrap()[0])?;
    assert!(message.intersects(&BTreeSet::from(["notes".to_owned()])));
    assert!(!message.intersects(&BTreeSet::from(["comments".to_owned()])));
    assert!(tokio::time::timeout(Duration::from_secs(5), notes.changed()).await?);
    assert_eq!(notes.snapshot().run, 2);
    assert!(tokio::time::timeout(Duration::from_millis(50), comments.changed()).await.is_err());
    assert_eq!(comments.snapshot().run, 1);
    Ok(())
}

#[tokio::test]
async fn derived_tables_and_committed_transactions_publish() -> anyhow::Result<()> {
    let hub = ChannelHub::new();
    let (db, _runner, notifier) = setup_db("derived", &hub).await?;
    let mut search = LiveQuery::start(&db, &hub, vec![Query::new("SELECT * FROM notes_fts").reads("notes_fts")]).await?;

    db.run_in_transaction(TransactionKind::Immediate, |tx| async move {
        tx.run_query(Query::new("INSERT INTO notes VALUES (1)").writes(TableRef::new("notes").depends_on("notes_fts"))).await?;
        Ok::<_, DbError>(())
    })
    .await?;
    notifier.flushed().await;

    assert!(tokio::time::timeout(Duration::from_secs(5), search.changed()).await?);
    assert_eq!(search.snapshot().run, 2);
    Ok(())
}

#[tokio::test]
async fn contexts_of_one_database_share_the_channel() -> anyhow::Result<()> {
    let hub = ChannelHub::new();
    let (writer, _runner, notifier) = setup_db("shared", &hub).await?;
    let (reader, _other_runner, _other_notifier) = setup_db("shared", &hub).await?;
    let mut watched = LiveQuery::start(&reader, &hub, vec![Query::new("SELECT * FROM tags").reads("tags")]).await?;

    writer.run_query(Query::new("DELETE FROM tags").writes("tags")).await?;
    notifier.flushed().await;

    assert!(tokio::time::timeout(Duration::from_secs(5), watched.changed()).await?);
    drop(watched);
    assert_eq!(hub.channel(&channel_name("shared")).listener_count(), 0);
    Ok(())
}
