mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use sqlx_tx_toolkit::{DatabaseConfig, DatabaseFamily, Error, IsolationLevel, PoolStats};

use common::{count_items, init_tracing, recording_db, sqlite_db};

#[tokio::test]
async fn test_committed_work_is_visible() {
   let (db, _temp) = sqlite_db(2).await;

   let id = db
      .transaction(|tx| async move {
         let result = tx
            .execute("INSERT INTO items (name) VALUES ($1)", &[json!("apple")])
            .await?;
         Ok::<_, Error>(result.last_insert_id)
      })
      .await
      .unwrap();

   assert_eq!(id, 1);
   let row = db
      .fetch_one("SELECT name FROM items WHERE id = $1", &[json!(id)])
      .await
      .unwrap()
      .unwrap();
   assert_eq!(row.get("name"), Some(&json!("apple")));
}

#[tokio::test]
async fn test_failed_body_rolls_back() {
   let (db, _temp) = sqlite_db(2).await;

   let err = db
      .transaction(|tx| async move {
         tx.execute("INSERT INTO items (name) VALUES ($1)", &[json!("pear")])
            .await?;
         Err::<(), Error>(Error::Other("body failed".into()))
      })
      .await
      .unwrap_err();

   match err {
      Error::TransactionFailed {
         attempts,
         history,
         source,
      } => {
         assert_eq!(attempts, 1);
         assert_eq!(history.len(), 1);
         assert_eq!(history[0].attempt, 1);
         assert_eq!(history[0].error, "body failed");
         assert_eq!(history[0].rollback_hooks, None);
         assert!(matches!(*source, Error::Other(_)));
      }
      other => panic!("expected TransactionFailed, got {other:?}"),
   }

   assert_eq!(count_items(&db).await, 0);
   assert_eq!(db.stats().active, 1);
   assert_eq!(db.stats().idle, 1);
}

#[tokio::test]
async fn test_retries_until_an_attempt_succeeds() {
   init_tracing();
   let (db, _temp) = sqlite_db(2).await;
   let calls = Arc::new(AtomicU32::new(0));

   let value = db
      .transaction_with(
         |tx| {
            let calls = Arc::clone(&calls);
            async move {
               let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
               tx.execute(
                  "INSERT INTO items (name) VALUES ($1)",
                  &[json!(format!("attempt {n}"))],
               )
               .await?;
               if n < 3 {
                  return Err(Error::Other(format!("transient failure {n}")));
               }
               Ok::<_, Error>(n)
            }
         },
         3,
         None,
      )
      .await
      .unwrap();

   assert_eq!(value, 3);
   assert_eq!(calls.load(Ordering::SeqCst), 3);

   // Only the third attempt's row survives
   let rows = db.query("SELECT name FROM items", &[]).await.unwrap();
   assert_eq!(rows.len(), 1);
   assert_eq!(rows[0].get("name"), Some(&json!("attempt 3")));
}

#[tokio::test]
async fn test_exhausted_attempts_keep_history() {
   let (db, _temp) = sqlite_db(2).await;
   let calls = Arc::new(AtomicU32::new(0));

   let err = db
      .transaction_with(
         |_tx| {
            let calls = Arc::clone(&calls);
            async move {
               let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
               Err::<(), Error>(Error::Other(format!("failure {n}")))
            }
         },
         2,
         None,
      )
      .await
      .unwrap_err();

   assert_eq!(calls.load(Ordering::SeqCst), 2);
   let Error::TransactionFailed {
      attempts,
      history,
      source,
   } = err
   else {
      panic!("expected TransactionFailed, got {err:?}");
   };
   assert_eq!(attempts, 2);
   let errors: Vec<_> = history.iter().map(|a| a.error.as_str()).collect();
   assert_eq!(errors, ["failure 1", "failure 2"]);
   assert_eq!(source.to_string(), "failure 2");
}

#[tokio::test]
async fn test_zero_attempts_is_rejected() {
   let (db, _temp) = sqlite_db(1).await;

   let err = db
      .transaction_with(|_tx| async { Ok::<_, Error>(()) }, 0, None)
      .await
      .unwrap_err();

   assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn test_commit_hooks_run_only_after_commit() {
   let (db, _temp) = sqlite_db(2).await;
   let events = Arc::new(Mutex::new(Vec::new()));

   db.transaction(|tx| {
      let events = Arc::clone(&events);
      async move {
         tx.execute("INSERT INTO items (name) VALUES ($1)", &[json!("kiwi")])
            .await?;

         let on_commit = Arc::clone(&events);
         tx.on_commit(move || async move {
            on_commit.lock().push("commit");
            Ok(())
         })?;
         let on_rollback = Arc::clone(&events);
         tx.on_rollback(move || async move {
            on_rollback.lock().push("rollback");
            Ok(())
         })?;

         assert!(events.lock().is_empty());
         Ok::<_, Error>(())
      }
   })
   .await
   .unwrap();

   assert_eq!(*events.lock(), ["commit"]);
}

#[tokio::test]
async fn test_rollback_hooks_run_per_failed_attempt() {
   init_tracing();
   let (db, _temp) = sqlite_db(2).await;
   let events = Arc::new(Mutex::new(Vec::new()));

   let result = db
      .transaction_with(
         |tx| {
            let events = Arc::clone(&events);
            async move {
               let on_commit = Arc::clone(&events);
               tx.on_commit(move || async move {
                  on_commit.lock().push("commit".to_string());
                  Ok(())
               })?;

               let on_rollback = Arc::clone(&events);
               tx.on_rollback(move || async move {
                  on_rollback.lock().push("rollback".to_string());
                  Err(Error::Other("rollback hook failed".into()))
               })?;
               let on_rollback = Arc::clone(&events);
               tx.on_rollback(move || async move {
                  on_rollback.lock().push("second rollback".to_string());
                  Ok(())
               })?;

               Err::<(), Error>(Error::Other("body failed".into()))
            }
         },
         2,
         None,
      )
      .await;

   // A failing rollback hook never replaces the body's error, but it is
   // recorded on the attempt that ran it
   let err = result.unwrap_err();
   let Error::TransactionFailed {
      source, history, ..
   } = err
   else {
      panic!("expected TransactionFailed, got {err:?}");
   };
   assert_eq!(source.to_string(), "body failed");
   assert_eq!(history.len(), 2);
   for attempt in &history {
      assert_eq!(attempt.error, "body failed");
      let hook_error = attempt.rollback_hooks.as_deref().unwrap();
      assert!(hook_error.contains("1 hook(s) failed"), "{hook_error}");
      assert!(hook_error.contains("rollback hook failed"), "{hook_error}");
   }
   assert_eq!(
      *events.lock(),
      ["rollback", "second rollback", "rollback", "second rollback"]
   );
}

#[tokio::test]
async fn test_failing_commit_hook_is_reported_after_commit() {
   let (db, _temp) = sqlite_db(2).await;
   let ran = Arc::new(AtomicU32::new(0));

   let err = db
      .transaction_with(
         |tx| {
            let ran = Arc::clone(&ran);
            async move {
               tx.execute("INSERT INTO items (name) VALUES ($1)", &[json!("fig")])
                  .await?;

               let first = Arc::clone(&ran);
               tx.on_commit(move || async move {
                  first.fetch_add(1, Ordering::SeqCst);
                  Err(Error::Other("notify failed".into()))
               })?;
               let second = Arc::clone(&ran);
               tx.on_commit(move || async move {
                  second.fetch_add(1, Ordering::SeqCst);
                  Ok(())
               })?;
               Ok::<_, Error>(())
            }
         },
         3,
         None,
      )
      .await
      .unwrap_err();

   match err {
      Error::HookFailed { failed, first } => {
         assert_eq!(failed, 1);
         assert_eq!(first.to_string(), "notify failed");
      }
      other => panic!("expected HookFailed, got {other:?}"),
   }

   // Both hooks ran once, the data is durable and nothing was retried
   assert_eq!(ran.load(Ordering::SeqCst), 2);
   assert_eq!(count_items(&db).await, 1);
}

#[tokio::test]
async fn test_ambient_queries_use_the_transaction_connection() {
   init_tracing();
   // A single connection: routing through the pool here would wait forever
   let (db, _temp) = sqlite_db(1).await;

   let inner = db.clone();
   let seen = tokio::time::timeout(
      Duration::from_secs(5),
      db.transaction(|tx| {
         let db = inner.clone();
         async move {
            assert!(db.in_transaction());
            db.execute("INSERT INTO items (name) VALUES ($1)", &[json!("ambient")])
               .await?;

            // Visible to the handle before commit: same connection
            let through_handle = tx.fetch_value("SELECT COUNT(*) FROM items", &[]).await?;
            let through_wrapper = db.fetch_value("SELECT COUNT(*) FROM items", &[]).await?;
            Ok::<_, Error>((through_handle, through_wrapper))
         }
      }),
   )
   .await
   .expect("ambient query waited on the pool");

   let (through_handle, through_wrapper) = seen.unwrap();
   assert_eq!(through_handle, Some(json!(1)));
   assert_eq!(through_wrapper, Some(json!(1)));
   assert!(!db.in_transaction());
   assert_eq!(count_items(&db).await, 1);
}

#[tokio::test]
async fn test_ambient_writes_roll_back_with_the_transaction() {
   let (db, _temp) = sqlite_db(1).await;

   let inner = db.clone();
   let result = db
      .transaction(|_tx| {
         let db = inner.clone();
         async move {
            db.execute("INSERT INTO items (name) VALUES ($1)", &[json!("lost")])
               .await?;
            Err::<(), Error>(Error::Other("abort".into()))
         }
      })
      .await;

   assert!(result.is_err());
   assert_eq!(count_items(&db).await, 0);
}

#[tokio::test]
async fn test_hooks_outside_transaction_are_rejected() {
   let (db, _temp) = sqlite_db(2).await;

   assert!(!db.in_transaction());
   assert!(matches!(
      db.on_commit(|| async { Ok(()) }),
      Err(Error::NotInTransaction)
   ));
   assert!(matches!(
      db.on_rollback(|| async { Ok(()) }),
      Err(Error::NotInTransaction)
   ));

   // A task spawned from a body is not part of the transaction
   let inner = db.clone();
   let spawned = db
      .transaction(|_tx| {
         let db = inner.clone();
         async move {
            let handle = tokio::spawn(async move { db.on_commit(|| async { Ok(()) }) });
            Ok::<_, Error>(handle.await.expect("spawned task panicked"))
         }
      })
      .await
      .unwrap();

   assert!(matches!(spawned, Err(Error::NotInTransaction)));
}

#[tokio::test]
async fn test_handle_is_dead_after_the_attempt() {
   let (db, _temp) = sqlite_db(1).await;
   let leaked = Arc::new(Mutex::new(None));

   db.transaction(|tx| {
      let leaked = Arc::clone(&leaked);
      async move {
         *leaked.lock() = Some(tx.clone());
         Ok::<_, Error>(())
      }
   })
   .await
   .unwrap();

   let tx = leaked.lock().take().unwrap();
   assert!(matches!(
      tx.query("SELECT 1", &[]).await,
      Err(Error::TransactionAlreadyFinalized)
   ));
   assert!(matches!(
      tx.connection().await,
      Err(Error::TransactionAlreadyFinalized)
   ));
}

#[tokio::test]
async fn test_query_errors_release_the_connection() {
   let (db, _temp) = sqlite_db(1).await;

   let err = db
      .query("SELECT * FROM missing_table", &[])
      .await
      .unwrap_err();
   assert!(matches!(err, Error::Query { .. }));
   assert_eq!(
      db.stats(),
      PoolStats {
         active: 1,
         idle: 1,
         waiting: 0,
         max_size: 1
      }
   );

   // And the single connection is usable again
   assert_eq!(count_items(&db).await, 0);
}

#[tokio::test]
async fn test_nested_transaction_is_independent() {
   let (db, connector) = recording_db(
      DatabaseConfig::network("pgsql", "localhost", "app"),
      DatabaseFamily::Postgres,
   );

   let inner = db.clone();
   db.transaction(|outer_tx| {
      let db = inner.clone();
      async move {
         outer_tx.execute("outer", &[]).await?;

         let inner_id = db
            .transaction(|tx| async move {
               tx.execute("inner", &[]).await?;
               Ok::<_, Error>(tx.connection_id())
            })
            .await?;
         assert_ne!(inner_id, outer_tx.connection_id());

         // Back in the outer body, ambient queries find the outer transaction
         assert!(db.in_transaction());
         db.execute("after", &[]).await?;
         Ok::<_, Error>(())
      }
   })
   .await
   .unwrap();

   let set = "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL READ COMMITTED";
   assert_eq!(
      connector.statements(),
      [set, "BEGIN", "outer", set, "BEGIN", "inner", "COMMIT", "after", "COMMIT"]
   );
   assert_eq!(db.stats().idle, 2);
}

#[tokio::test]
async fn test_transaction_on_another_database_keeps_outer_routing() {
   let (orders, _orders_temp) = sqlite_db(1).await;
   let (audit, _audit_temp) = sqlite_db(1).await;

   let (orders_inner, audit_inner) = (orders.clone(), audit.clone());
   let result = tokio::time::timeout(
      Duration::from_secs(5),
      orders.transaction(|_tx| {
         let (orders, audit) = (orders_inner.clone(), audit_inner.clone());
         async move {
            orders
               .execute("INSERT INTO items (name) VALUES ($1)", &[json!("order")])
               .await?;

            let orders_in_audit = orders.clone();
            audit
               .transaction(|audit_tx| {
                  let orders = orders_in_audit.clone();
                  async move {
                     audit_tx
                        .execute("INSERT INTO items (name) VALUES ($1)", &[json!("audit")])
                        .await?;
                     // Both pools hold one connection; this only completes
                     // if it reuses the outer transaction on `orders`
                     orders.fetch_value("SELECT COUNT(*) FROM items", &[]).await
                  }
               })
               .await
         }
      }),
   )
   .await
   .expect("query on the outer database waited on its pool");

   assert_eq!(result.unwrap(), Some(json!(1)));
   assert_eq!(count_items(&orders).await, 1);
   assert_eq!(count_items(&audit).await, 1);
}

#[tokio::test]
async fn test_isolation_statement_runs_before_begin() {
   let (db, connector) = recording_db(
      DatabaseConfig::network("pgsql", "localhost", "app"),
      DatabaseFamily::Postgres,
   );

   db.transaction_with(
      |tx| async move {
         tx.execute("UPDATE accounts SET balance = 0", &[]).await?;
         Ok::<_, Error>(())
      },
      1,
      Some(IsolationLevel::Serializable),
   )
   .await
   .unwrap();

   assert_eq!(
      connector.statements(),
      [
         "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL SERIALIZABLE",
         "BEGIN",
         "UPDATE accounts SET balance = 0",
         "COMMIT",
      ]
   );
}

#[tokio::test]
async fn test_default_isolation_per_family() {
   let (db, connector) = recording_db(
      DatabaseConfig::network("mysql", "localhost", "app"),
      DatabaseFamily::MySql,
   );

   db.transaction(|_tx| async { Ok::<_, Error>(()) })
      .await
      .unwrap();

   assert_eq!(
      connector.statements(),
      [
         "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
         "BEGIN",
         "COMMIT",
      ]
   );
}

#[tokio::test]
async fn test_unsupported_isolation_fails_before_connecting() {
   let config = DatabaseConfig {
      driver: "duckdb".into(),
      database: Some("analytics.duckdb".into()),
      ..Default::default()
   };
   let (db, connector) = recording_db(config, DatabaseFamily::DuckDb);

   let err = db
      .transaction_with(
         |_tx| async { Ok::<_, Error>(()) },
         3,
         Some(IsolationLevel::Serializable),
      )
      .await
      .unwrap_err();

   assert!(matches!(err, Error::Transaction(_)));
   assert!(connector.statements().is_empty());
   assert_eq!(db.stats().active, 0);

   // The family default needs no statement at all
   db.transaction(|_tx| async { Ok::<_, Error>(()) })
      .await
      .unwrap();
   assert_eq!(connector.statements(), ["BEGIN", "COMMIT"]);
}

#[tokio::test]
async fn test_closed_pool_fails_transactions_immediately() {
   let (db, _temp) = sqlite_db(1).await;
   db.close();

   let calls = Arc::new(AtomicU32::new(0));
   let err = db
      .transaction_with(
         |_tx| {
            let calls = Arc::clone(&calls);
            async move {
               calls.fetch_add(1, Ordering::SeqCst);
               Ok::<_, Error>(())
            }
         },
         3,
         None,
      )
      .await
      .unwrap_err();

   assert!(matches!(
      err,
      Error::ConnectionManager(sqlx_conn_pool::Error::PoolClosed)
   ));
   assert_eq!(calls.load(Ordering::SeqCst), 0);
}
