//! End-to-end pool scenarios against the stock worker binary.

use commons::prelude_errors::*;
use commons::testing::init_runtime;
use futures::future::join_all;
use pretty_assertions::assert_eq;
use procpool::{Pool, PoolError, PoolSettings, Task};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

fn settings() -> PoolSettings {
    PoolSettings {
        worker_path: PathBuf::from(env!("CARGO_BIN_EXE_procpool-worker")),
        ..Default::default()
    }
}

#[test]
fn doubles_concurrently() -> Fallible<()> {
    let runtime = init_runtime()?;
    runtime.block_on(async {
        let pool = Pool::new(PoolSettings {
            max_procs: 4,
            ..settings()
        })?;
        let double = Task::func("double");

        let calls = (1..=20).map(|i| {
            let pool = pool.clone();
            let double = double.clone();
            async move { pool.process(&double, vec![json!(i)]).await }
        });
        let results = join_all(calls).await;
        for (i, result) in (1..=20).zip(results) {
            assert_eq!(result?, json!(i * 2));
        }

        pool.shutdown().await;
        Ok(())
    })
}

#[test]
fn single_worker_serves_many_clients() -> Fallible<()> {
    let runtime = init_runtime()?;
    runtime.block_on(async {
        let pool = Pool::new(PoolSettings {
            max_procs: 1,
            ..settings()
        })?;
        let pid = Task::func("pid");

        let calls = (0..10).map(|_| {
            let pool = pool.clone();
            let pid = pid.clone();
            async move { pool.process(&pid, vec![]).await }
        });
        let mut pids = HashSet::new();
        for result in join_all(calls).await {
            let value = result?;
            let pid = value
                .as_u64()
                .ok_or_else(|| format_err!("pid task returned {}", value))?;
            pids.insert(pid);
        }
        assert_eq!(pids.len(), 1);

        pool.shutdown().await;
        Ok(())
    })
}

#[test]
fn map_preserves_input_order() -> Fallible<()> {
    let runtime = init_runtime()?;
    runtime.block_on(async {
        let pool = Pool::new(PoolSettings {
            max_procs: 4,
            ..settings()
        })?;

        let inputs: Vec<Value> = (1..=100).map(|i| json!(i)).collect();
        let results = pool.map(&Task::func("double"), inputs).await?;
        let expected: Vec<Value> = (1..=100).map(|i| json!(i * 2)).collect();
        assert_eq!(results, expected);

        pool.shutdown().await;
        Ok(())
    })
}

#[test]
fn map_flattens_array_results_in_position_order() -> Fallible<()> {
    let runtime = init_runtime()?;
    runtime.block_on(async {
        let pool = Pool::new(PoolSettings {
            max_procs: 2,
            ..settings()
        })?;

        let results = pool
            .map(&Task::func("range"), vec![json!(2), json!(3)])
            .await?;
        assert_eq!(
            results,
            vec![json!(0), json!(1), json!(0), json!(1), json!(2)]
        );

        pool.shutdown().await;
        Ok(())
    })
}

#[test]
fn defer_returns_before_results_are_drained() -> Fallible<()> {
    let runtime = init_runtime()?;
    runtime.block_on(async {
        let pool = Pool::new(PoolSettings {
            max_procs: 2,
            ..settings()
        })?;
        let double = Task::func("double");

        let mut handles = Vec::new();
        for i in 1..=8 {
            handles.push(pool.defer(&double, vec![json!(i)]).await?);
        }

        // Collect in reverse order of dispatch.
        let mut results = Vec::new();
        for handle in handles.into_iter().rev() {
            results.push(handle.get().await?);
        }
        let expected: Vec<Value> = (1..=8).rev().map(|i| json!(i * 2)).collect();
        assert_eq!(results, expected);

        pool.shutdown().await;
        Ok(())
    })
}

#[test]
fn max_reqs_recycles_workers() -> Fallible<()> {
    let runtime = init_runtime()?;
    runtime.block_on(async {
        let pool = Pool::new(PoolSettings {
            max_procs: 2,
            max_reqs: 5,
            ..settings()
        })?;
        let pid = Task::func("pid");

        let mut pids = HashSet::new();
        for _ in 0..50 {
            let value = pool.process(&pid, vec![]).await?;
            let pid = value
                .as_u64()
                .ok_or_else(|| format_err!("pid task returned {}", value))?;
            pids.insert(pid);
        }
        assert!(
            pids.len() >= 10,
            "expected at least 10 distinct workers, saw {}",
            pids.len()
        );

        pool.shutdown().await;
        Ok(())
    })
}

#[test]
fn task_failure_does_not_poison_the_pool() -> Fallible<()> {
    let runtime = init_runtime()?;
    runtime.block_on(async {
        let pool = Pool::new(PoolSettings {
            max_procs: 2,
            ..settings()
        })?;

        let err = pool
            .process(&Task::func("fail"), vec![json!("broken by request")])
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::TaskFailure("broken by request".to_string()));

        let value = pool.process(&Task::func("double"), vec![json!(5)]).await?;
        assert_eq!(value, json!(10));
        assert_eq!(pool.capacity(), 2);

        pool.shutdown().await;
        Ok(())
    })
}

#[test]
fn worker_death_is_contained() -> Fallible<()> {
    let runtime = init_runtime()?;
    runtime.block_on(async {
        let pool = Pool::new(PoolSettings {
            max_procs: 2,
            ..settings()
        })?;

        let err = pool.process(&Task::func("die"), vec![]).await.unwrap_err();
        assert_eq!(err, PoolError::WorkerDied);

        // The dead worker was retired; a fresh one picks up new work.
        let value = pool.process(&Task::func("double"), vec![json!(3)]).await?;
        assert_eq!(value, json!(6));
        assert_eq!(pool.capacity(), 2);

        pool.shutdown().await;
        Ok(())
    })
}

#[test]
fn concurrency_is_bounded_by_max_procs() -> Fallible<()> {
    let runtime = init_runtime()?;
    runtime.block_on(async {
        let pool = Pool::new(PoolSettings {
            max_procs: 2,
            ..settings()
        })?;
        let sleep = Task::func("sleep_ms");

        let started = Instant::now();
        let calls = (0..4).map(|_| {
            let pool = pool.clone();
            let sleep = sleep.clone();
            async move { pool.process(&sleep, vec![json!(100)]).await }
        });
        for result in join_all(calls).await {
            assert_eq!(result?, json!(100));
        }
        // Four 100ms naps through two workers take at least two rounds.
        assert!(started.elapsed() >= Duration::from_millis(200));

        pool.shutdown().await;
        Ok(())
    })
}

#[test]
fn class_tasks_construct_then_run() -> Fallible<()> {
    let runtime = init_runtime()?;
    runtime.block_on(async {
        let pool = Pool::new(PoolSettings {
            max_procs: 1,
            ..settings()
        })?;

        let value = pool
            .process(&Task::class("repeat"), vec![json!("ok"), json!(2)])
            .await?;
        assert_eq!(value, json!(["ok", "ok"]));

        pool.shutdown().await;
        Ok(())
    })
}

#[test]
fn shutdown_restores_capacity_and_closes_the_pool() -> Fallible<()> {
    let runtime = init_runtime()?;
    runtime.block_on(async {
        let pool = Pool::new(PoolSettings {
            max_procs: 2,
            ..settings()
        })?;
        let double = Task::func("double");

        pool.process(&double, vec![json!(2)]).await?;
        pool.shutdown().await;

        assert_eq!(pool.capacity(), 2);
        let err = pool.process(&double, vec![json!(1)]).await.unwrap_err();
        assert_eq!(err, PoolError::PoolClosed);

        // Idempotent.
        pool.shutdown().await;
        assert_eq!(pool.capacity(), 2);
        Ok(())
    })
}

#[test]
fn include_dirs_are_passed_through_to_the_worker() -> Fallible<()> {
    let runtime = init_runtime()?;
    runtime.block_on(async {
        let dir = tempfile::tempdir()?;
        let pool = Pool::new(PoolSettings {
            max_procs: 1,
            include: vec![dir.path().to_path_buf()],
            ..settings()
        })?;

        // The worker accepts the injected argv and still serves tasks.
        let value = pool.process(&Task::func("echo"), vec![json!("hi")]).await?;
        assert_eq!(value, json!(["hi"]));

        pool.shutdown().await;
        Ok(())
    })
}

#[test]
fn missing_worker_binary_is_a_spawn_error() -> Fallible<()> {
    let runtime = init_runtime()?;
    runtime.block_on(async {
        let pool = Pool::new(PoolSettings {
            max_procs: 1,
            worker_path: PathBuf::from("/definitely/not/a/worker"),
            ..Default::default()
        })?;

        let err = pool
            .process(&Task::func("double"), vec![json!(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Spawn(_)));
        // The failed checkout returned its permit.
        assert_eq!(pool.capacity(), 1);

        pool.shutdown().await;
        Ok(())
    })
}
