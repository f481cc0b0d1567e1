use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sketches_ddsketch::DDSketch;
use strata_cache::StoreConfig;
use tokio::sync::Semaphore;

use crate::workloads::{
    MessageStore, Operation, SyntheticOrigin, WorkloadsConfig, process_operation,
};

struct Report {
    concurrency: usize,
    durations: DDSketch,
    errors: usize,
}

pub async fn perform_stresstest(
    config: StoreConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // every workload gets its own store and origin, they only share the table
    let workloads = workloads
        .workloads
        .into_iter()
        .map(|workload| {
            let origin = SyntheticOrigin::new(workload.origin_latency);
            let store = MessageStore::open(&config, Some(origin.clone()))
                .with_context(|| format!("failed to open store for `{}`", workload.name))?;
            Ok((Arc::new(workload), origin, Arc::new(store)))
        })
        .collect::<Result<Vec<_>>>()?;

    // warmup: load the first key of each workload, which also starts the table's batching
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(workload, _, store)| {
            let store = Arc::clone(store);
            let key = (workload.name.clone(), 0);
            tokio::spawn(async move { process_operation(&store, Operation::Read(key)).await })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (workload, _, store) in workloads.iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let workload = Arc::clone(workload);
        let store = Arc::clone(store);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let errors = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let operation = workload.next_operation(&mut rand::rng());
                        let store = Arc::clone(&store);
                        let task_durations = Arc::clone(&task_durations);
                        let errors = Arc::clone(&errors);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            if let Err(error) = process_operation(&store, operation).await {
                                tracing::debug!(%error, "operation failed");
                                errors.fetch_add(1, Ordering::Relaxed);
                            }

                            task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let durations = std::mem::take(&mut *task_durations.lock().unwrap());
            Report {
                concurrency,
                durations,
                errors: errors.load(Ordering::Relaxed),
            }
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for ((workload, origin, store), task) in workloads.iter().zip(finished_tasks) {
        let Report {
            concurrency,
            durations,
            errors,
        } = task.context("workload task panicked")?;

        let flush_start = Instant::now();
        let flushed = store.flush().await;
        let flush_duration = flush_start.elapsed();

        let name = &workload.name;
        let ops = durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!("Workload {name} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        println!(
            "  errors: {errors}; origin fetches: {}; flush: {flush_duration:.2?} ({flushed:?})",
            origin.fetches()
        );

        if ops == 0 {
            continue;
        }
        let quantile = |q| {
            let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
        let p50 = quantile(0.5);
        let p90 = quantile(0.9);
        let p99 = quantile(0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    Ok(())
}
