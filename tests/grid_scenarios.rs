//! End-to-end behaviour of the phased computation grid
//!
//! Parties are plain indices; phase bodies build strings from the
//! `(phase, party)` names so results show who produced them.

use bear::{Grid, PartyState, Phase, PhaseContext, PhaseError, PhaseKey, WorkerPool};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn pool() -> WorkerPool {
    WorkerPool::new(10).unwrap()
}

fn parties(count: usize) -> Vec<usize> {
    (0..count).collect()
}

fn named(name: &str) -> Phase<usize, String> {
    Phase::from_fn(name, |ctx: PhaseContext<usize>| async move { Ok(ctx.name()) })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_phase_labels() {
    let mut builder = Grid::builder(1, parties(3));
    let phase1 = builder
        .add_phase(Phase::from_fn("label", |ctx: PhaseContext<usize>| async move {
            Ok(format!("phase 1, party {}", ctx.party().index()))
        }))
        .unwrap();
    let grid = builder.start(&pool()).unwrap();

    let labels: Vec<String> = grid
        .aggregate_successful(phase1)
        .await
        .unwrap()
        .into_iter()
        .map(|label| label.unwrap().to_string())
        .collect();

    assert_eq!(
        labels,
        vec!["phase 1, party 0", "phase 1, party 1", "phase 1, party 2"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_everyone_reads_one_cell() {
    let mut builder = Grid::builder(2, parties(3));
    let phase1 = builder.add_phase(named("name")).unwrap();
    let phase2 = builder
        .add_phase(Phase::from_fn("depend", move |ctx: PhaseContext<usize>| async move {
            let shared = ctx
                .grid()
                .cell(phase1, 2)
                .get_timeout(Duration::from_millis(500))
                .await?;
            Ok(format!("{}: we all depend on a cell {}", ctx.name(), shared))
        }))
        .unwrap();
    let grid = builder.start(&pool()).unwrap();

    let results = grid.aggregate_successful(phase2).await.unwrap();
    for (index, result) in results.iter().enumerate() {
        assert_eq!(
            result.as_deref().map(String::as_str),
            Some(format!("(1, {}): we all depend on a cell (0, 2)", index).as_str())
        );
    }
}

/// Phase 1 fails for `thrower`. In phase 2 every party either reads the
/// phase-1 cell of party 2 with a bound, or only its own phase-1 cell.
async fn failure_experiment(all_depend: bool, thrower: usize) -> (Grid<usize>, Vec<Option<String>>) {
    let mut builder = Grid::builder(2, parties(3));
    let phase1: PhaseKey<String> = builder
        .add_phase(Phase::from_fn("maybe fail", move |ctx: PhaseContext<usize>| async move {
            if ctx.party().index() == thrower {
                anyhow::bail!("{}", thrower);
            }
            Ok(ctx.name())
        }))
        .unwrap();
    let phase2 = builder
        .add_phase(Phase::from_fn("read", move |ctx: PhaseContext<usize>| async move {
            if all_depend {
                let shared = ctx
                    .grid()
                    .cell(phase1, 2)
                    .get_timeout(Duration::from_millis(500))
                    .await?;
                Ok(format!("{}: we all depend on a cell {}", ctx.name(), shared))
            } else {
                let own = ctx.grid().cell(phase1, ctx.party().index()).get().await?;
                Ok(format!("{}, {}", own, ctx.name()))
            }
        }))
        .unwrap();
    let grid = builder.start(&pool()).unwrap();

    let results: Vec<Option<String>> = grid
        .aggregate_successful(phase2)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.map(|s| s.to_string()))
        .collect();

    for (index, result) in results.iter().enumerate() {
        if result.is_none() {
            let party = grid.party(index);
            assert_eq!(party.state(), PartyState::Broken);
            assert!(party.failure().is_some());
        }
    }

    (grid, results)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_dependency_failure_cascades() {
    let (grid, results) = failure_experiment(true, 2).await;
    assert_eq!(results, vec![None, None, None]);

    for index in 0..2 {
        assert_eq!(grid.party(index).broken_at(), Some(1));
        let failure = grid.party(index).failure().unwrap();
        let dependency = failure.dependency().expect("failure comes from the wait");
        assert!(!dependency.is_timeout());
        assert!(matches!(
            dependency,
            PhaseError::Computation {
                phase: 0,
                party: 2,
                ..
            }
        ));
    }

    assert_eq!(grid.party(2).broken_at(), Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unrelated_failure_is_isolated() {
    let (_, results) = failure_experiment(true, 0).await;
    assert!(results[0].is_none());
    assert_eq!(results[1].as_deref(), Some("(1, 1): we all depend on a cell (0, 2)"));
    assert_eq!(results[2].as_deref(), Some("(1, 2): we all depend on a cell (0, 2)"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_own_dependency_only() {
    let (grid, results) = failure_experiment(false, 0).await;
    assert_eq!(
        results,
        vec![
            None,
            Some("(0, 1), (1, 1)".to_string()),
            Some("(0, 2), (1, 2)".to_string()),
        ]
    );
    assert_eq!(grid.broken_parties(), vec![0]);

    let (_, results) = failure_experiment(false, 2).await;
    assert!(results[0].is_some());
    assert!(results[1].is_some());
    assert!(results[2].is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_broken_party_skips_later_phases() {
    let invoked = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)]);

    let counting = |phase: usize, fail_party: Option<usize>| {
        let invoked = invoked.clone();
        Phase::from_fn(format!("phase {}", phase), move |ctx: PhaseContext<usize>| {
            let invoked = invoked.clone();
            async move {
                invoked[phase].fetch_add(1, Ordering::SeqCst);
                if Some(ctx.party().index()) == fail_party {
                    anyhow::bail!("party {} failed", ctx.party().index());
                }
                Ok(phase)
            }
        })
    };

    let mut builder = Grid::builder(3, parties(3));
    let first = builder.add_phase(counting(0, Some(1))).unwrap();
    let second = builder.add_phase(counting(1, None)).unwrap();
    let third = builder.add_phase(counting(2, None)).unwrap();
    let grid = builder.start(&pool()).unwrap();
    grid.join().await;

    assert_eq!(invoked[0].load(Ordering::SeqCst), 3);
    assert_eq!(invoked[1].load(Ordering::SeqCst), 2);
    assert_eq!(invoked[2].load(Ordering::SeqCst), 2);

    let err = grid.cell(first, 1).get().await.unwrap_err();
    assert!(matches!(err, PhaseError::Computation { phase: 0, party: 1, .. }));
    for key in [second, third] {
        let err = grid.cell(key, 1).get().await.unwrap_err();
        assert!(err.is_upstream());
        assert_eq!(err.cause().unwrap().to_string(), "party 1 failed");
        assert_eq!(*grid.cell(key, 0).get().await.unwrap(), key.index());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_aggregate_has_one_entry_per_party() {
    let mut builder = Grid::builder(1, parties(7));
    let key = builder
        .add_phase(Phase::new("odd fails", |input: &usize| {
            let input = *input;
            move |_ctx: PhaseContext<usize>| async move {
                tokio::time::sleep(Duration::from_millis((7 - input as u64) * 5)).await;
                if input % 2 == 1 {
                    anyhow::bail!("odd");
                }
                Ok(input * 10)
            }
        }))
        .unwrap();
    let grid = builder.start(&pool()).unwrap();

    let results: Vec<Option<usize>> = grid
        .aggregate_successful(key)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.map(|v| *v))
        .collect();
    assert_eq!(
        results,
        vec![Some(0), None, Some(20), None, Some(40), None, Some(60)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_previous_result() {
    let mut builder = Grid::builder(3, parties(2));
    builder.add_phase(named("first")).unwrap();
    let second = builder
        .add_phase(Phase::from_fn("second", |ctx: PhaseContext<usize>| async move {
            let first_phase = ctx.grid().previous_result::<String>(ctx.party(), 0).await;
            assert!(first_phase.is_none());

            let previous = ctx.previous_result::<String>().await.unwrap();
            let wrong_type = ctx.previous_result::<u64>().await;
            Ok((previous.to_string(), wrong_type.is_none()))
        }))
        .unwrap();
    let third = builder
        .add_phase(Phase::from_fn("third", |ctx: PhaseContext<usize>| async move {
            let previous = ctx.previous_result::<(String, bool)>().await;
            Ok(previous.map(|p| p.0.clone()))
        }))
        .unwrap();
    let grid = builder.start(&pool()).unwrap();

    let second_results = grid.aggregate_successful(second).await.unwrap();
    assert_eq!(
        second_results[1].as_deref(),
        Some(&("(0, 1)".to_string(), true))
    );
    let third_results = grid.aggregate_successful(third).await.unwrap();
    assert_eq!(third_results[0].as_deref(), Some(&Some("(0, 0)".to_string())));
}

#[derive(Debug, Clone)]
struct Download {
    result: Option<String>,
    computation: Option<String>,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight_download_shared_by_phase() {
    let entries = Arc::new(AtomicUsize::new(0));
    let download = Arc::new(bear::OnceEntered::<String>::new());

    let mut builder = Grid::builder(2, parties(3));
    let phase1 = {
        let entries = entries.clone();
        let download = download.clone();
        builder
            .add_phase(Phase::from_fn("download", move |ctx: PhaseContext<usize>| {
                let entries = entries.clone();
                let download = download.clone();
                async move {
                    if ctx.party().index() != 2 {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                    }
                    let name = ctx.name();
                    let flight = download.run_once(ctx.party().index(), move || async move {
                        entries.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok(format!("downloaded by {}", name))
                    });
                    Ok(flight.wait().await?.to_string())
                }
            }))
            .unwrap()
    };
    let phase2 = builder
        .add_phase(Phase::from_fn("use", move |ctx: PhaseContext<usize>| async move {
            let downloaded = ctx.grid().cell(phase1, 1).get().await?;
            Ok(format!("{}: {}", ctx.name(), downloaded))
        }))
        .unwrap();
    let grid = builder.start(&pool()).unwrap();

    let results = grid.aggregate_successful(phase2).await.unwrap();
    assert_eq!(entries.load(Ordering::SeqCst), 1);
    assert_eq!(download.owner(), Some(2));
    for result in results {
        assert!(result.unwrap().contains("downloaded by (0, 2)"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parties_find_who_downloaded() {
    let entries = Arc::new(AtomicUsize::new(0));
    let download = Arc::new(bear::OnceEntered::<String>::new());

    let mut builder = Grid::builder(2, parties(3));
    let phase1: PhaseKey<Download> = {
        let entries = entries.clone();
        let download = download.clone();
        builder
            .add_phase(Phase::from_fn("download", move |ctx: PhaseContext<usize>| {
                let entries = entries.clone();
                let download = download.clone();
                async move {
                    if ctx.party().index() != 2 {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                    }
                    let name = ctx.name();
                    let flight = download.run_once(ctx.party().index(), {
                        let name = name.clone();
                        move || async move {
                            entries.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(600)).await;
                            Ok(format!("downloaded by {}", name))
                        }
                    });

                    if flight.is_owner() {
                        Ok(Download {
                            result: Some(flight.wait().await?.to_string()),
                            computation: None,
                        })
                    } else {
                        Ok(Download {
                            result: None,
                            computation: Some(format!("{} - quick computation", name)),
                        })
                    }
                }
            }))
            .unwrap()
    };
    let phase2 = builder
        .add_phase(Phase::from_fn("find", move |ctx: PhaseContext<usize>| async move {
            let index = ctx.party().index();
            let cells = ctx.grid().phase_cells(phase1);
            if index != 2 {
                // the downloading party is still busy when the quick ones get here
                assert!(!cells[2].is_done());
            }

            let result = 'found: loop {
                for cell in &cells {
                    if let Some(Ok(download)) = cell.try_get() {
                        if let Some(result) = &download.result {
                            break 'found result.clone();
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            };

            if index != 2 {
                assert!(cells[2].is_done());
            }

            let own = ctx.previous_result::<Download>().await.unwrap();
            Ok(format!(
                "{}: {}, derived computation: '{}'",
                ctx.name(),
                result,
                own.computation.clone().unwrap_or_else(|| "none".to_string())
            ))
        }))
        .unwrap();
    let grid = builder.start(&pool()).unwrap();

    let results = grid.aggregate_successful(phase2).await.unwrap();
    assert_eq!(entries.load(Ordering::SeqCst), 1);
    assert!(grid.broken_parties().is_empty());

    for (index, result) in results.iter().enumerate() {
        let result = result.as_deref().unwrap();
        assert!(result.contains("downloaded by (0, 2)"));
        if index == 2 {
            assert!(result.contains("computation: 'none'"));
        } else {
            assert!(result.contains(&format!("derived computation: '(0, {})", index)));
        }
    }
}
