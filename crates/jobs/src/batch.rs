//! Bounded fan-out in fixed-size concurrent groups.
//!
//! Backends with concurrency limits (parallel image pulls, uploads, job
//! submissions) run their work through [`run_in_groups`]: at most
//! `group_size` futures are in flight, a group only starts once the previous
//! one fully succeeded, and the first failure fails the whole batch.

use std::future::Future;

use futures::future::try_join_all;

/// Run `f` over `items` in concurrent groups of `group_size`.
///
/// Results come back in input order. On the first error the remaining
/// members of the failing group are dropped (never left running) and no
/// further group is started.
pub async fn run_in_groups<I, T, E, F, Fut>(
    items: I,
    group_size: usize,
    mut f: F,
) -> Result<Vec<T>, E>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let group_size = group_size.max(1);
    let mut iter = items.into_iter().peekable();
    let mut results = Vec::new();

    while iter.peek().is_some() {
        let group: Vec<Fut> = iter.by_ref().take(group_size).map(&mut f).collect();
        results.extend(try_join_all(group).await?);
    }

    Ok(results)
}
