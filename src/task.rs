//! Helpers for running groups of tasks
//!
//! [`run_all`] waits for every task and reports all distinct failures.
//! [`race`] returns as soon as the first task finishes, whatever its outcome,
//! and cancels the rest.

use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use std::collections::HashSet;
use std::future::Future;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Several distinct task failures.
#[derive(Debug, thiserror::Error)]
#[error("{}", render(.errors))]
pub struct MultiError {
    errors: Vec<anyhow::Error>,
}

impl MultiError {
    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<anyhow::Error> {
        self.errors
    }
}

fn render(errors: &[anyhow::Error]) -> String {
    let messages: Vec<String> = errors.iter().map(|e| format!("{e:#}")).collect();
    format!("{} errors: {}", errors.len(), messages.join("; "))
}

fn flatten(joined: Result<anyhow::Result<()>, JoinError>) -> anyhow::Result<()> {
    joined.map_err(anyhow::Error::from).and_then(|result| result)
}

/// Drop errors whose message was already seen, then collapse the rest.
fn combine(errors: Vec<anyhow::Error>) -> anyhow::Result<()> {
    let mut seen = HashSet::new();
    let mut unique: Vec<anyhow::Error> = errors
        .into_iter()
        .filter(|e| seen.insert(format!("{e:#}")))
        .collect();
    match unique.len() {
        0 => Ok(()),
        1 => Err(unique.remove(0)),
        _ => Err(MultiError { errors: unique }.into()),
    }
}

/// Run every task concurrently and wait until all of them finish or `cancel` fires.
///
/// Returns `Ok` if nothing failed, the error itself if exactly one distinct
/// error occurred and a [`MultiError`] otherwise. If `cancel` fires first,
/// errors from tasks that already finished are kept and [`Error::Canceled`] is
/// added.
///
/// Tasks still running at cancellation are detached, not aborted: this call
/// returns promptly but those tasks keep going until they stop on their own.
pub async fn run_all<I, F>(tasks: I, cancel: &CancellationToken) -> anyhow::Result<()>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut running: FuturesUnordered<JoinHandle<anyhow::Result<()>>> =
        tasks.into_iter().map(tokio::spawn).collect();
    let mut errors = Vec::new();

    loop {
        tokio::select! {
            joined = running.next() => match joined {
                Some(joined) => {
                    if let Err(e) = flatten(joined) {
                        errors.push(e);
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Some(Some(joined)) = running.next().now_or_never() {
                    if let Err(e) = flatten(joined) {
                        errors.push(e);
                    }
                }
                errors.push(Error::Canceled.into());
                break;
            }
        }
    }

    combine(errors)
}

/// Run every task concurrently; the first to return decides the result.
///
/// Each task receives a token shared by the group. When one task returns,
/// successfully or not, the token is cancelled so the others can stop. If
/// `cancel` fires before any task returns the result is [`Error::Canceled`].
/// An empty task list returns `Ok` immediately.
pub async fn race<I, F, Fut>(tasks: I, cancel: &CancellationToken) -> anyhow::Result<()>
where
    I: IntoIterator<Item = F>,
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let group = cancel.child_token();
    let mut running: FuturesUnordered<JoinHandle<anyhow::Result<()>>> = tasks
        .into_iter()
        .map(|task| tokio::spawn(task(group.clone())))
        .collect();
    if running.is_empty() {
        return Ok(());
    }

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Canceled.into()),
        Some(joined) = running.next() => flatten(joined),
    };
    group.cancel();
    result
}
