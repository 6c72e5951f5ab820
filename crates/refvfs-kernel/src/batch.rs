//! Many keys at once, with per-key failure isolation.

use futures::future::join_all;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use strum::{Display, EnumString};

use crate::error::{RefError, RefResult};

/// What a batch does with keys that fail.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// The first failure (in input order) fails the call.
    #[default]
    Raise,
    /// Failed keys map to their error.
    Return,
    /// Failed keys are left out.
    Omit,
}

/// Per-key outcome, in input order.
pub type BatchResult = IndexMap<String, RefResult<Vec<u8>>>;

/// Run `resolve` for every key concurrently and join them all.
///
/// Completion order is whatever the backends make it; the returned
/// vector follows `keys`.
pub async fn fan_out<F, Fut>(keys: &[String], resolve: F) -> Vec<(String, RefResult<Vec<u8>>)>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = RefResult<Vec<u8>>>,
{
    let futures = keys.iter().map(|key| {
        let fut = resolve(key.clone());
        async move { (key.clone(), fut.await) }
    });
    join_all(futures).await
}

/// Apply `policy` to raw per-key outcomes.
pub fn apply_policy(
    outcomes: Vec<(String, RefResult<Vec<u8>>)>,
    policy: OnError,
) -> RefResult<BatchResult> {
    let total = outcomes.len();
    let mut out = BatchResult::with_capacity(total);
    let mut failed = 0usize;
    for (key, outcome) in outcomes {
        match (outcome, policy) {
            (Ok(bytes), _) => {
                out.insert(key, Ok(bytes));
            }
            (Err(e), OnError::Raise) => {
                tracing::debug!(key, error = %e, "batch aborted");
                return Err(e);
            }
            (Err(e), OnError::Return) => {
                failed += 1;
                out.insert(key, Err(e));
            }
            (Err(_), OnError::Omit) => failed += 1,
        }
    }
    if failed > 0 {
        tracing::debug!(total, failed, %policy, "batch finished with failures");
    }
    Ok(out)
}

/// Unwrap a batch that is known to hold only successes.
pub fn into_bytes(result: BatchResult) -> RefResult<IndexMap<String, Vec<u8>>> {
    result
        .into_iter()
        .map(|(k, v)| v.map(|bytes| (k, bytes)))
        .collect::<Result<_, RefError>>()
}
