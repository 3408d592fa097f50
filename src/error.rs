// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
use std::fmt;

/// Errors surfaced by any public operation in this crate.
///
/// Nothing here is retried internally. Every variant is handed straight
/// back to the caller, who is in the best position to decide whether to
/// retry, `fail` a task, or `remove` it outright.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The store connection or command failed.
    #[error("transport error: {0}")]
    Transport(#[from] redis::RedisError),

    /// Could not obtain a pooled connection.
    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Marshalling or unmarshalling a task failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// An identifier was expected in a reference list but was not present.
    #[error("identifier not found in {list}: {id}")]
    MissingReference { list: &'static str, id: String },

    /// `get` was called for an identifier with no payload entry.
    #[error("no payload stored for identifier: {0}")]
    MissingPayload(String),

    /// A programmer error: missing required configuration, or a call that
    /// is disabled by configuration (e.g. `defer()` without `allow_defer`).
    #[error("misconfiguration: {0}")]
    Misconfiguration(&'static str),

    /// One or both legs of a two-leg commit failed. Carries every leg's
    /// error, not just the first one encountered.
    #[error("composite error: {0}")]
    Composite(Composite),
}

/// A list of errors from the legs of a two-leg commit that failed.
#[derive(Debug, Default)]
pub struct Composite(pub Vec<Error>);

impl fmt::Display for Composite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "[{}]", parts.join("; "))
    }
}

impl Error {
    /// Join the results of a two-leg operation into a single `Result`,
    /// collecting both errors into `Error::Composite` if both legs failed.
    pub(crate) fn join(a: Result<(), Error>, b: Result<(), Error>) -> Result<(), Error> {
        match (a, b) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(e1), Err(e2)) => Err(Error::Composite(Composite(vec![e1, e2]))),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
