//! Poll a resource at a fixed interval until it reaches a terminal state.

use std::future::Future;
use std::time::Duration;

use crate::models::check::Check;
use crate::models::job::JobProgress;

/// Default delay between job status polls.
pub const JOB_POLL_INTERVAL: Duration = Duration::from_millis(1500);

pub trait Terminal {
    fn is_terminal(&self) -> bool;
}

impl Terminal for JobProgress {
    fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl Terminal for Check {
    fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Call `fetch` until it returns a terminal value, sleeping `interval`
/// between attempts. `Ok(None)` from `fetch` means the resource does not
/// exist and ends polling with [`PollError::NotFound`].
pub async fn poll_until_terminal<T, E, F, Fut>(
    interval: Duration,
    max_attempts: Option<u32>,
    mut fetch: F,
) -> Result<T, PollError<E>>
where
    T: Terminal,
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match fetch().await.map_err(PollError::Source)? {
            None => return Err(PollError::NotFound),
            Some(value) if value.is_terminal() => return Ok(value),
            Some(_) => {}
        }
        if max_attempts.is_some_and(|max| attempt >= max) {
            return Err(PollError::TimedOut(attempt));
        }
        tokio::time::sleep(interval).await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError<E: std::error::Error + 'static> {
    #[error("Resource not found")]
    NotFound,

    #[error("Gave up after {0} attempts")]
    TimedOut(u32),

    #[error(transparent)]
    Source(E),
}
