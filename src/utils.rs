use std::time::{Duration, Instant};

/// Error type for polling operations
#[derive(Debug)]
pub enum PollError<E> {
    /// Operation timed out
    Timeout,
    /// Error occurred in the condition/operation function
    ConditionError(E),
}

impl<E> std::fmt::Display for PollError<E>
where
    E: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Timeout => write!(f, "Operation timed out"),
            PollError::ConditionError(e) => write!(f, "Condition error: {}", e),
        }
    }
}

impl<E> std::error::Error for PollError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Timeout => None,
            PollError::ConditionError(e) => Some(e),
        }
    }
}

/// Poll a condition with timeout
///
/// Repeatedly calls `condition` until it returns `Ok(true)` or timeout is reached.
/// The timeout is checked once per iteration, before the condition runs, so the
/// call returns within `timeout + poll_interval` plus one condition call.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use waveplate_sweep::utils::poll_until;
///
/// let mut position = 0.0_f64;
/// poll_until(
///     || {
///         position += 0.25;
///         Ok::<bool, &str>((position - 1.0).abs() < 1e-9)
///     },
///     Duration::from_secs(1),
///     Duration::from_millis(1),
/// )
/// .unwrap();
/// ```
pub fn poll_until<F, E>(
    mut condition: F,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Result<bool, E>,
{
    let outcome = poll_with_timeout(
        || condition().map(|reached| reached.then_some(())),
        timeout,
        poll_interval,
    )?;
    outcome.ok_or(PollError::Timeout)
}

/// Poll with timeout for operations that may return a result
///
/// Repeatedly calls `operation` until it returns `Ok(Some(T))` or timeout is reached.
///
/// # Returns
/// * `Ok(Some(T))` when operation returns `Ok(Some(T))`
/// * `Ok(None)` when timeout is reached
/// * `Err(PollError::ConditionError(e))` when operation returns an error
pub fn poll_with_timeout<F, T, E>(
    mut operation: F,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Option<T>, PollError<E>>
where
    F: FnMut() -> Result<Option<T>, E>,
{
    let started = Instant::now();

    while started.elapsed() < timeout {
        if let Some(value) = operation().map_err(PollError::ConditionError)? {
            return Ok(Some(value));
        }
        std::thread::sleep(poll_interval);
    }

    Ok(None)
}
