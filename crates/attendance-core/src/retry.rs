use std::fmt::Display;

/// Run a blocking operation at most `attempts` times (at least once).
///
/// Each failure is logged with its attempt number. The last error is
/// returned when every attempt fails. Attempts run back to back.
pub fn with_attempts<T, E, F>(attempts: u32, label: &str, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                tracing::warn!(
                    op = label,
                    attempt,
                    attempts,
                    error = %err,
                    "attempt failed; retrying"
                );
                attempt += 1;
            }
            Err(err) => {
                tracing::warn!(op = label, attempt, attempts, error = %err, "giving up");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_first_success() {
        let mut calls = 0;
        let result: Result<u32, String> = with_attempts(3, "op", || {
            calls += 1;
            if calls < 2 {
                Err("boom".into())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(2));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_bounded_attempts() {
        let mut calls = 0;
        let result: Result<(), String> = with_attempts(3, "op", || {
            calls += 1;
            Err(format!("failure {calls}"))
        });
        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let mut calls = 0;
        let result: Result<(), String> = with_attempts(0, "op", || {
            calls += 1;
            Err("nope".into())
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
