//! Result of an operation that prefers a fallback value over failing.

use crate::error::ExperimentError;

/// Distinguishes a genuine result from a substituted default.
///
/// `Degraded` still carries a usable value; the reason is kept for
/// diagnostics instead of being raised to the caller.
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    Degraded { value: T, reason: ExperimentError },
    Fatal(ExperimentError),
}

impl<T> Outcome<T> {
    pub fn degraded(value: T, reason: ExperimentError) -> Self {
        Outcome::Degraded { value, reason }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Degraded { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Success(v) | Outcome::Degraded { value: v, .. } => Some(v),
            Outcome::Fatal(_) => None,
        }
    }

    /// The error retained from the last failure, if any.
    pub fn last_error(&self) -> Option<&ExperimentError> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Degraded { reason, .. } => Some(reason),
            Outcome::Fatal(e) => Some(e),
        }
    }

    /// Converts into a plain result; degraded values count as success.
    pub fn into_result(self) -> Result<T, ExperimentError> {
        match self {
            Outcome::Success(v) | Outcome::Degraded { value: v, .. } => Ok(v),
            Outcome::Fatal(e) => Err(e),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success(v) => Outcome::Success(f(v)),
            Outcome::Degraded { value, reason } => Outcome::Degraded {
                value: f(value),
                reason,
            },
            Outcome::Fatal(e) => Outcome::Fatal(e),
        }
    }
}

impl<T> From<Result<T, ExperimentError>> for Outcome<T> {
    fn from(result: Result<T, ExperimentError>) -> Self {
        match result {
            Ok(v) => Outcome::Success(v),
            Err(e) => Outcome::Fatal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_keeps_value_and_reason() {
        let outcome = Outcome::degraded(3, ExperimentError::NotConnected("metrics"));
        assert!(outcome.is_degraded());
        assert_eq!(outcome.value(), Some(&3));
        assert!(outcome.last_error().is_some());
        assert_eq!(outcome.map(|v| v * 2).into_result().unwrap(), 6);
    }

    #[test]
    fn test_fatal_has_no_value() {
        let outcome: Outcome<u8> = Err(ExperimentError::Rejected).into();
        assert!(outcome.value().is_none());
        assert_eq!(outcome.last_error().unwrap().to_string(), "request rejected");
    }
}
