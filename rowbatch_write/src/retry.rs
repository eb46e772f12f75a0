//! Classification of row failures into retryable and permanent ones.

use hashbrown::HashSet;

use crate::row::ErrorCode;

/// What to do with a row that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Send the row again after backing off.
    Retry,
    /// Report the failure to the row's group.
    FailPermanently,
}

/// Decides which [`ErrorCode`]s are transient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Only the listed codes are retried.
    AllowList(HashSet<ErrorCode>),
    /// Every code except the listed ones is retried.
    DenyList(HashSet<ErrorCode>),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::allow_list()
    }
}

impl RetryPolicy {
    /// Transient server-side conditions retried by [`RetryPolicy::allow_list`].
    pub const TRANSIENT_CODES: [ErrorCode; 8] = [
        ErrorCode::InternalServerError,
        ErrorCode::Timeout,
        ErrorCode::PartitionUnavailable,
        ErrorCode::TableNotReady,
        ErrorCode::RowOperationConflict,
        ErrorCode::ServerBusy,
        ErrorCode::ServerUnavailable,
        ErrorCode::Network,
    ];

    /// Client-caused conditions never retried by [`RetryPolicy::deny_list`].
    pub const CLIENT_CODES: [ErrorCode; 6] = [
        ErrorCode::ParameterInvalid,
        ErrorCode::ConditionCheckFailed,
        ErrorCode::RequestTooLarge,
        ErrorCode::InvalidPrimaryKey,
        ErrorCode::ColumnCountLimitExceeded,
        ErrorCode::RowSizeLimitExceeded,
    ];

    /// An allow-list retrying only [`Self::TRANSIENT_CODES`].
    pub fn allow_list() -> Self {
        Self::allow_list_with(Self::TRANSIENT_CODES)
    }

    /// A deny-list retrying everything but [`Self::CLIENT_CODES`].
    pub fn deny_list() -> Self {
        Self::deny_list_with(Self::CLIENT_CODES)
    }

    pub fn allow_list_with(codes: impl IntoIterator<Item = ErrorCode>) -> Self {
        Self::AllowList(codes.into_iter().collect())
    }

    pub fn deny_list_with(codes: impl IntoIterator<Item = ErrorCode>) -> Self {
        Self::DenyList(codes.into_iter().collect())
    }

    pub fn is_retryable(&self, code: &ErrorCode) -> bool {
        match self {
            Self::AllowList(codes) => codes.contains(code),
            Self::DenyList(codes) => !codes.contains(code),
        }
    }
}

/// Resolves a row-level failure to a [`Disposition`], bounding the number of retries.
#[derive(Debug, Clone)]
pub struct RetryClassifier {
    policy: RetryPolicy,
    max_retries: u32,
}

impl RetryClassifier {
    pub fn new(policy: RetryPolicy, max_retries: u32) -> Self {
        Self {
            policy,
            max_retries,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Classify a failure with `code` for a row that has already been retried `retries` times.
    ///
    /// A retryable code is only retried while `retries < max_retries`.
    pub fn classify(&self, code: &ErrorCode, retries: u32) -> Disposition {
        if self.policy.is_retryable(code) && retries < self.max_retries {
            Disposition::Retry
        } else {
            Disposition::FailPermanently
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_list() {
        let classifier = RetryClassifier::new(RetryPolicy::allow_list(), 3);

        for code in RetryPolicy::TRANSIENT_CODES {
            assert_eq!(classifier.classify(&code, 0), Disposition::Retry, "{code}");
        }
        for code in RetryPolicy::CLIENT_CODES {
            assert_eq!(
                classifier.classify(&code, 0),
                Disposition::FailPermanently,
                "{code}"
            );
        }

        // Anything not listed fails, including codes the write path has never seen.
        assert_eq!(
            classifier.classify(&ErrorCode::QuotaExhausted, 0),
            Disposition::FailPermanently
        );
        assert_eq!(
            classifier.classify(&ErrorCode::Other("Bananas".to_owned()), 0),
            Disposition::FailPermanently
        );
    }

    #[test]
    fn test_deny_list() {
        let classifier = RetryClassifier::new(RetryPolicy::deny_list(), 3);

        for code in RetryPolicy::CLIENT_CODES {
            assert_eq!(
                classifier.classify(&code, 0),
                Disposition::FailPermanently,
                "{code}"
            );
        }
        for code in RetryPolicy::TRANSIENT_CODES {
            assert_eq!(classifier.classify(&code, 0), Disposition::Retry, "{code}");
        }

        assert_eq!(
            classifier.classify(&ErrorCode::QuotaExhausted, 0),
            Disposition::Retry
        );
        assert_eq!(
            classifier.classify(&ErrorCode::Other("Bananas".to_owned()), 0),
            Disposition::Retry
        );
    }

    #[test]
    fn test_retries_are_bounded() {
        let classifier = RetryClassifier::new(RetryPolicy::allow_list(), 2);
        let code = ErrorCode::ServerBusy;

        assert_eq!(classifier.classify(&code, 0), Disposition::Retry);
        assert_eq!(classifier.classify(&code, 1), Disposition::Retry);
        assert_eq!(classifier.classify(&code, 2), Disposition::FailPermanently);
        assert_eq!(classifier.classify(&code, 3), Disposition::FailPermanently);
    }

    #[test]
    fn test_zero_retries_never_retries() {
        let classifier = RetryClassifier::new(RetryPolicy::deny_list(), 0);
        assert_eq!(
            classifier.classify(&ErrorCode::Timeout, 0),
            Disposition::FailPermanently
        );
    }

    #[test]
    fn test_custom_code_sets() {
        let policy = RetryPolicy::allow_list_with([ErrorCode::Other("Throttled".to_owned())]);
        assert!(policy.is_retryable(&"Throttled".parse().unwrap()));
        assert!(!policy.is_retryable(&ErrorCode::Timeout));

        let policy = RetryPolicy::deny_list_with([ErrorCode::Timeout]);
        assert!(!policy.is_retryable(&ErrorCode::Timeout));
        assert!(policy.is_retryable(&ErrorCode::ParameterInvalid));
    }
}
