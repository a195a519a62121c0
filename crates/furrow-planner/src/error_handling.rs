//! Classification of model backend errors as recoverable or not

/// Classification of error types
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorType {
    /// Recoverable errors that should be retried
    Recoverable(RecoverableError),
    /// Non-recoverable errors that end the query
    NonRecoverable,
}

/// Types of recoverable errors
#[derive(Debug, Clone, PartialEq)]
pub enum RecoverableError {
    /// Rate limit exceeded
    RateLimit,
    /// Temporary network error
    NetworkError,
    /// Server error (5xx)
    ServerError,
    /// Model is busy/overloaded
    ModelBusy,
    /// Timeout
    Timeout,
}

/// Classify an error as recoverable or non-recoverable
pub fn classify_error(error: &anyhow::Error) -> ErrorType {
    let error_str = format!("{:#}", error).to_lowercase();

    if error_str.contains("rate limit")
        || error_str.contains("rate_limit")
        || error_str.contains("429")
    {
        return ErrorType::Recoverable(RecoverableError::RateLimit);
    }

    if error_str.contains("network")
        || error_str.contains("connection")
        || error_str.contains("dns")
        || error_str.contains("refused")
    {
        return ErrorType::Recoverable(RecoverableError::NetworkError);
    }

    if error_str.contains("500")
        || error_str.contains("502")
        || error_str.contains("503")
        || error_str.contains("504")
        || error_str.contains("server error")
        || error_str.contains("internal error")
    {
        return ErrorType::Recoverable(RecoverableError::ServerError);
    }

    if error_str.contains("busy")
        || error_str.contains("overloaded")
        || error_str.contains("capacity")
        || error_str.contains("unavailable")
    {
        return ErrorType::Recoverable(RecoverableError::ModelBusy);
    }

    if error_str.contains("timeout")
        || error_str.contains("timed out")
        || error_str.contains("request or response body error")
    {
        return ErrorType::Recoverable(RecoverableError::Timeout);
    }

    // Default to non-recoverable for unknown errors
    ErrorType::NonRecoverable
}

/// Helper function to truncate strings for logging
pub fn truncate_for_logging(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }

    let mut truncate_at = max_len;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }

    format!(
        "{}... (truncated, {} total bytes)",
        &s[..truncate_at],
        s.len()
    )
}
