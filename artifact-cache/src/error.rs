/// Generic error type for [`CacheManager`](crate::CacheManager) backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A `Result` typedef to use with the [`BoxError`] type
pub type Result<T> = std::result::Result<T, BoxError>;

/// The only error that escapes [`LoadJob::submit`](crate::LoadJob::submit).
///
/// Everything that goes wrong inside a running job is absorbed into the
/// [`LoadResult`](crate::LoadResult) fanned out to listeners.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The [`ArtifactSource`](crate::ArtifactSource) could not derive a
    /// remote URL for this job.
    #[error("no remote url can be derived for this job")]
    MissingUrl,
}
