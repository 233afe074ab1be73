use snafu::Snafu;

/// The `Result` type returned by storage implementations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors a storage implementation may return. The variants are the contract: the API surface
/// maps `NotFound` onto the resource-specific ECS exceptions, `AlreadyExists` onto
/// `ResourceInUse`, and retries once on `VersionConflict` before surfacing it.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{} '{}' not found", kind, name))]
    NotFound { kind: &'static str, name: String },

    #[snafu(display("{} '{}' already exists", kind, name))]
    AlreadyExists { kind: &'static str, name: String },

    #[snafu(display(
        "Version conflict writing {} '{}': expected version {}",
        kind,
        name,
        expected
    ))]
    VersionConflict {
        kind: &'static str,
        name: String,
        expected: u64,
    },

    #[snafu(display("Invalid pagination token '{}'", token))]
    BadPageToken { token: String },

    #[snafu(display("Storage backend error: {}", message))]
    Backend { message: String },
}

impl Error {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Error::VersionConflict { .. })
    }
}
