use snafu::Snafu;

/// The `Result` type returned by the model crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The public error type of the model crate. The variants are public so that the API surface
/// can map them onto the ECS error taxonomy.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Invalid ARN '{}': {}", arn, reason))]
    InvalidArn { arn: String, reason: String },

    #[snafu(display("Invalid ARN '{}': unknown service '{}'", arn, service))]
    UnknownArnService { arn: String, service: String },

    #[snafu(display("Task status cannot move backwards from {} to {}", from, to))]
    BackwardsTaskStatus { from: String, to: String },
}
