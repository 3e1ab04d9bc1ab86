#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the error queue address must not be empty")]
    EmptyErrorQueue,

    #[error("delayed retries require a non-zero time increase when max_retries is {max_retries}")]
    ZeroTimeIncrease { max_retries: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;
