#![forbid(unsafe_code)]

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure a monitor run can surface to its caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid monitor configuration: {0}")]
    InvalidConfig(#[from] crate::config::ConfigValidationError),
    #[error("configuration error: {0}")]
    Settings(#[from] config::ConfigError),
    #[error("site registry error: {0}")]
    SiteRegistry(#[from] crate::config::sites::SiteRegistryError),
    #[error("broker error: {0}")]
    Broker(#[from] crate::transport::rabbitmq::BrokerError),
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("producer error: {0}")]
    Producer(#[from] crate::producer::ProducerError),
    #[error("invalid duration: {0}")]
    Duration(#[from] humantime::DurationError),
    #[error("invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Message(String),
    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn new<E>(error: E) -> Self
    where
        Error: From<E>,
    {
        error.into()
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    pub fn with_context(context: impl Into<String>, source: Error) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Walks through `Context` wrappers to the underlying error.
    pub fn root(&self) -> &Error {
        let mut current = self;
        while let Error::Context { source, .. } = current {
            current = source;
        }
        current
    }
}

/// Attaches a human-readable step description to a failing result.
pub trait Context<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<C: Into<String>>(self, describe: impl FnOnce() -> C) -> Result<T>;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    Error: From<E>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|err| Error::with_context(context, Error::from(err)))
    }

    fn with_context<C: Into<String>>(self, describe: impl FnOnce() -> C) -> Result<T> {
        self.map_err(|err| Error::with_context(describe(), Error::from(err)))
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Self::Message(message)
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Self::Message(message.to_owned())
    }
}

/// Builds an [`Error`] from a format string or from any convertible error.
#[macro_export]
macro_rules! err {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::error::Error::msg(format!($fmt $(, $arg)*))
    };
    ($err:expr) => {
        $crate::error::Error::new($err)
    };
}

/// Returns early with [`err!`].
#[macro_export]
macro_rules! bail_err {
    ($($arg:tt)*) => {
        return Err($crate::err!($($arg)*))
    };
}
