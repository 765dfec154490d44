#![deny(missing_docs)]

//! Error handling for the streamer crates.
//!
//! Request-level failures inside the streaming stack are never errors: they are statuses
//! attached to requests. [`StreamerError`] covers everything else, such as invalid
//! configuration, misuse of the request arena, I/O failures surfaced through the public
//! API, and a streamer that has shut down.

mod ext;

use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::{fmt, io};

pub use ext::*;

/// A string that can be used as an error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrString(Cow<'static, str>);

impl<T> From<T> for ErrString
where
    T: Into<Cow<'static, str>>,
{
    fn from(msg: T) -> Self {
        Self(msg.into())
    }
}

impl AsRef<str> for ErrString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for ErrString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ErrString {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The top-level error type for the streamer crates.
#[derive(thiserror::Error)]
#[non_exhaustive]
pub enum StreamerError {
    /// An argument passed to an API was invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(ErrString),
    /// A stack entry or the streamer was configured with inconsistent options.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(ErrString),
    /// An operation was attempted on a request or component in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(ErrString),
    /// A request completed with a non-successful status.
    #[error("request failed: {0}")]
    RequestFailed(ErrString),
    /// The streamer has shut down and can no longer service requests.
    #[error("streamer shut down: {0}")]
    Shutdown(ErrString),
    /// A wrapper for IO errors.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A wrapper for JSON (de)serialization errors.
    #[cfg(feature = "serde")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// An error with an additional message describing where it happened.
    #[error("{0}: {1}")]
    Context(ErrString, Box<StreamerError>),
}

impl StreamerError {
    /// Wrap this error with an additional message.
    pub fn with_context<T: Into<ErrString>>(self, msg: T) -> Self {
        StreamerError::Context(msg.into(), Box::new(self))
    }

    /// Returns the innermost error, skipping over any context wrappers.
    pub fn root_cause(&self) -> &StreamerError {
        match self {
            StreamerError::Context(_, inner) => inner.root_cause(),
            other => other,
        }
    }
}

impl Debug for StreamerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// A type alias for results that return a [`StreamerError`] as their error type.
pub type StreamerResult<T> = Result<T, StreamerError>;

/// Construct a [`StreamerError`].
///
/// The variant defaults to [`StreamerError::InvalidArgument`] and can be selected by
/// prefixing the message with the variant name, e.g.
/// `streamer_err!(InvalidConfiguration: "bad alignment {}", 3)`.
#[macro_export]
macro_rules! streamer_err {
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::StreamerError::$variant(::std::format!($fmt $(, $arg)*).into())
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::streamer_err!(InvalidArgument: $fmt $(, $arg)*)
    };
}

/// Return early with a [`StreamerError`], built with the same syntax as [`streamer_err`].
#[macro_export]
macro_rules! streamer_bail {
    ($($tt:tt)+) => {
        return Err($crate::streamer_err!($($tt)+).into())
    };
}

/// Panic with a [`StreamerError`], either given directly or built like [`streamer_err`].
#[macro_export]
macro_rules! streamer_panic {
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::streamer_panic!($crate::streamer_err!($variant: $fmt $(, $arg)*))
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::streamer_panic!($crate::streamer_err!($fmt $(, $arg)*))
    };
    ($err:expr) => {{
        let err: $crate::StreamerError = $err;
        #[allow(clippy::panic)]
        ::std::panic!("{}", err);
    }};
}

/// A trait for expect-ing a value or panicking with a [`StreamerError`].
///
/// Used for invariants that the streaming stack upholds internally, where a failure is a
/// programming error rather than a runtime condition.
pub trait StreamerExpect {
    /// The type of the value being expected.
    type Output;

    /// Returns the value, or panics with the given message attached.
    fn streamer_expect(self, msg: &str) -> Self::Output;
}

impl<T, E> StreamerExpect for Result<T, E>
where
    E: Into<StreamerError>,
{
    type Output = T;

    #[inline(always)]
    fn streamer_expect(self, msg: &str) -> Self::Output {
        self.map_err(|err| err.into())
            .unwrap_or_else(|e| streamer_panic!(e.with_context(msg.to_string())))
    }
}

impl<T> StreamerExpect for Option<T> {
    type Output = T;

    #[inline(always)]
    fn streamer_expect(self, msg: &str) -> Self::Output {
        self.unwrap_or_else(|| streamer_panic!(InvalidState: "{}", msg))
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use crate::{StreamerError, StreamerExpect, StreamerResult};

    fn fails_with_config_error(alignment: usize) -> StreamerResult<()> {
        if !alignment.is_power_of_two() {
            streamer_bail!(InvalidConfiguration: "alignment {} is not a power of two", alignment);
        }
        Ok(())
    }

    #[test]
    fn bail_selects_variant() {
        let err = fails_with_config_error(3).unwrap_err();
        assert!(matches!(err, StreamerError::InvalidConfiguration(_)));
        assert_eq!(
            err.to_string(),
            "invalid configuration: alignment 3 is not a power of two"
        );
        assert!(fails_with_config_error(4).is_ok());
    }

    #[test]
    fn default_variant_is_invalid_argument() {
        let size = 12;
        let err = streamer_err!("size {size} is too large");
        assert!(matches!(err, StreamerError::InvalidArgument(_)));
        assert_eq!(err.to_string(), "invalid argument: size 12 is too large");
    }

    #[test]
    fn context_wraps_and_unwraps() {
        let err = StreamerError::from(io::Error::new(io::ErrorKind::NotFound, "missing"))
            .with_context("opening archive");
        assert_eq!(err.to_string(), "opening archive: missing");
        assert!(matches!(err.root_cause(), StreamerError::Io(_)));
    }

    #[test]
    #[should_panic(expected = "request arena exhausted")]
    fn expect_panics_with_message() {
        let value: Option<u32> = None;
        value.streamer_expect("request arena exhausted");
    }
}
