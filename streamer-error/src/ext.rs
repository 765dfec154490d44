use crate::StreamerResult;

/// Extension trait for [`StreamerResult`].
pub trait ResultExt<T>: private::Sealed {
    /// Flatten a nested [`StreamerResult`], e.g. the outcome of a request received through a
    /// channel that may itself have been closed.
    fn unnest(self) -> StreamerResult<T>;
}

mod private {
    use crate::StreamerResult;

    pub trait Sealed {}

    impl<T> Sealed for StreamerResult<StreamerResult<T>> {}
}

impl<T> ResultExt<T> for StreamerResult<StreamerResult<T>> {
    fn unnest(self) -> StreamerResult<T> {
        match self {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) | Err(e) => Err(e),
        }
    }
}
