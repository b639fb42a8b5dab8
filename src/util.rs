//! Small utilities shared across the crate.


use std::io;

use crate::error::{DecodeError, Report, Result};
use crate::report_attach;

pub(crate) trait IoResultExt<T>: Sized {
    /// Map an end-of-input IO error to [`DecodeError::Truncated`].
    ///
    /// The bit reader operates over a complete in-memory buffer, so end-of-input is the only IO
    /// failure it can actually produce.
    fn map_eof(self) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    #[track_caller]
    fn map_eof(self) -> Result<T> {
        self.map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => Report::from(DecodeError::Truncated),
            _ => report_attach!(DecodeError::InvalidBitstream, err),
        })
    }
}
