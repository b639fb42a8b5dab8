//! Error types returned by the public API.

use std::any::type_name;
use std::fmt;
use std::fmt::{Debug, Display};
#[cfg(feature = "error-detail")]
use std::panic::Location;

use derive_more::Display;

//
// public types
//

/// Error type returned by the decoder.
///
/// While the exact set of variants is considered unstable, the mapping to [`Status`] via
/// [`Report::status`] is stable.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DecodeError {
    /// A caller-supplied parameter was rejected (bad crop rectangle, unsupported output colour
    /// space, entry point called in the wrong state).
    #[error("Invalid parameter")]
    InvalidParam,

    /// A buffer could not be sized for the requested image.
    #[error("Out of memory")]
    OutOfMemory,

    /// The bitstream is structurally invalid.
    #[error("Invalid bitstream")]
    InvalidBitstream,

    /// The bitstream contained an invalid prefix code.
    #[error("Invalid prefix code")]
    InvalidPrefixCode,

    /// The input ended before the bitstream was complete.
    ///
    /// This maps to [`Status::Suspended`]: decoding may be retried with a longer input buffer.
    #[error("Truncated bitstream")]
    Truncated,
}

/// Coarse decoder status, latched on the [`Decoder`](crate::Decoder) after every entry point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Status {
    /// No error has occurred.
    #[default]
    Ok,
    /// A buffer could not be sized for the requested image.
    OutOfMemory,
    /// A caller-supplied parameter was rejected.
    InvalidParam,
    /// The bitstream is structurally invalid.
    BitstreamError,
    /// The input ended at an otherwise well-formed boundary; the caller may feed more bytes and
    /// retry after [`clear`](crate::Decoder::clear)ing the decoder.
    Suspended,
}

/// A report with additional debugging info for a [`DecodeError`].
///
/// A `Report` identifies exactly where the error occurred in the decoder. The [`Debug`]
/// implementation prints a human-readable parser stack trace. The underlying [`DecodeError`] can
/// be retrieved for matching with [`get_ref`](Self::get_ref) or [`into_inner`](Self::into_inner).
#[derive(thiserror::Error)]
#[error("{error}")]
pub struct Report {
    #[source]
    error: DecodeError,
    stack: ReportStack,
}

/// A convenience type alias for a [`Result`](std::result::Result) whose error is a [`Report`].
pub type Result<T> = std::result::Result<T, Report>;

/// A trait providing [`Report`]-related extensions for [`Result`](std::result::Result).
pub trait ResultExt: Sized {
    /// Attach a [`Display`]-able type to the error [`Report`]'s stack trace.
    #[track_caller]
    fn attach_printable<P: Display + Send + Sync + 'static>(self, printable: P) -> Self;

    /// Attach the message "while parsing type T" to the error [`Report`]'s stack trace.
    #[track_caller]
    fn while_parsing_type(self) -> Self;
}

/// The stack of messages recording where a [`Report`] was created and what context was attached
/// while it propagated.
///
/// Without the default `error-detail` feature, the stack is a zero-sized no-op.
pub struct ReportStack {
    #[cfg(feature = "error-detail")]
    location: &'static Location<'static>,
    #[cfg(feature = "error-detail")]
    entries: Vec<ReportEntry>,
}

/// A [`Display`]-able indicating an error occurred while parsing a certain type.
#[derive(Clone, Copy, Debug, Display)]
#[display(fmt = "while parsing value of type `{}`", _0)]
pub struct WhileParsingType(&'static str);

//
// private types
//

#[cfg(feature = "error-detail")]
#[derive(derive_more::Display)]
#[display(fmt = "{message} at {location}")]
struct ReportEntry {
    message: Box<dyn Display + Send + Sync + 'static>,
    location: &'static Location<'static>,
}

//
// Report impls
//

impl Report {
    /// Get a reference to the underlying error.
    pub fn get_ref(&self) -> &DecodeError {
        &self.error
    }

    /// Unwrap this report, returning the underlying error.
    pub fn into_inner(self) -> DecodeError {
        self.error
    }

    /// The coarse [`Status`] this error latches on the decoder.
    pub fn status(&self) -> Status {
        match self.error {
            DecodeError::InvalidParam => Status::InvalidParam,
            DecodeError::OutOfMemory => Status::OutOfMemory,
            DecodeError::InvalidBitstream | DecodeError::InvalidPrefixCode => Status::BitstreamError,
            DecodeError::Truncated => Status::Suspended,
        }
    }

    /// Attach a [`Display`]-able type to the stack trace.
    #[track_caller]
    pub fn attach_printable<P: Display + Send + Sync + 'static>(mut self, message: P) -> Self {
        self.stack.push(message);
        self
    }
}

impl From<DecodeError> for Report {
    #[track_caller]
    fn from(error: DecodeError) -> Self {
        Self { error, stack: ReportStack::new() }
    }
}

impl Debug for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { error, stack } = self;
        write!(f, "{error}{stack}")
    }
}

//
// ReportStack impls
//

impl ReportStack {
    #[track_caller]
    fn new() -> Self {
        Self {
            #[cfg(feature = "error-detail")]
            location: Location::caller(),
            #[cfg(feature = "error-detail")]
            entries: Vec::new(),
        }
    }

    #[track_caller]
    fn push<P: Display + Send + Sync + 'static>(&mut self, printable: P) {
        #[cfg(feature = "error-detail")]
        self.entries.push(ReportEntry { message: Box::new(printable), location: Location::caller() });
        #[cfg(not(feature = "error-detail"))]
        let _ = printable;
    }
}

impl Display for ReportStack {
    #[cfg(feature = "error-detail")]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { location, entries } = self;
        writeln!(f, " at {location}")?;
        for entry in &entries[..entries.len().saturating_sub(1)] {
            writeln!(f, " - {entry}")?;
        }
        if let Some(entry) = entries.last() {
            write!(f, " - {entry}")?;
        }
        Ok(())
    }

    #[cfg(not(feature = "error-detail"))]
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ok(())
    }
}

//
// WhileParsingType impls
//

impl WhileParsingType {
    /// Construct a new [`WhileParsingType`] where the type described is `T`.
    pub fn new<T: ?Sized>() -> Self {
        Self(type_name::<T>())
    }
}

//
// ResultExt impls
//

impl<T> ResultExt for Result<T> {
    #[track_caller]
    fn attach_printable<P: Display + Send + Sync + 'static>(self, printable: P) -> Self {
        match self {
            Ok(value) => Ok(value),
            Err(err) => Err(err.attach_printable(printable)),
        }
    }

    #[track_caller]
    fn while_parsing_type(self) -> Self {
        self.attach_printable(WhileParsingType::new::<T>())
    }
}

//
// macros
//

/// Create a [`Report`] containing `$err` with optional `$attachment`s.
#[macro_export]
macro_rules! report_attach {
    ($err:expr $(, $($attachment:expr),+)? $(,)?) => {
        $crate::error::Report::from($err)
            $($(.attach_printable($attachment))+)?
    };
}

/// Return an [`Err`] containing `$err` as a [`Report`] with optional `$attachment`s.
#[macro_export]
macro_rules! bail_attach {
    ($err:expr $(, $($attachment:expr),+)? $(,)?) => {
        return Err($crate::report_attach!($err $(, $($attachment),+)?))
    };
}

/// Ensure `$cond` is `true`, or return an [`Err`] containing `$err` as a [`Report`] with optional
/// `$attachment`s.
#[macro_export]
macro_rules! ensure_attach {
    ($cond:expr, $err:expr $(, $($attachment:expr),+)? $(,)?) => {{
        let cond: bool = $cond;
        if !cond {
            $crate::bail_attach!($err, concat!("condition failed: ", stringify!($cond)) $(, $($attachment),+)?);
        }
    }};
}

/// Ensure `$expr` matches `$pat`, or return an [`Err`] containing `$err` as a [`Report`] with
/// optional `$attachment`s.
#[macro_export]
macro_rules! ensure_matches_attach {
    ($expr:expr, $pat:pat, $err:expr $(, $($attachment:expr),+)? $(,)?) => {
        let $pat = $expr else {
            $crate::bail_attach!($err, concat!("condition failed: let ", stringify!($pat), " = ", stringify!($expr))
                                 $(, $($attachment),+)?);
        };
    };
}
