use thiserror::Error;
use yrt_dwarf::DwarfError;
use yrt_unwind as uw;

/// Contract breaches between generated code, the unwinder and this runtime.
/// None of them is recoverable: the C entry points turn every one into a
/// call to [`crate::panic::terminate`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EhError {
    #[error("catch error: landed with exception {landed:#x}, innermost in flight is {innermost:#x}")]
    CatchMismatch { landed: usize, innermost: usize },
    #[error("catch error: no exception in flight on this thread")]
    NothingInFlight,
    #[error("out of memory allocating an exception header")]
    OutOfMemory,
    #[error("unwind error: handler frame has no landing pad")]
    MissingLandingPad,
    #[error("no exception stack registered for the owning thread")]
    UnknownThread,
    #[error("reading encoded: {0}")]
    Encoding(#[from] DwarfError),
    #[error("unwind error: unwinder returned {0:?}")]
    UnexpectedUnwindResult(uw::_Unwind_Reason_Code),
}

pub type Result<T> = std::result::Result<T, EhError>;
