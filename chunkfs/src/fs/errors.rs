use crate::pool::StoreError;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("invalid argument")]
    InvalidArgument,

    #[error("file too large for the pool")]
    FileTooBig,

    #[error("no such object")]
    NotFound,

    #[error("object already exists")]
    Exists,

    #[error("no such attribute")]
    NoData,

    #[error("resource busy")]
    Busy,

    #[error("operation canceled")]
    Canceled,

    #[error("not empty")]
    NotEmpty,

    #[error("link has been severed")]
    NoLink,

    #[error("I/O error")]
    IoError,
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn to_errno(self) -> i32 {
        match self {
            FsError::InvalidArgument => libc::EINVAL,
            FsError::FileTooBig => libc::EFBIG,
            FsError::NotFound => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::NoData => libc::ENODATA,
            FsError::Busy => libc::EBUSY,
            FsError::Canceled => libc::ECANCELED,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NoLink => libc::ENOLINK,
            FsError::IoError => libc::EIO,
        }
    }

    /// Negative errno form used in aggregate op return codes.
    pub fn to_retcode(self) -> i32 {
        -self.to_errno()
    }

    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EINVAL => FsError::InvalidArgument,
            libc::EFBIG => FsError::FileTooBig,
            libc::ENOENT => FsError::NotFound,
            libc::EEXIST => FsError::Exists,
            libc::ENODATA => FsError::NoData,
            libc::EBUSY => FsError::Busy,
            libc::ECANCELED => FsError::Canceled,
            libc::ENOTEMPTY => FsError::NotEmpty,
            libc::ENOLINK => FsError::NoLink,
            _ => FsError::IoError,
        }
    }

    /// Maps a negative aggregate return code back to an error; `code`
    /// must be negative.
    pub fn from_retcode(code: i32) -> Self {
        Self::from_errno(-code)
    }
}

impl From<StoreError> for FsError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => FsError::NotFound,
            StoreError::Exists => FsError::Exists,
            StoreError::Busy => FsError::Busy,
            StoreError::Canceled => FsError::Canceled,
            StoreError::NoData => FsError::NoData,
            StoreError::InvalidArgument => FsError::InvalidArgument,
            StoreError::Io => FsError::IoError,
        }
    }
}

/// Turns an aggregate return code into a `Result`.
pub fn check_retcode(code: i32) -> FsResult<()> {
    if code < 0 {
        Err(FsError::from_retcode(code))
    } else {
        Ok(())
    }
}
