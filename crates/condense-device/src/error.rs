use thiserror::Error;


pub type Result<T> = std::result::Result<T, Status>;


/// The status codes operations complete with.
///
/// `Queued` and `Retry` are advisory and never surface to a submitter;
/// everything else maps to an errno-style integer at the device boundary.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("logical block out of range")]
    OutOfRange,
    #[error("out of physical space")]
    NoSpace,
    #[error("device is in read-only mode")]
    ReadOnly,
    #[error("invalid compressed block fragment")]
    InvalidFragment,
    #[error("corrupt on-device state")]
    Corrupt,
    #[error("I/O error on the backing device")]
    Io,
    #[error("retry the request later")]
    Retry,
    #[error("request is queued inside a collaborator")]
    Queued,
    #[error("internal assertion failed")]
    AssertionFailed,
}

impl Status {
    /// The errno-style value reported to the block-device interface.
    /// Success is `0` and is not a `Status`.
    #[must_use]
    pub fn to_errno(self) -> i32 {
        match self {
            Self::InvalidArgument                     => 22, // EINVAL
            Self::OutOfRange                          => 6,  // ENXIO
            Self::NoSpace                             => 28, // ENOSPC
            Self::ReadOnly                            => 30, // EROFS
            Self::Retry | Self::Queued                => 11, // EAGAIN
            Self::InvalidFragment
            | Self::Corrupt
            | Self::Io
            | Self::AssertionFailed                   => 5,  // EIO
        }
    }
}


#[cfg(test)]
mod tests {
    use super::Status;

    #[test]
    fn errno_values() {
        assert_eq!(Status::NoSpace.to_errno(), 28);
        assert_eq!(Status::ReadOnly.to_errno(), 30);
        assert_eq!(Status::InvalidFragment.to_errno(), 5);
    }
}
