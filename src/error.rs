use bson::document::ValueAccessError;
use bson::Document;
use mongodb::error::{Error as MongoError, ErrorKind};
use std::fmt;
use std::result::Result as StdResult;
use thiserror::Error;

/// Error codes understood by the initial sync machinery.
///
/// Codes coming back from a remote server keep their numeric value, see [ErrorCode::from_i32].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InternalError,
    BadValue,
    NoSuchKey,
    HostUnreachable,
    HostNotFound,
    UnknownError,
    FailedToParse,
    TypeMismatch,
    IllegalOperation,
    InvalidBson,
    NamespaceNotFound,
    CursorNotFound,
    NoMatchingDocument,
    ExceededTimeLimit,
    NetworkTimeout,
    CallbackCanceled,
    ShutdownInProgress,
    NotYetInitialized,
    OperationFailed,
    InvalidSyncSource,
    OplogStartMissing,
    InitialSyncFailure,
    UnrecoverableRollbackError,
    InitialSyncOplogSourceMissing,
    InitialSyncActive,
    CappedPositionLost,
    OplogOutOfOrder,
    PrimarySteppedDown,
    SocketException,
    NotMaster,
    InterruptedAtShutdown,
    InterruptedDueToReplStateChange,
    NotMasterNoSlaveOk,
    NotMasterOrSecondary,
    /// A server code without a dedicated variant.
    Other(i32),
}

impl ErrorCode {
    /// Map a numeric server error code.
    pub fn from_i32(code: i32) -> ErrorCode {
        use ErrorCode::*;
        match code {
            1 => InternalError,
            2 => BadValue,
            4 => NoSuchKey,
            6 => HostUnreachable,
            7 => HostNotFound,
            8 => UnknownError,
            9 => FailedToParse,
            14 => TypeMismatch,
            20 => IllegalOperation,
            22 => InvalidBson,
            26 => NamespaceNotFound,
            43 => CursorNotFound,
            47 => NoMatchingDocument,
            50 => ExceededTimeLimit,
            89 => NetworkTimeout,
            90 => CallbackCanceled,
            91 => ShutdownInProgress,
            94 => NotYetInitialized,
            96 => OperationFailed,
            119 => InvalidSyncSource,
            120 => OplogStartMissing,
            123 => InitialSyncFailure,
            127 => UnrecoverableRollbackError,
            133 => InitialSyncOplogSourceMissing,
            134 => InitialSyncActive,
            136 => CappedPositionLost,
            152 => OplogOutOfOrder,
            189 => PrimarySteppedDown,
            9001 => SocketException,
            10107 => NotMaster,
            11600 => InterruptedAtShutdown,
            11602 => InterruptedDueToReplStateChange,
            13435 => NotMasterNoSlaveOk,
            13436 => NotMasterOrSecondary,
            other => Other(other),
        }
    }

    /// Numeric value of the code, as a server would report it.
    pub fn as_i32(self) -> i32 {
        use ErrorCode::*;
        match self {
            InternalError => 1,
            BadValue => 2,
            NoSuchKey => 4,
            HostUnreachable => 6,
            HostNotFound => 7,
            UnknownError => 8,
            FailedToParse => 9,
            TypeMismatch => 14,
            IllegalOperation => 20,
            InvalidBson => 22,
            NamespaceNotFound => 26,
            CursorNotFound => 43,
            NoMatchingDocument => 47,
            ExceededTimeLimit => 50,
            NetworkTimeout => 89,
            CallbackCanceled => 90,
            ShutdownInProgress => 91,
            NotYetInitialized => 94,
            OperationFailed => 96,
            InvalidSyncSource => 119,
            OplogStartMissing => 120,
            InitialSyncFailure => 123,
            UnrecoverableRollbackError => 127,
            InitialSyncOplogSourceMissing => 133,
            InitialSyncActive => 134,
            CappedPositionLost => 136,
            OplogOutOfOrder => 152,
            PrimarySteppedDown => 189,
            SocketException => 9001,
            NotMaster => 10107,
            InterruptedAtShutdown => 11600,
            InterruptedDueToReplStateChange => 11602,
            NotMasterNoSlaveOk => 13435,
            NotMasterOrSecondary => 13436,
            Other(code) => code,
        }
    }

    /// Transient network, topology or cursor errors which are worth another try of a first command.
    pub fn is_retriable(self) -> bool {
        use ErrorCode::*;
        matches!(
            self,
            NotMaster
                | NotMasterNoSlaveOk
                | NotMasterOrSecondary
                | InterruptedAtShutdown
                | InterruptedDueToReplStateChange
                | PrimarySteppedDown
                | ShutdownInProgress
                | HostNotFound
                | HostUnreachable
                | NetworkTimeout
                | SocketException
                | ExceededTimeLimit
                | CursorNotFound
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Other(code) => write!(f, "Location{}", code),
            code => write!(f, "{:?}", code),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("{code}: {message}")]
    Status { code: ErrorCode, message: String },
    #[error("Mongodb connection error: {0}")]
    MongoError(#[from] MongoError),
    #[error("Unexpected document shape: {0:?}")]
    BsonError(#[from] ValueAccessError),
    #[error("Failed to apply oplogs, write errors: {0:?}")]
    ApplyOplogError(Document),
}

impl SyncError {
    /// create an error with given `code` and `message`.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> SyncError {
        SyncError::Status {
            code,
            message: message.into(),
        }
    }

    /// the error returned to callbacks whose work was canceled.
    pub fn canceled() -> SyncError {
        SyncError::new(ErrorCode::CallbackCanceled, "Callback canceled")
    }

    /// get the error code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Status { code, .. } => *code,
            SyncError::MongoError(e) => match e.kind.as_ref() {
                ErrorKind::Command(cmd_err) => ErrorCode::from_i32(cmd_err.code),
                ErrorKind::Io(_) => ErrorCode::HostUnreachable,
                ErrorKind::ServerSelection { .. } => ErrorCode::HostNotFound,
                ErrorKind::Authentication { .. } => ErrorCode::Other(18),
                _ => ErrorCode::UnknownError,
            },
            SyncError::BsonError(_) => ErrorCode::FailedToParse,
            SyncError::ApplyOplogError(_) => ErrorCode::OperationFailed,
        }
    }

    /// true when the error only reports a canceled callback.
    pub fn is_canceled(&self) -> bool {
        self.code() == ErrorCode::CallbackCanceled
    }

    /// Prefix the error message with `context`, keeping the code.
    pub fn with_context(self, context: impl fmt::Display) -> SyncError {
        let code = self.code();
        SyncError::new(code, format!("{} :: caused by :: {}", context, self))
    }
}

pub type Result<T> = StdResult<T, SyncError>;
