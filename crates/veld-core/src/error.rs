//! Error types for veld operations.
//!
//! Every variant carries a stable [`ErrorCode`]. Scripts match on the
//! numeric value or the symbolic name, so neither may change once released.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All possible veld errors.
#[derive(Debug, Error)]
pub enum VeldError {
    /// The directory is not a veld repository.
    #[error("not a veld repository (missing .veld/)")]
    NotARepo,
    /// A repository (or named entry) already exists here.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// No changeset with this id is present in this replica.
    #[error("changeset not found: {0}")]
    ChangesetNotFound(String),
    /// Stored or received bytes do not hash to the claimed id.
    #[error("changeset {0} failed its content-hash check")]
    CorruptChangeset(String),
    /// A changeset references a parent that is neither present nor part
    /// of the same transaction.
    #[error("changeset {child} references missing parent {parent}")]
    MissingParent { child: String, parent: String },
    /// A revision spec did not resolve.
    #[error("unknown revision: {0}")]
    UnknownRevision(String),
    /// No head records exist for the branch.
    #[error("branch not found: {0}")]
    BranchNotFound(String),
    /// Applying the operation would leave one or more branches with
    /// mutually unreachable heads.
    #[error("ambiguous branch heads: {}", .branches.join(", "))]
    AmbiguousHeads { branches: Vec<String> },
    /// The changeset is not a recorded head of the branch.
    #[error("{csid} is not a head of branch {branch}")]
    HeadNotFound { branch: String, csid: String },
    /// The tag already names a different changeset.
    #[error("tag already exists: {0}")]
    TagExists(String),
    /// A record or commit names a user this replica does not know.
    #[error("unknown user: {0}")]
    UnknownUser(String),
    /// Another user holds a lock on the path.
    #[error("{path} is locked by {holder}")]
    LockHeld { path: String, holder: String },
    /// No lock this user may act on: the id is unknown, or only other
    /// users hold locks on the path.
    #[error("lock not found: {0}")]
    LockNotFound(String),
    /// The user holds no lock on the path.
    #[error("{0} is not locked by this user")]
    AlreadyUnlocked(String),
    /// The path has no committed presence on the branch.
    #[error("not versioned: {0}")]
    NotVersioned(String),
    /// A tree already has an entry at the path.
    #[error("path already exists in tree: {0}")]
    PathExists(String),
    /// The sync exchange did not complete; nothing was applied.
    #[error("sync incomplete: {0}")]
    SyncIncomplete(String),
    #[error("sync session not found: {0}")]
    SessionNotFound(String),
    /// The session already ended without committing and cannot resume.
    #[error("sync session {session} already ended ({phase})")]
    SessionClosed { session: String, phase: String },
    #[error("remote not found: {0}")]
    RemoteNotFound(String),
    #[error("remote already exists: {0}")]
    RemoteAlreadyExists(String),
    /// Could not acquire the repository file lock within the timeout.
    #[error("could not acquire repository lock within timeout")]
    RepoLockTimeout,
}

/// Stable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotARepo,
    AlreadyExists,
    Io,
    Json,
    ChangesetNotFound,
    CorruptChangeset,
    MissingParent,
    UnknownRevision,
    BranchNotFound,
    AmbiguousHeads,
    HeadNotFound,
    TagExists,
    UnknownUser,
    LockHeld,
    LockNotFound,
    AlreadyUnlocked,
    NotVersioned,
    PathExists,
    SyncIncomplete,
    SessionNotFound,
    SessionClosed,
    RemoteNotFound,
    RemoteAlreadyExists,
    RepoLockTimeout,
}

impl ErrorCode {
    /// Numeric value of the code.
    pub fn number(self) -> u32 {
        match self {
            ErrorCode::NotARepo => 100,
            ErrorCode::AlreadyExists => 101,
            ErrorCode::Io => 102,
            ErrorCode::Json => 103,
            ErrorCode::ChangesetNotFound => 200,
            ErrorCode::CorruptChangeset => 201,
            ErrorCode::MissingParent => 202,
            ErrorCode::UnknownRevision => 203,
            ErrorCode::BranchNotFound => 2300,
            ErrorCode::AmbiguousHeads => 2301,
            ErrorCode::HeadNotFound => 2302,
            ErrorCode::TagExists => 2303,
            ErrorCode::UnknownUser => 400,
            ErrorCode::LockHeld => 500,
            ErrorCode::LockNotFound => 501,
            ErrorCode::AlreadyUnlocked => 502,
            ErrorCode::NotVersioned => 503,
            ErrorCode::PathExists => 504,
            ErrorCode::SyncIncomplete => 600,
            ErrorCode::SessionNotFound => 601,
            ErrorCode::RemoteNotFound => 602,
            ErrorCode::RemoteAlreadyExists => 603,
            ErrorCode::RepoLockTimeout => 604,
            ErrorCode::SessionClosed => 605,
        }
    }

    /// Symbolic name of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotARepo => "NOT_A_REPO",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::Io => "IO",
            ErrorCode::Json => "JSON",
            ErrorCode::ChangesetNotFound => "CHANGESET_NOT_FOUND",
            ErrorCode::CorruptChangeset => "CORRUPT_CHANGESET",
            ErrorCode::MissingParent => "MISSING_PARENT",
            ErrorCode::UnknownRevision => "UNKNOWN_REVISION",
            ErrorCode::BranchNotFound => "BRANCH_NOT_FOUND",
            ErrorCode::AmbiguousHeads => "AMBIGUOUS_BRANCH_HEADS",
            ErrorCode::HeadNotFound => "HEAD_NOT_FOUND",
            ErrorCode::TagExists => "TAG_EXISTS",
            ErrorCode::UnknownUser => "UNKNOWN_USER",
            ErrorCode::LockHeld => "LOCK_HELD",
            ErrorCode::LockNotFound => "LOCK_NOT_FOUND",
            ErrorCode::AlreadyUnlocked => "ALREADY_UNLOCKED",
            ErrorCode::NotVersioned => "NOT_VERSIONED",
            ErrorCode::PathExists => "PATH_EXISTS",
            ErrorCode::SyncIncomplete => "SYNC_INCOMPLETE",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::SessionClosed => "SESSION_CLOSED",
            ErrorCode::RemoteNotFound => "REMOTE_NOT_FOUND",
            ErrorCode::RemoteAlreadyExists => "REMOTE_ALREADY_EXISTS",
            ErrorCode::RepoLockTimeout => "REPO_LOCK_TIMEOUT",
        }
    }

    /// True when the same call may succeed if simply retried (after
    /// extending a fragment, once the transport recovers, or once the
    /// repository file lock is free).
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::SyncIncomplete | ErrorCode::MissingParent | ErrorCode::RepoLockTimeout
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.number())
    }
}

impl VeldError {
    /// The stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            VeldError::NotARepo => ErrorCode::NotARepo,
            VeldError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            VeldError::Io(_) => ErrorCode::Io,
            VeldError::Json(_) => ErrorCode::Json,
            VeldError::ChangesetNotFound(_) => ErrorCode::ChangesetNotFound,
            VeldError::CorruptChangeset(_) => ErrorCode::CorruptChangeset,
            VeldError::MissingParent { .. } => ErrorCode::MissingParent,
            VeldError::UnknownRevision(_) => ErrorCode::UnknownRevision,
            VeldError::BranchNotFound(_) => ErrorCode::BranchNotFound,
            VeldError::AmbiguousHeads { .. } => ErrorCode::AmbiguousHeads,
            VeldError::HeadNotFound { .. } => ErrorCode::HeadNotFound,
            VeldError::TagExists(_) => ErrorCode::TagExists,
            VeldError::UnknownUser(_) => ErrorCode::UnknownUser,
            VeldError::LockHeld { .. } => ErrorCode::LockHeld,
            VeldError::LockNotFound(_) => ErrorCode::LockNotFound,
            VeldError::AlreadyUnlocked(_) => ErrorCode::AlreadyUnlocked,
            VeldError::NotVersioned(_) => ErrorCode::NotVersioned,
            VeldError::PathExists(_) => ErrorCode::PathExists,
            VeldError::SyncIncomplete(_) => ErrorCode::SyncIncomplete,
            VeldError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            VeldError::SessionClosed { .. } => ErrorCode::SessionClosed,
            VeldError::RemoteNotFound(_) => ErrorCode::RemoteNotFound,
            VeldError::RemoteAlreadyExists(_) => ErrorCode::RemoteAlreadyExists,
            VeldError::RepoLockTimeout => ErrorCode::RepoLockTimeout,
        }
    }
}

/// Convenience alias for Results in veld.
pub type VeldResult<T> = Result<T, VeldError>;
