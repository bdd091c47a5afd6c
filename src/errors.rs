//! Error types for the recording, replay, and supervision stages.
//!
//! Each enum covers one failure boundary: the recorder's handle lookups,
//! document parse/replay, control-block attachment, and the master's
//! spawn/wait cycle. Nothing aggregates them into a catch-all type; the
//! boundaries have different recovery policies (a corrupt control block
//! is shrugged off, a spawn failure aborts the run) and collapsing them
//! would blur that. Enums stay `#[non_exhaustive]` so a new failure mode
//! does not break downstream matches.
//!
//! Worker-side failures deliberately have no representation here: past
//! the crash handler they exist only as framed messages and a nonzero
//! exit code, which the master classifies on the other side of the
//! process boundary. `detail` strings are for humans reading stderr, not
//! for machine parsing; wrapped `io::Error`s keep their source chain.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Errors from the recording-side registry.
#[derive(Debug)]
#[non_exhaustive]
pub enum RecorderError {
    /// A handle was queried that was never installed with `set_*_handle`.
    UnknownHandle { kind: &'static str, handle: u64 },
    /// A typed reference points past the end of its registry.
    UnknownReference { kind: &'static str, index: u32 },
}

impl fmt::Display for RecorderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownHandle { kind, handle } => {
                write!(f, "unknown {kind} handle {handle:#x}")
            }
            Self::UnknownReference { kind, index } => {
                write!(f, "{kind} reference {index} is not registered")
            }
        }
    }
}

impl std::error::Error for RecorderError {}

/// Errors from parsing a serialized state document.
///
/// Parsing validates the whole document before the first factory
/// callback, so a returned error implies no engine side effects.
#[derive(Debug)]
#[non_exhaustive]
pub enum ReplayError {
    /// The document is not valid JSON or does not match the schema.
    MalformedDocument { detail: String },
    /// A cross-reference indexes past the referenced kind's array.
    DanglingReference {
        kind: &'static str,
        index: u32,
        len: u32,
    },
    /// The engine rejected a creation callback.
    CreateFailed {
        kind: &'static str,
        index: u32,
        detail: String,
    },
}

impl ReplayError {
    pub(crate) fn malformed(err: serde_json::Error) -> Self {
        Self::MalformedDocument {
            detail: err.to_string(),
        }
    }
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedDocument { detail } => {
                write!(f, "malformed state document: {detail}")
            }
            Self::DanglingReference { kind, index, len } => {
                write!(
                    f,
                    "dangling {kind} reference: index {index} exceeds registry size {len}"
                )
            }
            Self::CreateFailed {
                kind,
                index,
                detail,
            } => {
                write!(f, "engine failed to create {kind} #{index}: {detail}")
            }
        }
    }
}

impl std::error::Error for ReplayError {}

/// Errors from opening the on-disk archive set.
#[derive(Debug)]
#[non_exhaustive]
pub enum ArchiveError {
    /// I/O error reading an archive file.
    Io { path: PathBuf, source: io::Error },
    /// An archive file failed document validation.
    Parse { path: PathBuf, source: ReplayError },
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read archive {}: {source}", path.display())
            }
            Self::Parse { path, source } => {
                write!(f, "failed to parse archive {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ArchiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
        }
    }
}

/// Errors from creating or attaching the shared control block.
///
/// Any of these disables telemetry; the supervisor keeps running.
#[derive(Debug)]
#[non_exhaustive]
pub enum ControlBlockError {
    /// The mapped region's version cookie does not match this build.
    BadCookie { found: u32, expected: u32 },
    /// The ring buffer size is zero or not a power of two.
    BadRingSize { size: u32 },
    /// The ring buffer offset overlaps the header.
    BadRingOffset { offset: u32, header: u32 },
    /// The mapped region is smaller than header plus ring.
    RegionTooSmall { len: usize, need: usize },
    /// A platform call failed.
    Platform { call: &'static str, errno: i32 },
}

impl fmt::Display for ControlBlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadCookie { found, expected } => {
                write!(f, "control block cookie {found:#x} != {expected:#x}")
            }
            Self::BadRingSize { size } => {
                write!(f, "control block ring size {size} is not a power of two")
            }
            Self::BadRingOffset { offset, header } => {
                write!(
                    f,
                    "control block ring offset {offset} overlaps {header}-byte header"
                )
            }
            Self::RegionTooSmall { len, need } => {
                write!(f, "control block region is {len} bytes, need {need}")
            }
            Self::Platform { call, errno } => {
                write!(
                    f,
                    "{call} failed: {}",
                    io::Error::from_raw_os_error(*errno)
                )
            }
        }
    }
}

impl std::error::Error for ControlBlockError {}

/// Errors from the master supervisor.
#[derive(Debug)]
#[non_exhaustive]
pub enum SupervisorError {
    /// A worker process could not be created. Fatal.
    SpawnFailure { slot: u32, source: io::Error },
    /// The multi-wait itself failed. Fatal.
    WaitFailure { source: io::Error },
    /// The archive set could not be opened or counted. Fatal at startup.
    Archive(ArchiveError),
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpawnFailure { slot, source } => {
                write!(f, "failed to spawn worker {slot}: {source}")
            }
            Self::WaitFailure { source } => write!(f, "event wait failed: {source}"),
            Self::Archive(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SpawnFailure { source, .. } => Some(source),
            Self::WaitFailure { source } => Some(source),
            Self::Archive(err) => Some(err),
        }
    }
}

impl From<ArchiveError> for SupervisorError {
    fn from(err: ArchiveError) -> Self {
        Self::Archive(err)
    }
}
