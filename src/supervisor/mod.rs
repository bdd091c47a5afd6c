//! Master–worker replay supervision.
//!
//! The master partitions the archive's pipeline indices across worker
//! processes, supervises them through a single poll loop, folds crash
//! reports into a shader-module blacklist, and respawns workers over
//! their unfinished ranges. Workers run the replayer engine over their
//! ranges and convert any fatal failure into framed messages on their
//! stdout channel before dying.

pub mod master;
pub mod worker;

/// Worker exit code when the crash handler ran to completion.
pub const EXIT_CRASH_HANDLER: i32 = 2;

/// Exit code recorded when the master terminated a worker whose crash
/// teardown overran the timeout.
pub const EXIT_TIMEOUT_TERMINATED: i32 = 3;
