//! Fault-tolerant pipeline-state replay supervisor.
//!
//! Replays a recorded catalogue of graphics-API pipeline objects
//! (samplers, descriptor-set and pipeline layouts, shader modules,
//! render passes, graphics and compute pipelines) against a live driver
//! to pre-populate its pipeline caches. Any single pipeline can take the
//! driver down, so replay runs in isolated worker processes under a
//! supervising master: crashes are detected, the implicated shader
//! modules are blacklisted, and replay resumes where the worker stopped.
//!
//! High-level flow (one run):
//! 1) Master counts pipelines across the archive set and splits the
//!    index space across N workers.
//! 2) Each worker receives its ranges and the current blacklist over
//!    stdin, replays in-process, and reports progress/crashes over a
//!    message-framed channel.
//! 3) On a crash the master folds the reported `MODULE` hashes into the
//!    blacklist and respawns the worker over its unfinished sub-range.
//! 4) An optional shared-memory control block carries telemetry to an
//!    external observer.
//!
//! Subsystems:
//! - [`hasher`] / [`state`]: deterministic content addressing and the
//!   serialized document round-trip.
//! - [`ipc`] / [`control`]: framed worker channel and shared telemetry.
//! - [`supervisor`]: the master loop and the worker runtime.
//! - [`engine`] / [`archive`]: the replayer-engine collaborator and the
//!   archive set it consumes.

pub mod archive;
pub mod cli;
pub mod control;
pub mod engine;
pub mod errors;
pub mod hasher;
pub mod ipc;
pub mod state;
pub mod supervisor;
pub mod vk;
