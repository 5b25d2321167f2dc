//! Now-playing metadata from the shairport-sync metadata pipe.
//!
//! shairport-sync writes an XML-framed, base64-encoded stream of AirPlay
//! metadata onto a named pipe. This crate turns that stream into two kinds of
//! events:
//!
//! * metadata bundles: coherent, sequenced snapshots of what is playing
//! * playback state changes, validated against a small state machine
//!
//! The [`monitor::Monitor`] owns the pipe and a background reader thread.
//! [`reader::Reader`] and [`state::StateMachine`] are synchronous and can be
//! driven directly, for example when replaying a [`capture`] file.
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod artwork;
pub mod bundle;
pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod pipe;
pub mod protocol;
pub mod reader;
pub mod scheduler;
pub mod state;

#[cfg(feature = "binary")]
pub mod signal;
