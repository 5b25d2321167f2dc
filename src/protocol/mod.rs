//! The shairport-sync metadata pipe protocol.
//!
//! Every record on the pipe is an `<item>` frame:
//!
//! ```text
//! <item><type>636f7265</type><code>61736172</code><length>11</length>
//! <data encoding="base64">
//! VGhlIEJlYXRsZXM=</data></item>
//! ```
//!
//! `type` and `code` are four-character codes written as hex. The `core` type
//! carries iTunes-style DMAP tags and the `ssnc` type carries session and
//! control signals of shairport-sync itself. The optional base64 payload may
//! be spread over any number of lines.
//!
//! # Submodules
//!
//! * [`codes`] - Frame types, code tables and four-character-code helpers
//! * [`frame`] - Line-oriented framing and payload decoding

pub mod codes;
pub mod frame;

pub use codes::{FourCc, SsncCode};
pub use frame::{FrameError, Framer, Item, RawItem};
