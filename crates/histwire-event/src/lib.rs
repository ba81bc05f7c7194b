//! Event model shared by the histwire proxy and the shell hook.
//!
//! On the wire an event is one JSON object per line. The proxy treats
//! events as opaque beyond "parses as an object", so [`Event`] wraps
//! the raw object and exposes typed accessors instead of a closed
//! struct; unknown fields (notably `_config_version`) survive a
//! decode/encode round trip byte-for-byte at the field level.

mod envpolicy;
mod event;

#[rustfmt::skip]
pub use self::envpolicy::*;
#[rustfmt::skip]
pub use self::event::*;
