//! # revkb Codec
//!
//! The persisted value model of revkb and its byte encodings.
//!
//! - [`Value`]: dynamic, totally ordered attribute values, including
//!   references to other objects.
//! - [`ObjectKey`]: identity of an object in a branch and history context.
//! - CBOR encoding of any serde type ([`to_cbor`], [`from_cbor`]).
//! - Checksummed frames for append-only journals ([`encode_frame`],
//!   [`FrameReader`]).
//!
//! ## Usage
//!
//! ```
//! use revkb_codec::{from_cbor, to_cbor, Value};
//!
//! let value = Value::Integer(42);
//! let bytes = to_cbor(&value).unwrap();
//! let decoded: Value = from_cbor(&bytes).unwrap();
//! assert_eq!(value, decoded);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod frame;
mod key;
mod value;

pub use cbor::{from_cbor, to_cbor};
pub use error::{CodecError, CodecResult};
pub use frame::{compute_checksum, encode_frame, FrameReader, FRAME_MAGIC, FRAME_OVERHEAD};
pub use key::{
    BranchId, ObjectKey, RevisionNumber, CURRENT_REV, FIRST_REV, INITIAL_REV, TRUNK,
};
pub use value::Value;
