//! Wire-level primitives shared by the server, proxies and the tooling that talks
//! to them: the `ZBXD` frame header, the JSON request/response envelope, tag
//! constants, payload compression and protocol version handling.

pub mod compress;
pub mod envelope;
pub mod frame;
pub mod json;
pub mod tags;
pub mod version;

pub use compress::{compress, compression_available, decompress, CompressError};
pub use envelope::{Envelope, EnvelopeError, EnvelopeKind, MoreFlag, ResponseStatus};
pub use frame::{encode_frame, read_frame, write_frame, Frame, FrameConfig, FrameError, FrameFlags};
pub use tags::RequestTag;
pub use version::{
    classify_compatibility, parse_version, Compatibility, RemoteVersion, Version, VersionError,
};
