//! Remote-store abstraction for blobgate.
//!
//! The preload pipeline consumes the remote blob namespace only through the
//! [`RemoteStore`] capability trait: paginated listing, attribute lookup,
//! ranged reads, and the block staging/commit pair used by upload flows.
//!
//! Two kinds of implementation exist behind the trait: the mount layer's
//! real blob-store client (out of scope here), and [`LocalFsStore`], which
//! serves a directory tree as if it were the remote namespace and doubles as
//! the test backend.

mod error;
mod localfs;
mod traits;

pub use error::RemoteError;
pub use localfs::LocalFsStore;
pub use traits::{ListPage, ObjectAttributes, RemoteStore};
