//! ori - distributed content-addressed versioning file system
//!
//! a repository stores an immutable object graph (commits, trees, blobs)
//! keyed by SHA-256 digest, and exposes a mutable working view through an
//! overlay that folds every change back into a new commit. replication
//! pulls missing objects from a peer by transitive closure over the DAG.
//!
//! # Core concepts
//!
//! - **Blob**: raw file content; its hash is the digest of the bytes
//! - **LargeBlob**: a chunked file, addressed by its fragment list
//! - **Tree**: a sorted directory structure with typed attributes
//! - **Commit**: a snapshot of a tree with one or two parents
//! - **HEAD**: the repository tip, advanced atomically after objects land
//!
//! # Example usage
//!
//! ```no_run
//! use std::path::Path;
//! use ori::{ops, Repo};
//!
//! // initialize a repository and commit the working directory
//! let repo = Repo::init(Path::new("/path/to/repo")).unwrap();
//! let hash = ops::commit(&repo, "initial commit", None).unwrap();
//! println!("HEAD is now {}", hash);
//! ```

mod error;
mod hash;

pub mod object;
pub mod ops;
pub mod overlay;
pub mod repo;
pub mod store;
pub mod stream;
pub mod transport;
pub mod types;

pub use error::{Error, IoResultExt, Result};
pub use hash::{ContentHasher, Hash};
pub use object::{BackrefRole, ObjectType, ORI_OBJECT_HDRSIZE};
pub use overlay::{FileKind, FileState, JournalMode, Overlay, SnapshotView};
pub use repo::{content_hash, current_user, Repo, LARGE_BLOB_THRESHOLD, ORI_VERSION};
pub use store::Store;
pub use stream::{ByteStream, DiskStream, FdStream, LzmaStream, MemStream};
pub use transport::{LocalSource, RemoteSource, SshSource};
pub use types::{AttrMap, AttrValue, Commit, EntryType, Fragment, LargeBlob, Tree, TreeEntry};
