pub mod attrs;
pub mod commit;
pub mod largeblob;
pub mod tree;

pub(crate) mod wire;

pub use attrs::{AttrMap, AttrValue, ATTR_CTIME, ATTR_FILESIZE, ATTR_MTIME, ATTR_PERMS, ATTR_USERNAME};
pub use commit::Commit;
pub use largeblob::{Fragment, LargeBlob};
pub use tree::{EntryType, Tree, TreeEntry};
