//! replication: the remote read contract and the pull client

pub mod local;
pub mod pull;
pub mod serve;
pub mod ssh;

use crate::error::Result;
use crate::hash::Hash;
use crate::object::ObjectType;

pub use local::LocalSource;
pub use pull::{pull, PullStats};
pub use serve::serve;
pub use ssh::SshSource;

/// the read contract a pull source must honor.
///
/// any repository can stand behind it: an on-disk repo (`LocalSource`) or a
/// remote one reached over ssh (`SshSource`).
pub trait RemoteSource {
    /// the source repository's HEAD
    fn head(&mut self) -> Result<Hash>;

    /// HEAD plus any lost heads the source knows about
    fn list_heads(&mut self) -> Result<Vec<Hash>>;

    fn has_object(&mut self, hash: &Hash) -> Result<bool>;

    fn object_type(&mut self, hash: &Hash) -> Result<ObjectType>;

    /// the object's decompressed canonical payload
    fn get_object(&mut self, hash: &Hash) -> Result<Vec<u8>>;
}
