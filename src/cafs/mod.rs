pub mod driver;
pub mod log_sync;
pub mod mount;
pub mod sync;

use serde::{Deserialize, Serialize};

use crate::hash::{hash_parts, H32};

/// Files are hashed over fixed 4 MiB blocks.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// The single writable session every mount exposes.
pub const RW_SESSION_NAME: &str = "rw";

/// Well-known vpaths inside the contract filesystem.
pub const STATE_DIR_PATH: &str = "/state";
pub const PATCH_FILE_PATH: &str = "/patch.cfg";

/// Subtrees the consensus engine exchanges with the contract process,
/// all under the state directory.
pub const INPUT_DIR_PATH: &str = "/state/hp_inputs";
pub const OUTPUT_DIR_PATH: &str = "/state/hp_outputs";
pub const NPL_IN_FILE_PATH: &str = "/state/hp_npl/in";
pub const NPL_OUT_FILE_PATH: &str = "/state/hp_npl/out";

/// One entry of a directory hash listing, sorted by name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildHashNode {
    pub name: String,
    pub is_file: bool,
    pub hash: H32,
}

/// A mount's root hash is the binary combination of its two top-level
/// children (patch overlay and state tree for the contract fs).
pub fn combine_root(child_one: &H32, child_two: &H32) -> H32 {
    hash_parts(&[child_one.as_bytes(), child_two.as_bytes()])
}
