mod error;
mod utils;

pub mod betree;
pub mod buffer;
pub mod io;

pub use crate::betree::{BeTree, TreeIter};
pub use crate::buffer::{BufferManager, ExclusiveFix, SharedFix};
pub use crate::error::{StorageError, StorageResult};
pub use crate::io::Datum;
pub use crate::utils::init_log;
