//! Edge job dispatch and log collection.

mod dispatcher;
mod error;
mod files;

pub use dispatcher::{EdgeJobDispatcher, EdgeJobTask};
pub use error::JobError;
pub use files::FileStore;
