//! Loading captures, in the foreground or on a worker thread.

pub mod async_loader;
pub mod loader;
pub mod progress;

pub use async_loader::{AsyncLoader, LoadResult};
pub use loader::{load_trace, load_with, LoadedTrace};
pub use progress::{LoadProgress, LoadState, LoadStatus};
