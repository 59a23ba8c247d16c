pub mod config;
pub mod event;
pub mod record;

pub use config::{AppConfig, RemoteConfig};
pub use event::FileEvent;
pub use record::{FileRecord, UploadStatus};
