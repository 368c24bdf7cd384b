pub mod download_handlers;
pub mod gallery_handlers;
pub mod health_handlers;
pub mod share_handlers;
pub mod upload_handlers;
