pub mod backup;
pub mod resource_service;
pub mod share_service;
pub mod upload_service;
