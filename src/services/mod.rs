pub mod file_stager;
pub mod import_service;
pub mod importer;
pub mod status_store;
pub mod upload_validator;
