pub mod health_handlers;
pub mod import_handlers;
