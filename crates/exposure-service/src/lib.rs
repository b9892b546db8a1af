pub mod api_client;
pub mod hardware;
pub mod notifier;
pub mod registration;
pub mod reporting;
pub mod scheduler;
