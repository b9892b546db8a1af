pub mod api;
pub mod crypto;
pub mod error;
pub mod model;
pub mod paths;
pub mod proximity;
pub mod risk;
pub mod secure_storage;
pub mod session;
pub mod settings;
pub mod store;
