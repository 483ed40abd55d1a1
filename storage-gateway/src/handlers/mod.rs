pub mod auth;
pub mod files;
pub mod invite;
pub mod metrics;
