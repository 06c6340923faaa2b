pub mod config;
pub mod health;
pub mod prs;
pub mod remote;
pub mod sessions;
pub mod sync;
pub mod workspaces;
