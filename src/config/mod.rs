//! Configuration for the authentication core.

mod loader;
mod options;
mod types;

pub use loader::{load_config, load_config_from_str};
pub use options::parse_authenticator_options;
pub use types::{Config, UserSyncConfig};
