mod defaults;
mod resolve;
mod types;

pub use self::defaults::parse_human_duration;
pub use self::resolve::{default_config_search_paths, load_config, resolve_config_path, ConfigOrigin, ConfigSource};
pub use self::types::*;
pub(crate) use self::resolve::parse_config;
