//! Moderation policy configuration.
//!
//! `PolicyStore` holds the live snapshot, `ConfigRefresher` keeps it current
//! from a `ConfigSource` (remote key-value service with a local file fallback).

pub mod model;
pub mod refresher;
pub mod source;
pub mod store;

pub use model::{ChannelConfig, MonitoringSettings, PolicyRule, PolicyTable};
pub use refresher::{
    ConfigRefresher, LoadedConfig, bootstrap_store, load_config, load_config_or_defaults,
};
pub use source::{
    ConfigDocument, ConfigSource, LayeredConfigSource, LocalFileSource, RemoteConfigSource,
};
pub use store::{PolicySnapshot, PolicyStore};
