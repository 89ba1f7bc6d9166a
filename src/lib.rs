pub mod archive;
pub mod cancel;
pub mod config;
pub mod dimension;
pub mod domain;
pub mod error;
pub mod geo;
pub mod normalize;
pub mod orchestrator;
pub mod output;
pub mod pagination;
pub mod record;
pub mod registry;
pub mod sources;
pub mod transport;
