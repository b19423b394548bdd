pub mod cmd;
pub mod config;
pub mod context;
pub mod datastore;
pub mod error;
pub mod event;
pub mod flush;
pub mod ingest;
pub mod lifecycle;
pub mod metrics_consts;
pub mod parse;
pub mod registry;
pub mod similarity;
