pub mod amm;
pub mod backfill;
pub mod bonding_curve;
pub mod cache;
pub mod candles;
pub mod chain;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod fanout;
pub mod listener;
pub mod log_parser;
pub mod metadata;
pub mod migration;
pub mod models;
pub mod oracle;
pub mod pipeline;
pub mod pricing;
pub mod projector;
pub mod queue;
pub mod refresh;
pub mod retry;
pub mod stats;
pub mod store;
