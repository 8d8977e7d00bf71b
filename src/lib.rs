pub mod admin;
pub mod analysis;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod garbage;
pub mod imaging;
pub mod ingest;
pub mod llm;
pub mod model;
pub mod queue;
pub mod storage;
pub mod thumbnail;
pub mod tracker;
pub mod vision;
pub mod worker;
