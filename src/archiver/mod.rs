pub mod audit;
pub mod cache;
pub mod commit;
pub mod config;
pub mod crawl;
pub mod facts;
pub mod fingerprint;
pub mod log_facts;
pub mod metadata;
pub mod orchestrator;
pub mod packager;
pub mod paths;
pub mod policy;
pub mod remote_index;
pub mod store;
pub mod util;
