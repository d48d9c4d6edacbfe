//! SiteSmith: describe a website, refine it through chat, preview the HTML.
pub mod client;
pub mod config;
pub mod extract;
pub mod logger;
pub mod models;
pub mod poller;
pub mod relay;
pub mod router;
pub mod session;
pub mod storage;
pub mod stream;
