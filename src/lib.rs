//! Cached, rate-limited recursive listing and search over public Google
//! Drive folders, with a background cache preloader.

pub mod cache;
pub mod config;
pub mod crawler;
pub mod drive;
pub mod limiter;
pub mod logging;
pub mod preloader;
pub mod session;
pub mod store;

#[cfg(test)]
mod test_support;
