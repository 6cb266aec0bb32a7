pub mod accounts;
pub mod announcements;
pub mod app;
pub mod ask;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod session;
pub mod storage;

#[cfg(test)]
mod test;
