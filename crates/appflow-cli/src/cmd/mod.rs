pub mod actor;
pub mod app;
pub mod config;
pub mod init;
pub mod jobs;
pub mod review;
pub mod submit;
pub mod work;
