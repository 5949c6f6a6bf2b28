// Library surface for headless/integration tests and the binary.
// Terminal setup and the CLI stay in main.rs.
pub mod admin;
pub mod app;
pub mod app_dirs;
pub mod archive;
pub mod clock;
pub mod config;
pub mod device;
pub mod engine;
pub mod flow;
pub mod lang;
pub mod layout;
pub mod network;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod submission;
pub mod training;
pub mod ui;
pub mod util;
