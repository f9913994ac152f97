pub mod client;
pub mod commands;
pub mod controller;
pub mod daemon;
pub mod monitor;
pub mod policy;
pub mod rt;
pub mod service;
