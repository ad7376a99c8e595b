pub mod api;
pub mod capture;
pub mod command;
pub mod flow;
pub mod monitor;
pub mod pipeline;
pub mod system;
pub mod utils;
pub mod web;
