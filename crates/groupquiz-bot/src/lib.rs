// Telegram front end for the group quiz engine.

pub mod app;
pub mod commands;
pub mod config;
pub mod scheduler;
pub mod telegram;
