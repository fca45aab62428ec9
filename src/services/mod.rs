pub mod calendar;
pub mod commands;
pub mod discord;
pub mod display;
pub mod gateway;
pub mod google;
pub mod grid;
pub mod init;
pub mod scheduler;
pub mod subscriptions;
pub mod webhooks;
