#[macro_use]
extern crate diesel;

pub mod auth;
pub mod config;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod ledger;
pub mod models;
pub mod queue;
pub mod saga;
pub mod schema;

#[cfg(test)]
mod testing;
