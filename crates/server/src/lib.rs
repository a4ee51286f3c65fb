// cdm-server library: relational store, graph document sync, approval workflow
// and the HTTP/websocket surface that exposes them.

pub mod api;
pub mod app;
pub mod config;
pub mod cors;
pub mod db;
pub mod error;
pub mod events;
pub mod store;
pub mod sync;
pub mod workflow;
pub mod ws;
