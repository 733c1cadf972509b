//! Paladin - group based player permissions
//!
//! This library provides the permission engine, its storage and the read API.
//! It exposes all modules for testing purposes.

pub mod admin;
pub mod entities;
pub mod errors;
pub mod group_sync;
pub mod jobs;
pub mod perms;
pub mod settings;
pub mod storage;
pub mod web;
