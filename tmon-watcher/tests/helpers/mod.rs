//! Shared helpers for watcher integration tests

#![allow(dead_code)]

pub mod db_utils;
pub mod fakes;
