#![allow(dead_code)]

pub mod memory_broker;
pub mod recording;
pub mod stream_fixture;
