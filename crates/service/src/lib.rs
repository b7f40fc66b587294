pub mod service;

pub use service::{
    RescanRequest, RescanService, RescanSessionSnapshot, RescanSessionStatus, WaitCondition,
};
