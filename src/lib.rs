#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use mthread_sync as sync;
pub use mthread_rt::*;
