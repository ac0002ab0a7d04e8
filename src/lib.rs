//! Lazy, read-only FUSE mounts of layered container images.
//!
//! A privileged helper process merges the image's tar layers into one index and serves file
//! bytes on request over a private Unix socket; the unprivileged front-end mounts the merged
//! tree and forwards reads to it.

pub mod channel;
pub mod client;
pub mod fuse;
pub mod helper;
pub mod image;
pub mod index;
pub mod locate;
pub mod mount;
pub mod report;
pub mod tar;
pub mod tree;
pub mod userns;
pub mod util;
