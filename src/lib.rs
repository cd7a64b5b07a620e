//! Resumable, checksum-verified acquisition of reference genome sequences and
//! gene annotations from Ensembl and NCBI Datasets.

pub mod acquire;
pub mod archive;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod fs_util;
pub mod manifest;
pub mod output;
pub mod scheduler;
pub mod species;
pub mod store;
pub mod verify;
