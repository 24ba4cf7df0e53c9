//! Blob storage for transcoded output.
//!
//! This crate provides:
//! - The [`BlobStore`] seam used by the rendition executor and manifest assembler
//! - A Cloudflare R2 implementation (S3 API)
//! - An in-memory implementation for tests and local runs

pub mod blob;
pub mod client;
pub mod error;

pub use blob::{content_type_for, BlobStore, MemoryBlobStore};
pub use client::{R2Client, R2Config};
pub use error::{StorageError, StorageResult};
