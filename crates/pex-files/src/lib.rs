//! # pex-files — the opaque-blob data plane
//!
//! Everything between an inbound `/blobs/*` request and the bytes that
//! answer it:
//!
//! - [`RemoteReader`] resolves each chunk against peers first and falls
//!   back to the origin URL, with loop prevention for peer-originated
//!   requests.
//! - [`FilesStore`] is the front door: it derives the chunk key from the
//!   request, opens [`CachedFile`]s that read through the chunk cache,
//!   and feeds the prefetch pool and the advertisement stream.
//! - [`AzureUrlParser`] recovers the content digest from the supported
//!   pre-signed blob URL families.

mod file;
mod parser;
mod reader;
mod store;

pub use file::CachedFile;
pub use parser::{AzureUrlParser, ParseError, UrlDigestParser};
pub use reader::{Reader, ReaderConfig, ReadError, RemoteReader};
pub use store::{FilesStore, StoreConfig};
