//! Source handlers and the registry that routes URLs to them
//!
//! ## Key Components
//!
//! - [`SourceHandler`] - capability trait: fetch one URL into an [`Artifact`]
//! - [`HandlerRegistry`] - ordered, first-match routing of URLs to handlers
//! - [`DirectHttpHandler`] - streams direct media links over HTTP
//! - [`YtDlpHandler`] - delegates site downloads to the `yt-dlp` binary
//!
//! ## Example
//!
//! ```rust,ignore
//! use mediafix::handlers::HandlerRegistry;
//!
//! let registry = HandlerRegistry::with_defaults()?;
//! let handler = registry.resolve("https://youtu.be/dQw4w9WgXcQ")?;
//! let artifact = handler.fetch(request, cancel).await?;
//! ```

mod http;
mod registry;
mod traits;
pub(crate) mod types;
mod ytdlp;

pub use http::{DirectHttpHandler, DownloadError, HttpConfig};
pub use registry::{HandlerRegistry, RegistryError, SourceMatcher};
pub use traits::{HandlerError, SourceHandler};
pub use types::{Artifact, FetchRequest};
pub use ytdlp::{DEFAULT_FORMAT, YtDlpHandler, classify_failure};
