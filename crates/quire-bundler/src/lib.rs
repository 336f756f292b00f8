//! Incremental bundler context for the quire site builder.
//!
//! Compiles the site-builder entry point into a single server-side module,
//! inlines stylesheet imports as text, and replaces `*.inline.ts` scripts with
//! their standalone minified browser bundles.

pub mod context;
pub mod inline;
pub mod metafile;

pub use context::{
    Bundler, BundlerContext, BundlerError, BundlerOptions, DriverConfig, DRIVER_SOURCE,
};
pub use inline::{strip_exports, InlineModule, InlineScriptPlugin};
pub use metafile::{format_bytes, BuildMetadata, OutputInfo};
