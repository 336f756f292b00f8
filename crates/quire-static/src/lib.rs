//! Critical CSS and HTML head post-processing for quire.
//!
//! This crate provides:
//! - Above-the-fold CSS extraction in headless Chrome, cached per process
//! - Theme variable substitution for hand-written CSS
//! - Canonical `<head>` ordering that preserves source bytes
//! - Batch injection across the built site

pub mod browser;
pub mod critical;
pub mod head;
pub mod inject;
pub mod theme;

pub use browser::BrowserExtractor;
pub use critical::{
    minify_css, CacheState, CriticalCssCache, CriticalCssError, CriticalCssOptions,
    CriticalExtractor, ExtractRequest, WaitPolicy,
};
pub use head::{
    verify_children, HeadDocument, HeadIntegrityError, HeadNode, HeadSlot, NodeId, NodeKind,
    CRITICAL_CSS_ID, DARK_MODE_SCRIPT_ID,
};
pub use inject::{process_html, CriticalCssInjector, InjectError, InjectionReport};
pub use theme::{ThemeError, ThemeVariables, VariableValue, THEME_TEMPLATE, UNITLESS_VARIABLES};
