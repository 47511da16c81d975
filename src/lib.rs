//! A template rendering engine for WordprocessingML (`.docx`) documents:
//! substitutes expressions, expands loops and conditionals across
//! paragraphs and table rows, splices in named fragments, and serializes
//! the result back into a valid `.docx` container.
//!
//! The [`Engine`] façade is the entry point: [`Engine::prepare`] parses and
//! statically indexes a template once, and the resulting [`PreparedTemplate`]
//! may be rendered concurrently, any number of times, against different data
//! via [`Engine::render`].

pub mod ast;
pub mod cache;
pub mod cancel;
pub mod coalesce;
pub mod codemap;
pub mod config;
pub mod context;
pub mod doc;
pub mod engine;
pub mod error;
pub mod eval;
pub mod fragment;
pub mod functions;
pub mod locate;
pub mod package;
pub mod parser;
pub mod render;
pub mod validate;
pub mod value;

pub use cancel::CancellationToken;
pub use config::Config;
pub use engine::{Engine, PreparedTemplate};
pub use error::{Error, Result, SharedError};
pub use fragment::Fragment;
pub use value::Value;
