// src/error.rs
//! Error handling for the whole crate.
//!
//! - **Taxonomy**: compile failures, lookup misses, invariant violations and
//!   backend (GPU object) failures each get their own variant.
//! - **Context chaining**: `Error::context` and the `Context` trait in
//!   `crate::context` wrap any error with a message.
//! - `Result<T>` alias used everywhere in the crate.

use std::fmt;
use thiserror::Error;

use crate::compiler::ShaderStage;

/// Main error type. Send + Sync + 'static so it can cross the compile thread.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O errors (uniform dumps, thread spawning).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The native compiler rejected a shader. `diagnostics` is its full output.
    #[error("{stage} shader failed to compile:\n{diagnostics}")]
    Compile {
        stage: ShaderStage,
        diagnostics: String,
    },

    /// No live material has this id.
    #[error("unknown material id {0}")]
    UnknownMaterial(u16),

    /// Ring slot index past the GPU ring depth.
    #[error("uniform slot {slot} out of range (ring depth {depth})")]
    SlotOutOfRange { slot: usize, depth: usize },

    /// A texture id was registered again with a different native handle.
    #[error("texture id {id} is already registered with a different native handle")]
    DuplicateTexture { id: i32 },

    /// Every 16-bit material id is taken by a live material.
    #[error("material id space exhausted")]
    IdSpaceExhausted,

    /// Native GPU object creation or submission failed.
    #[error("graphics backend error: {0}")]
    Backend(String),

    /// The host embedding layer was used before `ffi::install`.
    #[error("live material host is not installed")]
    NotInitialized,

    /// Simple custom message.
    #[error("{0}")]
    Custom(String),

    /// Context chaining.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    /// Formatted custom error (used by `bail!`).
    #[inline]
    pub fn format(args: fmt::Arguments) -> Self {
        Self::Custom(fmt::format(args))
    }

    #[inline]
    pub fn msg(msg: &'static str) -> Self {
        Self::Custom(msg.into())
    }

    #[inline]
    pub fn backend<S: fmt::Display>(detail: S) -> Self {
        Self::Backend(detail.to_string())
    }

    /// Wrap this error with a message.
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    // === kind checks ===
    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self.root(), Error::Io(_))
    }

    #[inline]
    pub fn is_compile(&self) -> bool {
        matches!(self.root(), Error::Compile { .. })
    }

    #[inline]
    pub fn is_backend(&self) -> bool {
        matches!(self.root(), Error::Backend(_))
    }

    /// Innermost error under any context layers.
    pub fn root(&self) -> &Error {
        let mut current = self;
        while let Error::WithContext { source, .. } = current {
            current = source;
        }
        current
    }
}

/// Convenient `Result` alias. Use `crate::Result<T>` everywhere.
pub type Result<T> = std::result::Result<T, Error>;
