// src/context.rs
//! Context extension traits and early-return macros for crate errors.
//!
//! `.context()` / `.with_context()` work on any `Result` whose error converts
//! into [`Error`], and on `Option`. `bail!` and `ensure!` build crate errors.

use crate::error::{Error, Result};

/// `.context()` / `.with_context()` on any `Result`.
pub trait Context<T, E> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    /// Lazy variant; the closure only runs on the error path.
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    #[inline]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.map_err(|err| err.into().context(context))
    }

    #[inline]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|err| err.into().context(f()))
    }
}

/// `Option<T>` to `Result<T>` with a message.
pub trait OptionContext<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> OptionContext<T> for Option<T> {
    #[inline]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.ok_or_else(|| Error::custom(context))
    }

    #[inline]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.ok_or_else(|| Error::custom(f()))
    }
}

// ====================== CONVENIENCE MACROS ======================

/// Early return with an error: `bail!("msg")`, `bail!(err)` or formatted.
#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::error::Error::msg($msg))
    };
    ($err:expr $(,)?) => {
        return Err(Into::<$crate::error::Error>::into($err))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::error::Error::format(format_args!($fmt, $($arg)*)))
    };
}

/// `bail!` unless the condition holds. The second form returns a given error value.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $msg:literal $(,)?) => {
        if !($cond) {
            $crate::bail!($msg);
        }
    };
    ($cond:expr, $err:expr $(,)?) => {
        if !($cond) {
            $crate::bail!($err);
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::bail!($fmt, $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_slot(slot: usize) -> Result<usize> {
        ensure!(
            slot < 4,
            Error::SlotOutOfRange {
                slot,
                depth: 4
            }
        );
        Ok(slot)
    }

    #[test]
    fn test_ensure_returns_given_error() {
        assert_eq!(check_slot(3).ok(), Some(3));
        assert!(matches!(
            check_slot(9),
            Err(Error::SlotOutOfRange { slot: 9, depth: 4 })
        ));
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let err = missing.context("no uniform named 'color'").unwrap_err();
        assert_eq!(err.to_string(), "no uniform named 'color'");
    }

    #[test]
    fn test_result_context_wraps_io() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        let err = res.with_context(|| "writing dump").unwrap_err();
        assert!(err.is_io());
    }
}
