// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Run-scoped context: timing callbacks, cooperative cancellation, and the
//! injected file-system used by the cache layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache_store::{CacheFs, RealFs};
use crate::error::{Error, Result};

/// A cooperative cancellation signal.
///
/// The core polls the token between packages; it never interrupts a package
/// mid-generation.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

type TimingFn = Box<dyn Fn(&str, Duration) + Send + Sync>;

/// Carries the per-run collaborators through the pipeline.
///
/// The default context has no timing callback, a fresh cancel token, and the
/// real file system. Tests swap in a scratch cache root or a faulty
/// file-system through [`Ctx::with_fs`].
pub struct Ctx {
    timing: Option<TimingFn>,
    cancel: CancelToken,
    pub(crate) fs: Arc<dyn CacheFs>,
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new()
    }
}

impl Ctx {
    #[must_use]
    pub fn new() -> Self {
        Self {
            timing: None,
            cancel: CancelToken::new(),
            fs: Arc::new(RealFs::new()),
        }
    }

    /// Attaches a timing callback invoked at labeled stage boundaries.
    #[must_use]
    pub fn with_timing(mut self, logf: impl Fn(&str, Duration) + Send + Sync + 'static) -> Self {
        self.timing = Some(Box::new(logf));
        self
    }

    /// Uses an externally owned cancel token.
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Replaces the file system handle used by the cache layer.
    #[must_use]
    pub fn with_fs(mut self, fs: Arc<dyn CacheFs>) -> Self {
        self.fs = fs;
        self
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Fails with [`Error::Canceled`] once the token fires.
    pub fn check_canceled(&self) -> Result<()> {
        if self.cancel.is_canceled() {
            return Err(Error::Canceled);
        }
        Ok(())
    }

    /// Reports the elapsed time since `start` under `label`.
    pub(crate) fn log_timing(&self, label: &str, start: Instant) {
        if let Some(logf) = &self.timing {
            logf(label, start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn cancel_token_round_trip() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        token.cancel();
        assert!(token.is_canceled());

        let ctx = Ctx::new().with_cancel(token);
        assert!(matches!(ctx.check_canceled(), Err(Error::Canceled)));
    }

    #[test]
    fn timing_callback_sees_labels() {
        let labels: Arc<Mutex<Vec<String>>> = Arc::default();
        let seen = labels.clone();
        let ctx = Ctx::new().with_timing(move |label, _| {
            seen.lock().unwrap().push(label.to_string());
        });
        ctx.log_timing("load.packages", Instant::now());
        assert_eq!(labels.lock().unwrap().as_slice(), ["load.packages"]);
    }
}
