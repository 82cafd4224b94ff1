//! Cooperative cancellation: one token, checked by every blocking
//! operation. SIGINT flips it; polling loops observe it between attempts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use color_eyre::Result;

use crate::errors::Error;

static SIGINT_FLAG: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    /// Tokens handed to the CLI also observe the process-wide SIGINT flag.
    follow_sigint: bool,
}

impl CancelToken {
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || (self.follow_sigint && SIGINT_FLAG.load(Ordering::SeqCst))
    }

    /// Error early when cancelled; call between blocking steps.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled.into());
        }
        Ok(())
    }

    /// Token wired to Ctrl-C for interactive invocations.
    pub fn for_cli() -> Self {
        install_sigint_handler();
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            follow_sigint: true,
        }
    }
}

extern "C" fn on_sigint(_: libc::c_int) {
    SIGINT_FLAG.store(true, Ordering::SeqCst);
}

fn install_sigint_handler() {
    // Idempotent; re-registering the same handler is harmless.
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_live() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn cancelled_token_reports_exit_6() {
        let token = CancelToken::new();
        token.cancel();
        let err = token.check().unwrap_err();
        assert_eq!(crate::errors::exit_code_of(&err), 6);
    }

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
