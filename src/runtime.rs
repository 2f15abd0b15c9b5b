//! Running token calls without stalling the action router.
//!
//! Calls into a token may take a long time: a PKCS#11 library can wait for
//! a card reader, and a token with a protected authentication path only
//! returns from a login once the user has typed the PIN on the device. The
//! router itself is cooperative, so such calls are moved to the blocking
//! thread pool of the Tokio runtime and the result is handed back through a
//! oneshot channel.

use std::{error, fmt};

use tokio::sync::oneshot;

//------------ run_blocking --------------------------------------------------

/// Runs a blocking operation on the blocking thread pool and awaits its
/// result.
///
/// Must be called from within a Tokio runtime. If the operation panics the
/// result channel is dropped and a [`RunError`] is returned instead.
pub async fn run_blocking<F, T>(op: F) -> Result<T, RunError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let _ = tokio::task::spawn_blocking(move || {
        let _ = tx.send(op());
    });
    rx.await.map_err(Into::into)
}

//------------ RunError ------------------------------------------------------

/// A blocking operation ended without producing a result.
#[derive(Clone, Debug)]
pub struct RunError(String);

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl error::Error for RunError {}

impl From<oneshot::error::RecvError> for RunError {
    fn from(_: oneshot::error::RecvError) -> Self {
        RunError("blocking operation terminated without a result".into())
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_result_of_operation() {
        let res = run_blocking(|| 40 + 2).await.unwrap();
        assert_eq!(res, 42);
    }

    #[tokio::test]
    async fn panicking_operation_is_an_error() {
        let res: Result<(), RunError> = run_blocking(|| panic!("boom")).await;
        assert!(res.is_err());
    }
}
