//! Anonymous sign-in hook.
//!
//! hostlink does not implement identity itself. The [`Authenticator`] trait
//! is the single call the coordinator makes during
//! [`initialize`](crate::SessionCoordinator::initialize); a platform
//! service, a signaling client, or the in-process
//! [`LocalServices`](crate::LocalServices) can sit behind it.

use hostlink_protocol::PlayerId;

use crate::SessionError;

/// Signs a player in and returns their identity.
///
/// # Example
///
/// ```rust
/// use hostlink_protocol::PlayerId;
/// use hostlink_session::{Authenticator, SessionError};
///
/// /// Always signs in as the same player. Only for tests.
/// struct FixedAuthenticator;
///
/// impl Authenticator for FixedAuthenticator {
///     async fn sign_in_anonymously(&self) -> Result<PlayerId, SessionError> {
///         Ok(PlayerId("player-test".into()))
///     }
/// }
/// ```
pub trait Authenticator: Send + Sync + 'static {
    /// Performs anonymous sign-in.
    ///
    /// # Returns
    /// - `Ok(PlayerId)`: the identity used for directory operations
    /// - `Err(SessionError::AuthenticationFailure)`: sign-in was rejected
    fn sign_in_anonymously(
        &self,
    ) -> impl std::future::Future<Output = Result<PlayerId, SessionError>> + Send;
}
