//! Sign-in boundary used by the sweep to refresh expiring sessions.

use crate::errors::GatewayError;
use crate::sessions::SessionSnapshot;
use async_trait::async_trait;
use common::jwt::TokenUser;

/// Re-authenticates a session whose token is about to expire.
#[async_trait]
pub trait SigninService: Send + Sync {
    /// Current profile for the session's user, or `None` if the user may no
    /// longer sign in.
    async fn refresh(&self, session: &SessionSnapshot) -> Result<Option<TokenUser>, GatewayError>;
}

/// Mock sign-in service for testing.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Echo,
        NoUser,
        Failing,
    }

    /// Mock sign-in collaborator.
    pub struct MockSigninService {
        behavior: Behavior,
        call_count: AtomicUsize,
    }

    impl MockSigninService {
        /// Returns the user already carried by the session.
        pub fn echoing() -> Self {
            Self {
                behavior: Behavior::Echo,
                call_count: AtomicUsize::new(0),
            }
        }

        /// Returns no user (sign-in refused).
        pub fn refusing() -> Self {
            Self {
                behavior: Behavior::NoUser,
                call_count: AtomicUsize::new(0),
            }
        }

        /// Returns an error.
        pub fn failing() -> Self {
            Self {
                behavior: Behavior::Failing,
                call_count: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SigninService for MockSigninService {
        async fn refresh(
            &self,
            session: &SessionSnapshot,
        ) -> Result<Option<TokenUser>, GatewayError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Echo => Ok(session.user.clone()),
                Behavior::NoUser => Ok(None),
                Behavior::Failing => Err(GatewayError::Signin("mock sign-in failed".to_string())),
            }
        }
    }
}
