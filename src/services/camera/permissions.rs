use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthorizationStatus {
    Authorized,
    NotDetermined,
    /// Denied or restricted by policy
    Denied,
}

/// Camera authorization as provided by the host platform
#[async_trait]
pub trait CameraPermissions: Send + Sync {
    fn status(&self) -> AuthorizationStatus;
    /// Prompt the user; true if access was granted
    async fn request(&self) -> bool;
}

/// Permissions with a preset answer, for hosts without a prompt
pub struct FixedPermissions {
    status: Mutex<AuthorizationStatus>,
    grant_on_request: bool,
    requests: AtomicUsize,
}

impl FixedPermissions {
    pub fn new(status: AuthorizationStatus, grant_on_request: bool) -> Self {
        Self {
            status: Mutex::new(status),
            grant_on_request,
            requests: AtomicUsize::new(0),
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CameraPermissions for FixedPermissions {
    fn status(&self) -> AuthorizationStatus {
        *self.status.lock()
    }

    async fn request(&self) -> bool {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let mut status = self.status.lock();
        if *status == AuthorizationStatus::NotDetermined {
            *status = if self.grant_on_request {
                AuthorizationStatus::Authorized
            } else {
                AuthorizationStatus::Denied
            };
        }
        *status == AuthorizationStatus::Authorized
    }
}
