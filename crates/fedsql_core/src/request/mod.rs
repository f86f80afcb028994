//! Turning client requests into executable plans.

pub mod command;
pub mod context;
pub mod message;
pub mod planner;
pub mod request;
pub mod request_id;
pub mod validator;

use std::sync::Arc;

use crate::metadata::QueryMetadata;
use validator::{AllowAllValidator, AuthorizationValidator};

/// Client session a request is submitted in.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub user: String,
    /// Metadata of the VDB the session is connected to.
    pub metadata: Arc<dyn QueryMetadata>,
    pub validator: Arc<dyn AuthorizationValidator>,
}

impl SessionContext {
    pub fn new(
        session_id: impl Into<String>,
        user: impl Into<String>,
        metadata: Arc<dyn QueryMetadata>,
    ) -> Self {
        SessionContext {
            session_id: session_id.into(),
            user: user.into(),
            metadata,
            validator: Arc::new(AllowAllValidator),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn AuthorizationValidator>) -> Self {
        self.validator = validator;
        self
    }
}
