//! Crate-level error type.

use thiserror::Error;

use crate::node::RegistrationError;
use crate::offers::OfferError;
use crate::operations::{BindError, ScheduleError};
use crate::podtask::RegistryError;
use crate::store::StoreError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Offer(#[from] OfferError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;
