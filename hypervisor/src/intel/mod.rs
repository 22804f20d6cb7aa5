//! Intel VT-x specifics: the VM-exit entry stub, the handlers and the
//! processor facilities they are built on.

pub mod capture;
pub mod ept;
pub mod events;
pub mod guest_view;
pub mod platform;
pub mod processor;
pub mod support;
pub mod vmerror;
pub mod vmexit;
pub mod vmexit_handler;

#[cfg(test)]
pub mod mock;
