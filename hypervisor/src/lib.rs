//! VM-exit handling core of a thin, single-guest Intel VT-x monitor.
//!
//! The monitor setup virtualizes each processor and points the VMCS host RIP
//! at [`intel::vmexit_handler::vmm_vmexit_entry`]. From then on every VM-exit
//! runs through [`vmm::handle_vmexit`] until the guest asks for termination.

#![cfg_attr(not(test), no_std)]

extern crate static_assertions;

pub mod error;
pub mod global_const;
pub mod intel;
pub mod logger;
pub mod vmm;
