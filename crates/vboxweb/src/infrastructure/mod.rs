//! Infrastructure layer for vboxweb.
//!
//! Contains the adapters that touch the outside world: the VirtualBox
//! capability interface and its protocol adapters, the SOAP/HTTP transport,
//! and file-system storage for the configuration file.
//!
//! **Dependency rule**: this layer may depend on `vbox_core`, but MUST NOT
//! import anything from `application`.

pub mod soap;
pub mod storage;
pub mod vbox_api;
