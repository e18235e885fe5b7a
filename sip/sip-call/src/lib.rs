//! # SIP call control
//!
//! Call-control engine on top of the ezk SIP stack: drives calls through
//! their INVITE sessions and exposes the operations a softphone needs.
//!
//! Notable types are
//!
//! - [`CallAgent`] owns the call table and executes every call operation
//! - [`CallHandler`] the application's view on call progress
//! - [`MediaSession`]/[`MediaFactory`] the interface of the external media
//!   engine
//! - [`Account`] the identity calls are made and received with
//!
//! Reliable provisional responses (RFC 3262), call hold, blind and
//! attended transfer (RFC 3515/3891/4488) and forked-dialog cleanup are
//! handled internally.
//!
//! The modules [`dialog`] and [`invite`] contain the lower level building
//! blocks and can be used directly for more specialized use cases.

pub mod account;
pub mod call;
pub mod dialog;
pub mod invite;
pub mod media;

mod error;
mod rel100;
mod util;

pub use account::{Account, AccountId};
pub use call::{
    CallAgent, CallAgentConfig, CallHandler, CallId, CallInfo, DefaultCallHandler, InviteState,
    RedirectAction, XferOptions,
};
pub use error::{CallError, Result};
pub use media::{MediaError, MediaFactory, MediaSession, RtpContinuity, SecureLevel, SrtpUse};
