// Copyright 2026, Red Hat Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Vhost-user backend ("slave") control plane.
//!
//! Implements the wire protocol a hypervisor master speaks over a unix
//! stream socket: feature negotiation, guest memory table installation,
//! per-vring configuration and the kick/call eventfd plumbing. The actual
//! request processing is delegated to a [`VhostUserDevice`] implementation.

#[macro_use]
extern crate log;

pub mod connection;
pub mod dev;
pub mod message;

pub use dev::{Error, VhostDev, VhostUserDevice, Vring};
