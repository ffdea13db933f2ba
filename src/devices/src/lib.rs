// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest memory, virtqueue and virtio device emulation for the vhost-user
//! block backend.

#[macro_use]
extern crate log;

pub mod virtio;
