// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Single-threaded, epoll-based event dispatch.

#[macro_use]
extern crate log;

pub mod event_manager;
