// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub use vmm_sys_util::eventfd;
pub use vmm_sys_util::{errno, tempdir, tempfile};

pub mod epoll;
