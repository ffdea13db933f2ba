// Copyright 2026, Red Hat Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! vublkd: a vhost-user block device backend.
//!
//! Serves a raw disk image to a hypervisor over the vhost-user protocol.
//! Everything runs on one event loop thread: control messages, queue
//! processing and disk I/O.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use log::{info, LevelFilter};

use polly::event_manager::EventManager;
use vhost::VhostDev;

mod backend;
mod disk;

use backend::VhostBlk;
use disk::DiskProperties;

#[derive(Parser, Debug)]
#[command(about = "vhost-user block device backend")]
struct Args {
    /// Path of the listening vhost-user socket; must not exist yet.
    #[arg(long)]
    socket: PathBuf,

    /// Raw disk image to serve.
    #[arg(long)]
    disk: PathBuf,

    /// Expose the device read-only.
    #[arg(long)]
    read_only: bool,

    /// Advertise a writeback cache and honor flush requests.
    #[arg(long)]
    writeback: bool,

    /// Block size reported to the guest, a multiple of 512.
    #[arg(long, default_value_t = 512)]
    block_size: u32,

    /// Number of request queues to expose.
    #[arg(long, default_value_t = 1)]
    num_queues: usize,
}

fn main() -> anyhow::Result<()> {
    env_logger::builder().filter_level(LevelFilter::Info).init();
    let args = Args::parse();

    let disk = DiskProperties::new(&args.disk, args.read_only, args.writeback)
        .with_context(|| format!("failed to open disk image {}", args.disk.display()))?;
    info!(
        "serving {} ({} sectors{})",
        args.disk.display(),
        disk.nsectors(),
        if args.read_only { ", read-only" } else { "" }
    );

    let device = VhostBlk::new(disk, args.block_size).context("failed to create block device")?;
    let dev = Arc::new(Mutex::new(
        VhostDev::new(Box::new(device), args.num_queues, &args.socket)
            .context("failed to create device server")?,
    ));

    let mut event_manager = EventManager::new().context("failed to create event loop")?;
    event_manager
        .add_subscriber(dev)
        .context("failed to register device server")?;

    info!("listening on {}", args.socket.display());
    loop {
        event_manager
            .run()
            .context("event loop failed")?;
    }
}
