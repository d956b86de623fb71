//! # nandroid
//!
//! Partition backup and restore for recovery environments.
//!
//! ## Features
//!
//! - **Per-partition strategies**: raw images for raw media, yaffs2 images for flash-native
//!   filesystems, and tar, gzipped tar or deduplicated archives for everything else
//! - **All-or-abort runs**: partitions are processed in a fixed order and the first failure
//!   ends the run
//! - **Restore auto-detection**: the artifact found on disk decides the filesystem to recreate
//!   and the extractor to run
//! - **Shared blob store**: deduplicated archives share content across runs, collected once
//!   per run before new descriptors are written
//! - **Streaming**: single partitions can be dumped to standard output and read back
//!
//! ## Quick Start
//!
//! ```no_run
//! use nandroid::engine::command::SystemSpawner;
//! use nandroid::engine::config::NandroidConfig;
//! use nandroid::engine::pipeline::Nandroid;
//! use nandroid::engine::ui::TracingUi;
//! use nandroid::engine::volume::CommandVolumes;
//!
//! let config = NandroidConfig::load("nandroid.yml")?;
//! let volumes = CommandVolumes::new(config.clone(), SystemSpawner);
//! let mut nandroid = Nandroid::new(config, volumes, TracingUi::default(), SystemSpawner);
//! let path = nandroid.config().timestamped_backup_path(chrono::Local::now());
//! nandroid.backup(&path, None)?;
//! # Ok::<(), nandroid::engine::result_error::error::Error>(())
//! ```

pub mod engine;
