//! Update orchestration for an installation living on removable storage.
//!
//! The engine classifies what is on the card, finds a reachable CDN, reads the
//! latest release manifest, plans the minimal set of file writes, checks free
//! space and then applies the plan file by file through a staging area. Every
//! write is a rename over the final path, so an interrupted run leaves whole
//! files behind and the next run simply plans the remainder.
//!
//! ```ignore
//! use sd_updater::{RunOutcome, UpdateEngine};
//!
//! # async fn demo() {
//! let mut engine = UpdateEngine::new(false);
//! engine.set_base_directory("/media/user/SDCARD");
//! engine.set_log_function(|event| println!("{event:?}"));
//!
//! match engine.start().await {
//!     RunOutcome::Succeeded { version } => println!("now on {version}"),
//!     RunOutcome::Failed(err) => eprintln!("{err} ({:?})", err.detail()),
//!     RunOutcome::Cancelled => println!("stopped"),
//! }
//! # }
//! ```

mod backup;
mod cdn;
mod config;
mod engine;
mod error;
mod fetcher;
mod inspect;
mod locate;
mod manifest;
mod plan;
mod progress;
mod space;
mod worker;

pub use backup::{backup_save_data, restore_save_data};
pub use cdn::CdnResolver;
pub use config::{CdnCandidate, InstallLayout, UpdaterConfig, DEFAULT_SPACE_RESERVE};
pub use engine::{RunOutcome, Stage, UpdateEngine};
pub use error::{Result, UpdateError};
pub use fetcher::{CdnFetcher, HttpCdnClient, HttpCdnClientBuilder};
pub use inspect::{inspect, installed_version, InstallationState};
pub use locate::{default_candidates, find_install_root, looks_like_sd_root, SD_CARD_MARKER};
pub use manifest::{FileAction, FileEntry, VersionManifest};
pub use plan::{plan, sha256_file, FileFingerprint, OnDiskFiles, PlannedEntry, UpdatePlan};
pub use progress::{CancellationToken, ProgressEvent, ProgressSink};
pub use space::{Fs2SpaceProbe, SpaceProbe, SpaceVerifier};
pub use worker::UpdateWorker;
