//! Variant-aware build identity and release publication for Bonsai.
//!
//! One release run takes a source tree and produces one artifact per
//! (platform, runtime) cell, gives each artifact a build identity that is
//! comparable across packaging variants, and publishes every artifact into a
//! single release.
//!
//! - **Variant priorities** - variant flag sets mapped to build number offsets
//! - **Build identities** - build strings and compatible pins
//! - **Matrix** - cell expansion and a fail-open worker pool
//! - **Build driver** - toolchain invocation and artifact location
//! - **Release publisher** - converging release target, atomic per-asset puts
//!
//! # Architecture
//!
//! ```text
//! bonsai-release
//!     │
//!     ├── preflight: repository gate, VERSION file, host tools
//!     ├── matrix::expand: platforms × runtimes
//!     │
//!     ├── per cell (parallel, fail-open):
//!     │       identity → driver::BuildDriver → release::Publisher
//!     │
//!     └── run_manifest: per-run record of every cell
//! ```
//!
//! # Example
//!
//! ```rust
//! use bonsai_release::identity::BuildIdentity;
//! use bonsai_release::variant::{PriorityTable, VariantSet};
//!
//! let table = PriorityTable::ifcopenshell_default();
//! let novtk = VariantSet::new().with("variant", "novtk");
//! let identity =
//!     BuildIdentity::for_variant(&table, "0.8.0", 0, &novtk, "py311", None).unwrap();
//! assert_eq!(identity.build_string(), "py311_novtk_unhashed_200");
//! ```

pub mod config;
pub mod driver;
pub mod error;
mod fsutil;
pub mod identity;
pub mod matrix;
pub mod orchestrator;
pub mod preflight;
pub mod release;
pub mod run_manifest;
pub mod variant;

pub use config::{load_config, ReleaseConfig};
pub use driver::{ArtifactRef, BuildDriver, CommandToolchain, Toolchain, ToolchainRequest};
pub use error::{BuildError, CellError, ConfigError, OrchestrationError, PublishError};
pub use identity::BuildIdentity;
pub use matrix::{expand, run_cells, CancelFlag, MatrixCell, RunStatus};
pub use orchestrator::{plan_release, run_release, Orchestrator, RunOptions, RunSummary};
pub use release::{Channel, Publisher, ReleaseBackend, ReleaseTarget};
pub use variant::{PriorityTable, VariantSet};
