//! crossbake-lib: cross-compiling build orchestration.
//!
//! A [`BuildRecipe`] names sources, a shell script, target platforms,
//! expected products and prebuilt dependencies. [`autobuild`] runs the
//! script once per platform in a sandbox against a fixed cross toolchain,
//! audits the produced binaries and packages each prefix into a
//! reproducible, content-hashed archive:
//!
//! - `platform`: target triplets, compatibility and ABI axes
//! - `sources`: fetching and verifying source descriptors
//! - `deps`: resolving and staging prebuilt dependencies
//! - `runner`: the sandboxed build script executor
//! - `products`: locating declared products in a prefix
//! - `audit`: static inspection and relocation of binaries
//! - `package`: deterministic archives and their installation

pub mod audit;
pub mod autobuild;
pub mod consts;
pub mod deps;
pub mod package;
pub mod platform;
pub mod products;
pub mod runner;
pub mod sources;
pub mod util;
pub mod workspace;

pub use autobuild::{
  BuildContext, BuildError, BuildOptions, BuildRecipe, BuildReport, PlatformFailure, ValidationError, autobuild,
};
pub use platform::Platform;
